//! FIG type 0 encoders (MCI and ensemble information, ETSI EN 300 401
//! section 6).
#![allow(non_camel_case_types)] // Fig0_1 etc. mirror the FIG numbering.
//!
//! Every FIG 0 starts with the FIG header byte (type ‖ length) and one
//! byte of C/N, OE, P/D flags and the extension number. Multi-entry
//! extensions batch as many entries as fit; leftovers go out under a
//! fresh header on the next call.

use bytes::BufMut;

use super::{FigCtx, FillStatus};

/// Largest FIG payload: a FIB body is 30 bytes and the length field
/// counts everything after the header byte.
const MAX_PAYLOAD: usize = 29;

/// One encoded entry plus the P/D flag its FIG block must carry.
struct Entry {
    pd: bool,
    bytes: Vec<u8>,
}

impl Entry {
    fn programme(bytes: Vec<u8>) -> Self {
        Entry { pd: false, bytes }
    }
}

/// Writes one FIG 0 block: header byte, flags/extension byte, then every
/// consecutive same-P/D entry that fits. Advances `*next` and reports
/// whether the entry cycle finished.
fn fill_entries(next: &mut usize, entries: &[Entry], ext: u8, buf: &mut [u8]) -> FillStatus {
    if entries.is_empty() {
        *next = 0;
        return FillStatus { written: 0, complete: true };
    }
    if *next >= entries.len() {
        *next = 0;
    }
    let pd = entries[*next].pd;
    let mut payload = 1usize; // flags/extension byte
    let mut taken = 0usize;
    while *next + taken < entries.len() && entries[*next + taken].pd == pd {
        let l = entries[*next + taken].bytes.len();
        if payload + l > MAX_PAYLOAD || 1 + payload + l > buf.len() {
            break;
        }
        payload += l;
        taken += 1;
    }
    if taken == 0 {
        return FillStatus { written: 0, complete: false };
    }
    buf[0] = payload as u8; // FIG type 0 in the top bits is zero
    buf[1] = if pd { 0x20 } else { 0x00 } | (ext & 0x1F);
    let mut off = 2;
    for entry in &entries[*next..*next + taken] {
        buf[off..off + entry.bytes.len()].copy_from_slice(&entry.bytes);
        off += entry.bytes.len();
    }
    *next += taken;
    let complete = *next >= entries.len();
    if complete {
        *next = 0;
    }
    FillStatus { written: off, complete }
}

/// FIG 0/0 — ensemble information. Transmitted in every frame's FIB 0.
#[derive(Default)]
pub struct Fig0_0;

impl Fig0_0 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        if buf.len() < 6 {
            return FillStatus { written: 0, complete: false };
        }
        let e = ctx.ensemble;
        let cif_hi = ((ctx.cif_count / 250) % 20) as u8;
        let cif_lo = (ctx.cif_count % 250) as u8;
        buf[0] = 5;
        buf[1] = 0x00; // C/N, OE, P/D all zero, extension 0
        buf[2] = (e.id >> 8) as u8;
        buf[3] = e.id as u8;
        // Change flags (2, no change pending), alarm flag, CIF count.
        buf[4] = (if e.alarm_flag { 0x20 } else { 0 }) | (cif_hi & 0x1F);
        buf[5] = cif_lo;
        FillStatus { written: 6, complete: true }
    }
}

/// FIG 0/1 — basic subchannel organization.
#[derive(Default)]
pub struct Fig0_1 {
    next: usize,
}

impl Fig0_1 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let entries: Vec<Entry> = ctx
            .ensemble
            .subchannels
            .iter()
            .map(|sub| {
                let mut b = Vec::with_capacity(4);
                b.put_u8((sub.id << 2) | ((sub.start_address >> 8) as u8 & 0x03));
                b.put_u8(sub.start_address as u8);
                match sub.protection {
                    crate::ensemble::Protection::Uep { level } => {
                        let idx =
                            crate::ensemble::uep_table_index(sub.bitrate, level).unwrap_or(0);
                        // Short form: table switch 0, table index.
                        b.put_u8(idx & 0x3F);
                    }
                    crate::ensemble::Protection::Eep { profile, level } => {
                        let size = sub.protection.size_cu(sub.bitrate).unwrap_or(0);
                        b.put_u8(
                            0x80 | (profile.option() << 4)
                                | ((level.saturating_sub(1) & 0x03) << 2)
                                | ((size >> 8) as u8 & 0x03),
                        );
                        b.put_u8(size as u8);
                    }
                }
                Entry::programme(b)
            })
            .collect();
        fill_entries(&mut self.next, &entries, 1, buf)
    }
}

/// FIG 0/2 — basic service organization.
#[derive(Default)]
pub struct Fig0_2 {
    next: usize,
}

impl Fig0_2 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let e = ctx.ensemble;
        let entries: Vec<Entry> = e
            .services
            .iter()
            .map(|svc| {
                let comps: Vec<_> = e.components_of(svc.id).collect();
                let mut b = Vec::with_capacity(4 + 2 * comps.len());
                let pd = !svc.is_programme();
                if pd {
                    b.put_u32(svc.id);
                } else {
                    b.put_u16(svc.id as u16);
                }
                // Local flag 0, CAId 0.
                b.put_u8((comps.len().min(15)) as u8);
                for (i, comp) in comps.iter().enumerate().take(15) {
                    let sub = e.subchannel_by_id(comp.subchannel_id);
                    let primary = i == 0;
                    match (&comp.packet, sub.map(|s| s.typ)) {
                        (Some(pkt), _) => {
                            // TMId 3: MSC packet data.
                            b.put_u8(0xC0 | ((pkt.scid >> 6) as u8 & 0x3F));
                            b.put_u8(
                                ((pkt.scid << 2) as u8)
                                    | if primary { 0x02 } else { 0x00 },
                            );
                        }
                        (None, typ) => {
                            // TMId 0: MSC stream audio; TMId 1: stream data.
                            let tmid = match typ {
                                Some(crate::ensemble::SubchannelType::Dmb) => 1u8,
                                _ => 0u8,
                            };
                            b.put_u8((tmid << 6) | (comp.typ & 0x3F));
                            b.put_u8(
                                (comp.subchannel_id << 2)
                                    | if primary { 0x02 } else { 0x00 },
                            );
                        }
                    }
                }
                Entry { pd, bytes: b }
            })
            .collect();
        fill_entries(&mut self.next, &entries, 2, buf)
    }
}

/// FIG 0/3 — service component in packet mode.
#[derive(Default)]
pub struct Fig0_3 {
    next: usize,
}

impl Fig0_3 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let entries: Vec<Entry> = ctx
            .ensemble
            .components
            .iter()
            .filter_map(|comp| comp.packet.as_ref().map(|pkt| (comp, pkt)))
            .map(|(comp, pkt)| {
                let mut b = Vec::with_capacity(5);
                b.put_u8((pkt.scid >> 4) as u8);
                // SCId low nibble, rfa, CAOrg flag 0.
                b.put_u8(((pkt.scid << 4) as u8) & 0xF0);
                // DG flag is transmitted inverted (1 = no data groups).
                b.put_u8(
                    (if pkt.datagroup { 0x00 } else { 0x80 }) | (pkt.dscty & 0x3F),
                );
                b.put_u8((comp.subchannel_id << 2) | ((pkt.address >> 8) as u8 & 0x03));
                b.put_u8(pkt.address as u8);
                Entry::programme(b)
            })
            .collect();
        fill_entries(&mut self.next, &entries, 3, buf)
    }
}

/// FIG 0/8 — service component global definition.
#[derive(Default)]
pub struct Fig0_8 {
    next: usize,
}

impl Fig0_8 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let e = ctx.ensemble;
        let entries: Vec<Entry> = e
            .components
            .iter()
            .filter_map(|comp| e.service_by_id(comp.service_id).map(|svc| (comp, svc)))
            .map(|(comp, svc)| {
                let pd = !svc.is_programme();
                let mut b = Vec::with_capacity(7);
                if pd {
                    b.put_u32(svc.id);
                } else {
                    b.put_u16(svc.id as u16);
                }
                b.put_u8(comp.scids & 0x0F);
                match &comp.packet {
                    Some(pkt) => {
                        // Long form: 12-bit SCId.
                        b.put_u8(0x80 | ((pkt.scid >> 8) as u8 & 0x0F));
                        b.put_u8(pkt.scid as u8);
                    }
                    None => {
                        // Short form: MSC stream, SubChId.
                        b.put_u8(comp.subchannel_id & 0x3F);
                    }
                }
                Entry { pd, bytes: b }
            })
            .collect();
        fill_entries(&mut self.next, &entries, 8, buf)
    }
}

/// FIG 0/9 — country, LTO and international table.
#[derive(Default)]
pub struct Fig0_9;

impl Fig0_9 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        if buf.len() < 5 {
            return FillStatus { written: 0, complete: false };
        }
        let e = ctx.ensemble;
        let lto = if e.lto_auto {
            crate::timestamp::local_time_offset_half_hours()
        } else {
            e.lto
        };
        // Sign and magnitude in half-hours.
        let lto_field = if lto < 0 { 0x20 | ((-lto) as u8 & 0x1F) } else { lto as u8 & 0x1F };
        buf[0] = 4;
        buf[1] = 0x09;
        buf[2] = lto_field;
        buf[3] = e.ecc;
        buf[4] = e.international_table;
        FillStatus { written: 5, complete: true }
    }
}

/// FIG 0/10 — date and time.
#[derive(Default)]
pub struct Fig0_10;

impl Fig0_10 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        if !ctx.ensemble.datetime_enabled {
            return FillStatus { written: 0, complete: true };
        }
        if buf.len() < 6 {
            return FillStatus { written: 0, complete: false };
        }
        let (mjd, hours, minutes, _) = crate::timestamp::utc_fields(&ctx.now);
        // Short form: RFU, MJD(17), LSI 0, confidence 1, UTC flag 0,
        // hours(5), minutes(6).
        buf[0] = 5;
        buf[1] = 0x0A;
        buf[2] = ((mjd >> 10) & 0x7F) as u8;
        buf[3] = (mjd >> 2) as u8;
        buf[4] = (((mjd & 0x03) as u8) << 6) | 0x10 | ((hours >> 2) & 0x07);
        buf[5] = ((hours & 0x03) << 6) | (minutes & 0x3F);
        FillStatus { written: 6, complete: true }
    }
}

/// FIG 0/13 — user application information.
#[derive(Default)]
pub struct Fig0_13 {
    next: usize,
}

impl Fig0_13 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let e = ctx.ensemble;
        let entries: Vec<Entry> = e
            .components
            .iter()
            .filter(|comp| !comp.user_apps.is_empty())
            .filter_map(|comp| e.service_by_id(comp.service_id).map(|svc| (comp, svc)))
            .map(|(comp, svc)| {
                let pd = !svc.is_programme();
                let mut b = Vec::new();
                if pd {
                    b.put_u32(svc.id);
                } else {
                    b.put_u16(svc.id as u16);
                }
                b.put_u8(((comp.scids & 0x0F) << 4) | (comp.user_apps.len().min(15) as u8));
                for ua in comp.user_apps.iter().take(15) {
                    // X-PAD applications carry one data byte with the
                    // X-PAD application type; packet components none.
                    let xpad = comp.packet.is_none();
                    b.put_u8((ua.ua_type >> 3) as u8);
                    b.put_u8(((ua.ua_type << 5) as u8) | if xpad { 1 } else { 0 });
                    if xpad {
                        b.put_u8(ua.xpad_app_type & 0x1F);
                    }
                }
                Entry { pd, bytes: b }
            })
            .collect();
        fill_entries(&mut self.next, &entries, 13, buf)
    }
}

/// FIG 0/17 — programme type.
#[derive(Default)]
pub struct Fig0_17 {
    next: usize,
}

impl Fig0_17 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let entries: Vec<Entry> = ctx
            .ensemble
            .services
            .iter()
            .filter(|svc| svc.is_programme() && svc.pty.pty != 0)
            .map(|svc| {
                let mut b = Vec::with_capacity(5);
                b.put_u16(svc.id as u16);
                let lang = svc.language != 0;
                b.put_u8(
                    (if svc.pty.dynamic_no_static { 0x80 } else { 0 })
                        | (if lang { 0x20 } else { 0 }),
                );
                if lang {
                    b.put_u8(svc.language);
                }
                b.put_u8(svc.pty.pty & 0x1F);
                Entry::programme(b)
            })
            .collect();
        fill_entries(&mut self.next, &entries, 17, buf)
    }
}

/// FIG 0/18 — announcement support.
#[derive(Default)]
pub struct Fig0_18 {
    next: usize,
}

impl Fig0_18 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let entries: Vec<Entry> = ctx
            .ensemble
            .services
            .iter()
            .filter(|svc| svc.is_programme() && svc.asu != 0)
            .map(|svc| {
                let mut b = Vec::with_capacity(5 + svc.clusters.len());
                b.put_u16(svc.id as u16);
                b.put_u16(svc.asu);
                b.put_u8(svc.clusters.len().min(31) as u8);
                for &cluster in svc.clusters.iter().take(31) {
                    b.put_u8(cluster);
                }
                Entry::programme(b)
            })
            .collect();
        fill_entries(&mut self.next, &entries, 18, buf)
    }
}

/// FIG 0/19 — announcement switching.
#[derive(Default)]
pub struct Fig0_19 {
    next: usize,
}

impl Fig0_19 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let entries: Vec<Entry> = ctx
            .ensemble
            .announcements
            .iter()
            .map(|ann| {
                let mut b = Vec::with_capacity(4);
                b.put_u8(ann.cluster);
                b.put_u16(ann.asw);
                // New flag set, region flag clear.
                b.put_u8(0x80 | (ann.subchannel_id & 0x3F));
                Entry::programme(b)
            })
            .collect();
        fill_entries(&mut self.next, &entries, 19, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::*;
    use chrono::TimeZone;

    fn ctx_ensemble() -> DabEnsemble {
        let mut e = DabEnsemble {
            id: 0xCE15,
            ecc: 0xE1,
            label: DabLabel::new("Test", "Test").unwrap(),
            mode: TransmissionMode::I,
            lto_auto: false,
            lto: 2,
            international_table: 1,
            alarm_flag: false,
            mnsc: 0,
            datetime_enabled: true,
            services: vec![DabService {
                uid: "radio1".into(),
                id: 0x5001,
                ecc: 0,
                label: DabLabel::new("Radio One", "Radio").unwrap(),
                pty: PtySettings { pty: 10, dynamic_no_static: false },
                language: 9,
                asu: 0x0001,
                clusters: vec![1],
            }],
            components: vec![DabComponent {
                uid: "comp1".into(),
                label: None,
                service_id: 0x5001,
                subchannel_id: 0,
                typ: 0,
                scids: 0,
                packet: None,
                user_apps: vec![],
                dynamic_label: None,
            }],
            subchannels: vec![DabSubchannel {
                uid: "audio1".into(),
                id: 0,
                typ: SubchannelType::DabAudio,
                start_address: 0,
                bitrate: 128,
                protection: Protection::Uep { level: 2 },
                input_uri: String::new(),
                pad: None,
            }],
            announcements: vec![],
        };
        e.assign_start_addresses().unwrap();
        e
    }

    fn ctx<'a>(e: &'a DabEnsemble) -> FigCtx<'a> {
        FigCtx {
            ensemble: e,
            cif_count: 272, // 1*250 + 22
            now: chrono::Utc.ymd(2024, 6, 1).and_hms(12, 30, 0),
        }
    }

    #[test]
    fn fig0_0_layout() {
        let e = ctx_ensemble();
        let mut buf = [0u8; 30];
        let st = Fig0_0::default().fill(&ctx(&e), &mut buf);
        assert!(st.complete);
        assert_eq!(st.written, 6);
        assert_eq!(buf[0], 5); // type 0, length 5
        assert_eq!(buf[1], 0x00);
        assert_eq!(&buf[2..4], &[0xCE, 0x15]);
        assert_eq!(buf[4], 1); // CIF hi = 272/250
        assert_eq!(buf[5], 22); // CIF lo = 272%250
    }

    #[test]
    fn fig0_0_needs_six_bytes() {
        let e = ctx_ensemble();
        let mut buf = [0u8; 5];
        let st = Fig0_0::default().fill(&ctx(&e), &mut buf);
        assert_eq!(st.written, 0);
        assert!(!st.complete);
    }

    #[test]
    fn fig0_1_short_form() {
        let e = ctx_ensemble();
        let mut buf = [0u8; 30];
        let st = Fig0_1::default().fill(&ctx(&e), &mut buf);
        assert!(st.complete);
        assert_eq!(st.written, 5);
        assert_eq!(buf[0], 4);
        assert_eq!(buf[1], 0x01);
        assert_eq!(buf[2], 0x00); // SubChId 0, start address 0
        assert_eq!(buf[3], 0x00);
        assert_eq!(buf[4], 35); // UEP table index for 128 kbps level 2
    }

    #[test]
    fn fig0_1_eep_long_form() {
        let mut e = ctx_ensemble();
        e.subchannels[0].bitrate = 48;
        e.subchannels[0].protection =
            Protection::Eep { profile: EepProfile::A, level: 3 };
        let mut buf = [0u8; 30];
        let st = Fig0_1::default().fill(&ctx(&e), &mut buf);
        assert_eq!(st.written, 6);
        // Long-form flag, option 0, level 3 -> field 2, size 36 CU.
        assert_eq!(buf[4], 0x80 | (2 << 2));
        assert_eq!(buf[5], 36);
    }

    #[test]
    fn fig0_2_audio_component() {
        let e = ctx_ensemble();
        let mut buf = [0u8; 30];
        let st = Fig0_2::default().fill(&ctx(&e), &mut buf);
        assert!(st.complete);
        assert_eq!(buf[1], 0x02);
        assert_eq!(&buf[2..4], &[0x50, 0x01]); // SId
        assert_eq!(buf[4], 1); // one component
        assert_eq!(buf[5], 0x00); // TMId 0, ASCTy 0
        assert_eq!(buf[6], 0x02); // SubChId 0, primary
    }

    #[test]
    fn fig0_9_lto() {
        let e = ctx_ensemble();
        let mut buf = [0u8; 30];
        let st = Fig0_9::default().fill(&ctx(&e), &mut buf);
        assert_eq!(st.written, 5);
        assert_eq!(buf[2], 2); // +1 h = 2 half-hours
        assert_eq!(buf[3], 0xE1);
        assert_eq!(buf[4], 1);
    }

    #[test]
    fn fig0_10_date_time() {
        let e = ctx_ensemble();
        let c = ctx(&e);
        let mut buf = [0u8; 30];
        let st = Fig0_10::default().fill(&c, &mut buf);
        assert_eq!(st.written, 6);
        let mjd = ((u32::from(buf[2]) & 0x7F) << 10)
            | (u32::from(buf[3]) << 2)
            | (u32::from(buf[4]) >> 6);
        assert_eq!(mjd, crate::timestamp::mjd(&c.now));
        let hours = ((buf[4] & 0x07) << 2) | (buf[5] >> 6);
        let minutes = buf[5] & 0x3F;
        assert_eq!(hours, 12);
        assert_eq!(minutes, 30);
    }

    #[test]
    fn fig0_17_with_language() {
        let e = ctx_ensemble();
        let mut buf = [0u8; 30];
        let st = Fig0_17::default().fill(&ctx(&e), &mut buf);
        assert!(st.complete);
        assert_eq!(buf[0], 6);
        assert_eq!(buf[4], 0x20); // static, language present
        assert_eq!(buf[5], 9);
        assert_eq!(buf[6], 10);
    }

    #[test]
    fn fig0_18_clusters() {
        let e = ctx_ensemble();
        let mut buf = [0u8; 30];
        let st = Fig0_18::default().fill(&ctx(&e), &mut buf);
        assert!(st.complete);
        assert_eq!(&buf[2..4], &[0x50, 0x01]);
        assert_eq!(&buf[4..6], &[0x00, 0x01]); // ASu
        assert_eq!(buf[6], 1); // one cluster
        assert_eq!(buf[7], 1);
    }

    #[test]
    fn fig0_19_switching() {
        let mut e = ctx_ensemble();
        e.announcements.push(ActiveAnnouncement { cluster: 1, asw: 0x0001, subchannel_id: 0 });
        let mut buf = [0u8; 30];
        let st = Fig0_19::default().fill(&ctx(&e), &mut buf);
        assert!(st.complete);
        assert_eq!(buf[0], 5);
        assert_eq!(buf[2], 1);
        assert_eq!(&buf[3..5], &[0x00, 0x01]);
        assert_eq!(buf[5], 0x80);
    }

    #[test]
    fn empty_extension_reports_complete() {
        let e = ctx_ensemble();
        let mut buf = [0u8; 30];
        // No packet components configured.
        let st = Fig0_3::default().fill(&ctx(&e), &mut buf);
        assert_eq!(st.written, 0);
        assert!(st.complete);
    }

    #[test]
    fn entries_resume_when_buffer_is_tight() {
        let mut e = ctx_ensemble();
        // Eight subchannels of 3-byte entries: 2 + 8*3 = 26 bytes total.
        e.subchannels.clear();
        for i in 0..8u8 {
            e.subchannels.push(DabSubchannel {
                uid: format!("s{}", i),
                id: i,
                typ: SubchannelType::DabAudio,
                start_address: 0,
                bitrate: 64,
                protection: Protection::Uep { level: 2 },
                input_uri: String::new(),
                pad: None,
            });
        }
        e.assign_start_addresses().unwrap();
        let c = ctx(&e);
        let mut fig = Fig0_1::default();
        // Only 11 bytes available: header + 3 entries.
        let mut small = [0u8; 11];
        let st = fig.fill(&c, &mut small);
        assert_eq!(st.written, 11);
        assert!(!st.complete);
        // The rest goes out under a fresh header.
        let mut buf = [0u8; 30];
        let st = fig.fill(&c, &mut buf);
        assert!(st.complete);
        assert_eq!(st.written, 2 + 5 * 3);
    }
}

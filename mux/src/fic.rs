//! FIC scheduler: multiplexes FIGs into the three 32-byte FIBs of every
//! TM-I frame, honouring per-FIG repetition rates and priorities.
//!
//! Selection order is (priority, rate urgency). FIG 0/0 is pinned to the
//! start of FIB 0 in every frame. Each FIB body is exactly 30 bytes,
//! padded with one 0xFF end marker and 0x00 filler, followed by the
//! CRC-16 over the body.

use log::warn;

use crate::fig::{standard_fig_set, Fig, FigCtx, ScheduledFig};

pub const FIB_SIZE: usize = 32;
pub const FIB_BODY: usize = 30;
pub const FIBS_PER_FRAME: usize = 3;
pub const FIC_SIZE: usize = FIB_SIZE * FIBS_PER_FRAME;

pub struct FicScheduler {
    figs: Vec<ScheduledFig>,
    undelivered: u64,
    last_oversub_warning_ms: Option<u64>,
}

impl FicScheduler {
    pub fn new() -> Self {
        FicScheduler {
            figs: standard_fig_set(),
            undelivered: 0,
            last_oversub_warning_ms: None,
        }
    }

    /// FIGs that missed their deadline across the scheduler's lifetime.
    pub fn undelivered(&self) -> u64 {
        self.undelivered
    }

    /// Builds the 96-byte FIC for one frame. `now_ms` is multiplex time
    /// (frame count x 24 ms), which keeps scheduling deterministic.
    pub fn build_fic(&mut self, ctx: &FigCtx<'_>, now_ms: u64) -> [u8; FIC_SIZE] {
        let mut fic = [0u8; FIC_SIZE];

        // Candidate order for this frame, best first.
        let mut order: Vec<usize> = (0..self.figs.len()).collect();
        order.sort_by_key(|&i| {
            (self.figs[i].fig.priority(), -self.figs[i].urgency(now_ms))
        });

        for fib in 0..FIBS_PER_FRAME {
            let mut body = [0u8; FIB_BODY];
            let mut used = 0usize;
            let mut filled_here = [false; 64];

            if fib == 0 {
                // FIG 0/0 leads FIB 0 unconditionally.
                if let Some(i) = self
                    .figs
                    .iter()
                    .position(|f| matches!(f.fig, Fig::EnsembleInfo(_)))
                {
                    let st = self.figs[i].fig.fill(ctx, &mut body[..]);
                    used += st.written;
                    self.figs[i].mark_transmitted(now_ms, st.complete);
                    filled_here[i] = true;
                }
            }

            for &i in &order {
                if used >= FIB_BODY {
                    break;
                }
                if filled_here[i] || !self.figs[i].should_transmit(now_ms) {
                    continue;
                }
                let st = self.figs[i].fig.fill(ctx, &mut body[used..]);
                if st.written > 0 {
                    used += st.written;
                    filled_here[i] = true;
                }
                if st.written > 0 || st.complete {
                    self.figs[i].mark_transmitted(now_ms, st.complete);
                }
            }

            if used < FIB_BODY {
                body[used] = 0xFF;
                // Remaining filler bytes stay zero.
            }

            let base = fib * FIB_SIZE;
            fic[base..base + FIB_BODY].copy_from_slice(&body);
            let crc = fec::crc16(&body);
            fic[base + FIB_BODY..base + FIB_SIZE].copy_from_slice(&crc.to_be_bytes());
        }

        // Anything still due past its interval after three FIBs missed its
        // deadline. FIGs that never completed a first cycle are exempt:
        // they have no reference point yet.
        let overdue = self
            .figs
            .iter()
            .filter(|f| {
                f.last_complete_ms().is_some()
                    && f.should_transmit(now_ms)
                    && f.urgency(now_ms) > 0
            })
            .count() as u64;
        if overdue > 0 {
            self.undelivered += overdue;
            let warn_due = match self.last_oversub_warning_ms {
                None => true,
                Some(last) => now_ms.saturating_sub(last) >= 60_000,
            };
            if warn_due {
                warn!("FIC over-subscribed: {} FIG(s) past their repetition deadline", overdue);
                self.last_oversub_warning_ms = Some(now_ms);
            }
        }

        fic
    }
}

impl Default for FicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::*;
    use chrono::TimeZone;

    fn ensemble() -> DabEnsemble {
        let mut e = DabEnsemble {
            id: 0xCE15,
            ecc: 0xE1,
            label: DabLabel::new("Test", "Test").unwrap(),
            mode: TransmissionMode::I,
            lto_auto: false,
            lto: 0,
            international_table: 1,
            alarm_flag: false,
            mnsc: 0,
            datetime_enabled: false,
            services: vec![DabService {
                uid: "radio1".into(),
                id: 0x5001,
                ecc: 0,
                label: DabLabel::new("Radio One", "Radio").unwrap(),
                pty: PtySettings { pty: 10, dynamic_no_static: false },
                language: 9,
                asu: 0,
                clusters: vec![],
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

    fn ctx<'a>(e: &'a DabEnsemble, cif: u32) -> FigCtx<'a> {
        FigCtx {
            ensemble: e,
            cif_count: cif,
            now: chrono::Utc.ymd(2024, 6, 1).and_hms(12, 0, 0),
        }
    }

    /// Walks the FIGs of one FIB, returning (type, extension, len) tuples.
    fn parse_figs(fib: &[u8]) -> Vec<(u8, u8, usize)> {
        let mut figs = vec![];
        let mut off = 0;
        while off < FIB_BODY && fib[off] != 0xFF {
            let typ = fib[off] >> 5;
            let len = (fib[off] & 0x1F) as usize;
            let ext = match typ {
                0 => fib[off + 1] & 0x1F,
                1 => fib[off + 1] & 0x07,
                _ => 0xFF,
            };
            figs.push((typ, ext, len));
            off += 1 + len;
        }
        figs
    }

    #[test]
    fn fib_crcs_are_valid() {
        let e = ensemble();
        let mut sched = FicScheduler::new();
        let fic = sched.build_fic(&ctx(&e, 0), 0);
        for fib in 0..FIBS_PER_FRAME {
            let base = fib * FIB_SIZE;
            let body = &fic[base..base + FIB_BODY];
            let crc = u16::from_be_bytes([fic[base + 30], fic[base + 31]]);
            assert_eq!(fec::crc16(body), crc, "FIB {} CRC", fib);
        }
    }

    #[test]
    fn fig0_0_leads_fib0_every_frame() {
        let e = ensemble();
        let mut sched = FicScheduler::new();
        for frame in 0u64..10 {
            let fic = sched.build_fic(&ctx(&e, frame as u32), frame * 24);
            let figs = parse_figs(&fic[..FIB_BODY]);
            assert_eq!(figs[0], (0, 0, 5), "frame {}", frame);
        }
    }

    #[test]
    fn mci_figs_present_in_first_frame() {
        let e = ensemble();
        let mut sched = FicScheduler::new();
        let fic = sched.build_fic(&ctx(&e, 0), 0);
        let mut all = vec![];
        for fib in 0..FIBS_PER_FRAME {
            all.extend(parse_figs(&fic[fib * FIB_SIZE..fib * FIB_SIZE + FIB_BODY]));
        }
        let has = |t: u8, x: u8| all.iter().any(|&(typ, ext, _)| typ == t && ext == x);
        assert!(has(0, 0), "FIG 0/0 missing");
        assert!(has(0, 1), "FIG 0/1 missing");
        assert!(has(0, 2), "FIG 0/2 missing");
        assert!(has(1, 0), "FIG 1/0 missing");
    }

    #[test]
    fn labels_repeat_once_per_second() {
        let e = ensemble();
        let mut sched = FicScheduler::new();
        // Record the frames in which FIG 1/1 appears over ~2.4 seconds.
        let mut appearances = vec![];
        for frame in 0u64..100 {
            let fic = sched.build_fic(&ctx(&e, frame as u32), frame * 24);
            for fib in 0..FIBS_PER_FRAME {
                let figs = parse_figs(&fic[fib * FIB_SIZE..fib * FIB_SIZE + FIB_BODY]);
                if figs.iter().any(|&(t, x, _)| t == 1 && x == 1) {
                    appearances.push(frame);
                }
            }
        }
        assert!(!appearances.is_empty());
        // Gaps between complete transmissions stay within the 1 s rate
        // plus one frame of slack.
        for pair in appearances.windows(2) {
            assert!((pair[1] - pair[0]) * 24 <= 1000 + 24);
        }
    }

    #[test]
    fn padding_has_end_marker() {
        let e = ensemble();
        let mut sched = FicScheduler::new();
        let fic = sched.build_fic(&ctx(&e, 0), 0);
        // The last FIB of a small ensemble cannot be full; find the end
        // marker and check zero filler after it.
        let last = &fic[2 * FIB_SIZE..2 * FIB_SIZE + FIB_BODY];
        let figs = parse_figs(last);
        let used: usize = figs.iter().map(|&(_, _, len)| 1 + len).sum();
        if used < FIB_BODY {
            assert_eq!(last[used], 0xFF);
            assert!(last[used + 1..].iter().all(|&b| b == 0));
        }
    }
}

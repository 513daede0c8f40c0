//! Ensemble configuration and multiplex entities: the ensemble itself,
//! services, service components and subchannels, together with the error
//! protection tables that drive capacity allocation.
//!
//! Entities cross-reference each other by stable identifiers (SId,
//! SubChId) rather than pointers; the ensemble owns three flat vectors in
//! declaration order, which is also the CU allocation order.

use failure::{bail, Error};

use crate::charset;

/// One capacity unit carries 64 bits; a subchannel of `size_cu` CUs
/// occupies `size_cu * 4` bytes of a 24 ms ETI frame.
pub const CU_BYTES: usize = 4;

/// UEP short-form protection, ETSI EN 300 401 section 6.2.1: one row per
/// table index, carrying (bitrate kbps, protection level, size in CU).
/// The FIG 0/1 short form and the ETI TPL field transmit the row index.
#[rustfmt::skip]
pub const UEP_TABLE: [(u16, u8, u16); 64] = [
    (32, 4, 16),  (32, 3, 21),  (32, 2, 24),  (32, 1, 29),  (32, 0, 35),
    (48, 4, 24),  (48, 3, 29),  (48, 2, 35),  (48, 1, 42),  (48, 0, 52),
    (56, 4, 29),  (56, 3, 35),  (56, 2, 42),  (56, 1, 52),
    (64, 4, 32),  (64, 3, 42),  (64, 2, 48),  (64, 1, 58),  (64, 0, 70),
    (80, 4, 40),  (80, 3, 52),  (80, 2, 58),  (80, 1, 70),  (80, 0, 84),
    (96, 4, 48),  (96, 3, 58),  (96, 2, 70),  (96, 1, 84),  (96, 0, 104),
    (112, 4, 58), (112, 3, 70), (112, 2, 84), (112, 1, 104),
    (128, 4, 64), (128, 3, 84), (128, 2, 96), (128, 1, 116), (128, 0, 140),
    (160, 4, 80), (160, 3, 104), (160, 2, 116), (160, 1, 140), (160, 0, 168),
    (192, 4, 96), (192, 3, 116), (192, 2, 140), (192, 1, 168), (192, 0, 208),
    (224, 4, 116), (224, 3, 140), (224, 2, 168), (224, 1, 208), (224, 0, 232),
    (256, 4, 128), (256, 3, 168), (256, 2, 192), (256, 1, 232), (256, 0, 280),
    (320, 4, 160), (320, 3, 208), (320, 1, 280),
    (384, 4, 192), (384, 2, 280), (384, 0, 416),
];

/// Looks up the UEP table index for a (bitrate, protection level) pair.
pub fn uep_table_index(bitrate: u16, level: u8) -> Option<u8> {
    UEP_TABLE
        .iter()
        .position(|&(b, l, _)| b == bitrate && l == level)
        .map(|i| i as u8)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionMode {
    I,
    II,
    III,
    IV,
}

impl TransmissionMode {
    /// Capacity of one 24 ms logical frame in CUs.
    pub fn capacity_cu(self) -> u16 {
        match self {
            TransmissionMode::I => 864,
            TransmissionMode::II => 216,
            TransmissionMode::III => 192,
            TransmissionMode::IV => 432,
        }
    }

    /// Mode identity as carried in the ETI FC field.
    pub fn mid(self) -> u8 {
        match self {
            TransmissionMode::I => 1,
            TransmissionMode::II => 2,
            TransmissionMode::III => 3,
            TransmissionMode::IV => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubchannelType {
    DabAudio,
    DabPlusAudio,
    Packet,
    Dmb,
}

impl SubchannelType {
    pub fn is_audio(self) -> bool {
        matches!(self, SubchannelType::DabAudio | SubchannelType::DabPlusAudio)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EepProfile {
    A,
    B,
}

impl EepProfile {
    /// 3-bit option field of the FIG 0/1 long form.
    pub fn option(self) -> u8 {
        match self {
            EepProfile::A => 0,
            EepProfile::B => 1,
        }
    }
}

/// Error protection of a subchannel: UEP short form (table indexed) or EEP
/// long form (profile + level 1..4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    Uep { level: u8 },
    Eep { profile: EepProfile, level: u8 },
}

impl Protection {
    /// Size of the subchannel in capacity units for the given bitrate.
    pub fn size_cu(&self, bitrate: u16) -> Result<u16, Error> {
        match *self {
            Protection::Uep { level } => {
                match uep_table_index(bitrate, level) {
                    Some(idx) => Ok(UEP_TABLE[idx as usize].2),
                    None => bail!(
                        "no UEP entry for bitrate {} kbps at protection level {}",
                        bitrate,
                        level
                    ),
                }
            }
            Protection::Eep { profile, level } => {
                if !(1..=4).contains(&level) {
                    bail!("EEP level {} out of range 1..4", level);
                }
                let cu = match profile {
                    EepProfile::A => {
                        if bitrate % 8 != 0 {
                            bail!("EEP-A requires a bitrate multiple of 8, got {}", bitrate);
                        }
                        let factor = [12u16, 8, 6, 4][usize::from(level - 1)];
                        bitrate / 8 * factor
                    }
                    EepProfile::B => {
                        if bitrate % 32 != 0 {
                            bail!("EEP-B requires a bitrate multiple of 32, got {}", bitrate);
                        }
                        let factor = [27u16, 21, 18, 15][usize::from(level - 1)];
                        bitrate / 32 * factor
                    }
                };
                Ok(cu)
            }
        }
    }

    /// 6-bit TPL field of the ETI STC word (ETSI EN 300 799 section
    /// 5.4.1.2). UEP transmits the table index; for EEP only the
    /// `0x20 | level` form is carried.
    pub fn tpl(&self, bitrate: u16) -> u8 {
        match *self {
            Protection::Uep { level } => uep_table_index(bitrate, level).unwrap_or(0) & 0x3F,
            Protection::Eep { level, .. } => 0x20 | (level & 0x1F),
        }
    }
}

/// A label: up to 16 characters, with an up to 8 character short form
/// selected from the long label's positions by a 16-bit mask.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DabLabel {
    pub text: String,
    pub short: String,
    pub flag: u16,
}

impl DabLabel {
    pub fn new(text: &str, short: &str) -> Result<Self, Error> {
        if text.chars().count() > 16 {
            bail!("label {:?} longer than 16 characters", text);
        }
        if short.chars().count() > 8 {
            bail!("short label {:?} longer than 8 characters", short);
        }
        let flag = if short.is_empty() {
            0xFF00
        } else {
            charset::short_label_mask(text, short)
        };
        Ok(DabLabel {
            text: text.to_owned(),
            short: short.to_owned(),
            flag,
        })
    }

    /// The fixed 16-byte EBU Latin field.
    pub fn encode(&self) -> [u8; 16] {
        charset::encode_label(&self.text)
    }
}

/// Per-subchannel DLS configuration.
#[derive(Clone, Debug)]
pub struct DlsConfig {
    pub input_path: String,
    /// 0 = EBU Latin, 1 = UTF-8.
    pub charset: u8,
    /// Static label used until the file monitor delivers text.
    pub label: String,
    pub poll_interval_ms: u64,
}

/// Per-subchannel PAD configuration.
#[derive(Clone, Debug)]
pub struct PadConfig {
    pub length: usize,
    pub dls: Option<DlsConfig>,
}

#[derive(Clone, Debug)]
pub struct DabSubchannel {
    pub uid: String,
    /// SubChId, 0..63.
    pub id: u8,
    pub typ: SubchannelType,
    /// Start address in CUs, assigned sequentially on ensemble build.
    pub start_address: u16,
    pub bitrate: u16,
    pub protection: Protection,
    pub input_uri: String,
    pub pad: Option<PadConfig>,
}

impl DabSubchannel {
    pub fn size_cu(&self) -> Result<u16, Error> {
        self.protection.size_cu(self.bitrate)
    }

    pub fn size_bytes(&self) -> Result<usize, Error> {
        Ok(usize::from(self.size_cu()?) * CU_BYTES)
    }

    pub fn tpl(&self) -> u8 {
        self.protection.tpl(self.bitrate)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.id > 63 {
            bail!("subchannel {:?}: SubChId {} out of range 0..63", self.uid, self.id);
        }
        if self.bitrate == 0 {
            bail!("subchannel {:?}: bitrate must be > 0", self.uid);
        }
        self.size_cu()?;
        Ok(())
    }
}

/// FIG 0/13 user application descriptor.
#[derive(Clone, Debug)]
pub struct UserApplication {
    /// 11-bit user application type (0x002 = slideshow).
    pub ua_type: u16,
    /// 5-bit X-PAD application type when carried in X-PAD.
    pub xpad_app_type: u8,
}

/// Packet-mode component addressing.
#[derive(Clone, Debug, Default)]
pub struct PacketComponent {
    /// 12-bit service component identifier.
    pub scid: u16,
    /// 10-bit packet address.
    pub address: u16,
    /// Data groups used (FIG 0/3 DG flag is transmitted inverted).
    pub datagroup: bool,
    /// DSCTy.
    pub dscty: u8,
}

#[derive(Clone, Debug)]
pub struct DabComponent {
    pub uid: String,
    pub label: Option<DabLabel>,
    /// Parent service SId.
    pub service_id: u32,
    pub subchannel_id: u8,
    /// ASCTy for audio (0 = MPEG-I layer II, 63 = HE-AAC v2), DSCTy for
    /// data components.
    pub typ: u8,
    /// Service component identifier within the service (SCIdS).
    pub scids: u8,
    pub packet: Option<PacketComponent>,
    pub user_apps: Vec<UserApplication>,
    /// Dynamic label text, mutated by the remote control surface and
    /// picked up by the PAD pipeline at the next frame boundary.
    pub dynamic_label: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PtySettings {
    /// Programme type code, 5 bits; 0 disables FIG 0/17.
    pub pty: u8,
    pub dynamic_no_static: bool,
}

#[derive(Clone, Debug)]
pub struct DabService {
    pub uid: String,
    /// 16-bit (programme) or 32-bit (data) SId. Never zero.
    pub id: u32,
    /// Extended country code; 0 inherits the ensemble ECC.
    pub ecc: u8,
    pub label: DabLabel,
    pub pty: PtySettings,
    /// 8-bit language code.
    pub language: u8,
    /// Announcement support bitmask (ASu).
    pub asu: u16,
    /// Announcement cluster memberships.
    pub clusters: Vec<u8>,
}

impl DabService {
    pub fn validate(&self) -> Result<(), Error> {
        if self.id == 0 {
            bail!("service {:?}: SId must not be zero", self.uid);
        }
        Ok(())
    }

    /// Programme services carry a 16-bit SId, data services 32 bits.
    pub fn is_programme(&self) -> bool {
        self.id <= 0xFFFF
    }
}

/// A currently switched announcement, carried in FIG 0/19.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveAnnouncement {
    pub cluster: u8,
    /// Announcement switching flags (ASw).
    pub asw: u16,
    pub subchannel_id: u8,
}

#[derive(Clone, Debug)]
pub struct DabEnsemble {
    /// 16-bit EId.
    pub id: u16,
    pub ecc: u8,
    pub label: DabLabel,
    pub mode: TransmissionMode,
    /// Local time offset: automatic (from the system timezone) or an
    /// explicit count of half-hours in -24..=24.
    pub lto_auto: bool,
    pub lto: i8,
    /// PTy table selector: 1 = RDS, 2 = North America.
    pub international_table: u8,
    pub alarm_flag: bool,
    /// Multiplex Network Signalling Channel, zero unless configured.
    pub mnsc: u16,
    /// FIG 0/10 date-and-time emission.
    pub datetime_enabled: bool,
    pub services: Vec<DabService>,
    pub components: Vec<DabComponent>,
    pub subchannels: Vec<DabSubchannel>,
    pub announcements: Vec<ActiveAnnouncement>,
}

impl DabEnsemble {
    pub fn service(&self, uid: &str) -> Option<&DabService> {
        self.services.iter().find(|s| s.uid == uid)
    }

    pub fn service_mut(&mut self, uid: &str) -> Option<&mut DabService> {
        self.services.iter_mut().find(|s| s.uid == uid)
    }

    pub fn service_by_id(&self, id: u32) -> Option<&DabService> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn component(&self, uid: &str) -> Option<&DabComponent> {
        self.components.iter().find(|c| c.uid == uid)
    }

    pub fn component_mut(&mut self, uid: &str) -> Option<&mut DabComponent> {
        self.components.iter_mut().find(|c| c.uid == uid)
    }

    pub fn subchannel(&self, uid: &str) -> Option<&DabSubchannel> {
        self.subchannels.iter().find(|s| s.uid == uid)
    }

    pub fn subchannel_by_id(&self, id: u8) -> Option<&DabSubchannel> {
        self.subchannels.iter().find(|s| s.id == id)
    }

    /// Components of a service, in declaration order.
    pub fn components_of(&self, service_id: u32) -> impl Iterator<Item = &DabComponent> {
        self.components.iter().filter(move |c| c.service_id == service_id)
    }

    pub fn total_cu(&self) -> Result<u16, Error> {
        let mut total = 0u16;
        for sub in &self.subchannels {
            total += sub.size_cu()?;
        }
        Ok(total)
    }

    /// Assigns start addresses by cumulative CU size in declaration order.
    /// Subchannels with an explicit address (nonzero or first) keep it.
    pub fn assign_start_addresses(&mut self) -> Result<(), Error> {
        let mut next = 0u16;
        for sub in &mut self.subchannels {
            sub.start_address = next;
            next += sub.protection.size_cu(sub.bitrate)?;
        }
        Ok(())
    }

    /// Full configuration validation; refusal here maps to CLI exit code 1.
    pub fn validate(&self) -> Result<(), Error> {
        if self.label.text.is_empty() {
            bail!("ensemble label must not be empty");
        }
        if !(1..=2).contains(&self.international_table) {
            bail!("international table {} not in 1..=2", self.international_table);
        }
        if !(-24..=24).contains(&self.lto) {
            bail!("local time offset {} half-hours out of range", self.lto);
        }
        for service in &self.services {
            service.validate()?;
        }
        for sub in &self.subchannels {
            sub.validate()?;
        }
        for (i, a) in self.subchannels.iter().enumerate() {
            for b in &self.subchannels[i + 1..] {
                if a.id == b.id {
                    bail!("duplicate SubChId {} ({:?} and {:?})", a.id, a.uid, b.uid);
                }
                if a.uid == b.uid {
                    bail!("duplicate subchannel uid {:?}", a.uid);
                }
            }
        }
        for comp in &self.components {
            if self.service_by_id(comp.service_id).is_none() {
                bail!(
                    "component {:?} references unknown service 0x{:X}",
                    comp.uid,
                    comp.service_id
                );
            }
            if self.subchannel_by_id(comp.subchannel_id).is_none() {
                bail!(
                    "component {:?} references unknown subchannel {}",
                    comp.uid,
                    comp.subchannel_id
                );
            }
        }
        let total = self.total_cu()?;
        let capacity = self.mode.capacity_cu();
        if total > capacity {
            bail!(
                "subchannels occupy {} CU, exceeding the {} CU capacity of TM-{:?}",
                total,
                capacity,
                self.mode
            );
        }
        for sub in &self.subchannels {
            if sub.start_address + sub.size_cu()? > capacity {
                bail!(
                    "subchannel {:?} extends past the ensemble capacity",
                    sub.uid
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ensemble() -> DabEnsemble {
        DabEnsemble {
            id: 0xCE15,
            ecc: 0xE1,
            label: DabLabel::new("Test", "Test").unwrap(),
            mode: TransmissionMode::I,
            lto_auto: true,
            lto: 0,
            international_table: 1,
            alarm_flag: false,
            mnsc: 0,
            datetime_enabled: false,
            services: vec![],
            components: vec![],
            subchannels: vec![],
            announcements: vec![],
        }
    }

    fn audio_subchannel(uid: &str, id: u8, bitrate: u16, level: u8) -> DabSubchannel {
        DabSubchannel {
            uid: uid.to_owned(),
            id,
            typ: SubchannelType::DabAudio,
            start_address: 0,
            bitrate,
            protection: Protection::Uep { level },
            input_uri: String::new(),
            pad: None,
        }
    }

    #[test]
    fn uep_lookup() {
        // 128 kbps at level 2 is table index 35 with 96 CU.
        assert_eq!(uep_table_index(128, 2), Some(35));
        assert_eq!(UEP_TABLE[35].2, 96);
        // 32 kbps level 4 is the first row.
        assert_eq!(uep_table_index(32, 4), Some(0));
        // No 40 kbps rows exist.
        assert_eq!(uep_table_index(40, 2), None);
    }

    #[test]
    fn eep_sizes() {
        let eep3a = Protection::Eep { profile: EepProfile::A, level: 3 };
        assert_eq!(eep3a.size_cu(48).unwrap(), 36);
        assert_eq!(eep3a.tpl(48), 0x23);
        let eep1b = Protection::Eep { profile: EepProfile::B, level: 1 };
        assert_eq!(eep1b.size_cu(32).unwrap(), 27);
        Protection::Eep { profile: EepProfile::A, level: 5 }
            .size_cu(48)
            .unwrap_err();
    }

    #[test]
    fn start_addresses_are_cumulative() {
        let mut e = test_ensemble();
        e.subchannels.push(audio_subchannel("a", 0, 128, 2)); // 96 CU
        e.subchannels.push(audio_subchannel("b", 1, 64, 2)); // 48 CU
        e.assign_start_addresses().unwrap();
        assert_eq!(e.subchannels[0].start_address, 0);
        assert_eq!(e.subchannels[1].start_address, 96);
        assert_eq!(e.total_cu().unwrap(), 144);
        e.validate().unwrap();
    }

    #[test]
    fn capacity_overflow_is_rejected() {
        let mut e = test_ensemble();
        // 4 x 280 CU = 1120 CU > 864.
        for i in 0..4 {
            e.subchannels.push(audio_subchannel(&format!("s{}", i), i, 256, 0));
        }
        e.assign_start_addresses().unwrap();
        assert!(e.validate().is_err());
    }

    #[test]
    fn duplicate_subchid_is_rejected() {
        let mut e = test_ensemble();
        e.subchannels.push(audio_subchannel("a", 3, 64, 2));
        e.subchannels.push(audio_subchannel("b", 3, 64, 2));
        e.assign_start_addresses().unwrap();
        assert!(e.validate().is_err());
    }

    #[test]
    fn zero_sid_is_rejected() {
        let mut e = test_ensemble();
        e.services.push(DabService {
            uid: "bad".into(),
            id: 0,
            ecc: 0,
            label: DabLabel::new("Bad", "Bad").unwrap(),
            pty: PtySettings::default(),
            language: 0,
            asu: 0,
            clusters: vec![],
        });
        assert!(e.validate().is_err());
    }

    #[test]
    fn short_label_flag() {
        let l = DabLabel::new("Rock FM", "Rock").unwrap();
        assert_eq!(l.flag.count_ones(), 4);
        assert_eq!(l.flag, 0xF000);
    }
}

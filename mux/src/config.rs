//! YAML configuration loading: deserializes the configuration schema and
//! builds the validated ensemble. Any failure here maps to CLI exit
//! code 1.

use std::path::Path;

use failure::{bail, Error};
use serde::Deserialize;

use crate::ensemble::*;

/// Top level configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub ensemble: EnsembleCfg,
    #[serde(default)]
    pub subchannels: Vec<SubchannelCfg>,
    #[serde(default)]
    pub services: Vec<ServiceCfg>,
    #[serde(default)]
    pub components: Vec<ComponentCfg>,
    #[serde(default)]
    pub remote: Option<RemoteCfg>,
}

/// An ID that may be written as an integer or a hex string ("0xCE15").
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Int(u32),
    Str(String),
}

impl IdValue {
    pub fn to_u32(&self) -> Result<u32, Error> {
        match self {
            IdValue::Int(v) => Ok(*v),
            IdValue::Str(s) => {
                let s = s.trim();
                if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    u32::from_str_radix(hex, 16)
                        .map_err(|_| failure::format_err!("bad hex id {:?}", s))
                } else {
                    s.parse().map_err(|_| failure::format_err!("bad id {:?}", s))
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LabelCfg {
    pub text: String,
    #[serde(default)]
    pub short: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DateTimeCfg {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct EnsembleCfg {
    pub id: IdValue,
    pub ecc: IdValue,
    #[serde(default = "default_mode")]
    pub transmission_mode: String,
    pub label: LabelCfg,
    #[serde(default = "default_true")]
    pub lto_auto: bool,
    #[serde(default)]
    pub lto: i8,
    #[serde(default = "default_intl_table")]
    pub international_table: u8,
    #[serde(default)]
    pub mnsc: u16,
    #[serde(default)]
    pub datetime: Option<DateTimeCfg>,
}

fn default_mode() -> String {
    "I".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_intl_table() -> u8 {
    1
}

/// Protection: `{ level, shortform, profile }` or a string form such as
/// `"UEP_2"` / `"EEP_3A"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ProtectionCfg {
    Name(String),
    Form {
        level: u8,
        #[serde(default = "default_true")]
        shortform: bool,
        #[serde(default)]
        profile: Option<String>,
    },
}

impl ProtectionCfg {
    pub fn to_protection(&self) -> Result<Protection, Error> {
        match self {
            ProtectionCfg::Name(name) => parse_protection_name(name),
            ProtectionCfg::Form { level, shortform: true, .. } => {
                Ok(Protection::Uep { level: *level })
            }
            ProtectionCfg::Form { level, shortform: false, profile } => {
                let profile = match profile.as_deref() {
                    None | Some("A") | Some("a") => EepProfile::A,
                    Some("B") | Some("b") => EepProfile::B,
                    Some(other) => bail!("unknown EEP profile {:?}", other),
                };
                Ok(Protection::Eep { profile, level: *level })
            }
        }
    }
}

fn parse_protection_name(name: &str) -> Result<Protection, Error> {
    let upper = name.to_ascii_uppercase();
    if let Some(level) = upper.strip_prefix("UEP_") {
        let level = level
            .parse()
            .map_err(|_| failure::format_err!("bad UEP level in {:?}", name))?;
        return Ok(Protection::Uep { level });
    }
    if let Some(rest) = upper.strip_prefix("EEP_") {
        let bytes = rest.as_bytes();
        if bytes.len() == 2 {
            let level = (bytes[0] as char)
                .to_digit(10)
                .ok_or_else(|| failure::format_err!("bad EEP level in {:?}", name))?
                as u8;
            let profile = match bytes[1] {
                b'A' => EepProfile::A,
                b'B' => EepProfile::B,
                _ => bail!("bad EEP profile in {:?}", name),
            };
            return Ok(Protection::Eep { profile, level });
        }
    }
    bail!("unrecognized protection {:?}", name)
}

#[derive(Debug, Deserialize)]
pub struct DlsCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub input_path: Option<String>,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
}

fn default_poll_interval() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct PadCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub length: usize,
    #[serde(default)]
    pub dls: Option<DlsCfg>,
}

#[derive(Debug, Deserialize)]
pub struct SubchannelCfg {
    pub uid: String,
    #[serde(default)]
    pub id: Option<u8>,
    #[serde(rename = "type")]
    pub typ: String,
    pub bitrate: u16,
    pub protection: ProtectionCfg,
    #[serde(default)]
    pub start_address: Option<u16>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub pad: Option<PadCfg>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceCfg {
    pub uid: String,
    pub id: IdValue,
    #[serde(default)]
    pub ecc: Option<IdValue>,
    pub label: LabelCfg,
    #[serde(default)]
    pub pty: u8,
    #[serde(default)]
    pub pty_dynamic: bool,
    #[serde(default)]
    pub language: u8,
    #[serde(default)]
    pub announcements: Option<u16>,
    #[serde(default)]
    pub clusters: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ComponentCfg {
    pub uid: String,
    pub service_id: IdValue,
    pub subchannel_id: u8,
    #[serde(rename = "type", default)]
    pub typ: u8,
    #[serde(default)]
    pub label: Option<LabelCfg>,
    #[serde(default)]
    pub scids: Option<u8>,
    #[serde(default)]
    pub packet_address: Option<u16>,
    #[serde(default)]
    pub packet_scid: Option<u16>,
    #[serde(default)]
    pub datagroup: bool,
}

/// Remote control settings (ZMQ endpoint, telnet port, auth, audit).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RemoteCfg {
    #[serde(default)]
    pub zmq_endpoint: Option<String>,
    #[serde(default)]
    pub telnet_port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub audit_log: Option<String>,
}

/// Everything a run needs: the validated ensemble plus the per-uid
/// extras the model does not carry.
pub struct Config {
    pub ensemble: DabEnsemble,
    pub remote: RemoteCfg,
}

pub fn load_file(path: &Path) -> Result<Config, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| failure::format_err!("read config {:?}: {}", path, e))?;
    load_str(&text)
}

pub fn load_str(text: &str) -> Result<Config, Error> {
    let cfg: ConfigFile =
        serde_yaml::from_str(text).map_err(|e| failure::format_err!("parse config: {}", e))?;
    build(cfg)
}

fn build(cfg: ConfigFile) -> Result<Config, Error> {
    let e = &cfg.ensemble;
    let label = make_label(&e.label)?;
    let mode = match e.transmission_mode.as_str() {
        "I" | "1" => TransmissionMode::I,
        "II" | "2" => TransmissionMode::II,
        "III" | "3" => TransmissionMode::III,
        "IV" | "4" => TransmissionMode::IV,
        other => bail!("unknown transmission mode {:?}", other),
    };

    let mut subchannels = Vec::with_capacity(cfg.subchannels.len());
    for (i, sub) in cfg.subchannels.iter().enumerate() {
        let typ = match sub.typ.as_str() {
            "audio" => SubchannelType::DabAudio,
            "dabplus" => SubchannelType::DabPlusAudio,
            "packet" => SubchannelType::Packet,
            "dmb" => SubchannelType::Dmb,
            other => bail!("subchannel {:?}: unknown type {:?}", sub.uid, other),
        };
        let pad = match &sub.pad {
            Some(p) if p.enabled => Some(PadConfig {
                length: p.length,
                dls: p.dls.as_ref().filter(|d| d.enabled).map(|d| DlsConfig {
                    input_path: d.input_path.clone().unwrap_or_default(),
                    charset: match d.charset.as_deref() {
                        Some("ebu-latin") | Some("ebu") => 0,
                        _ => 1,
                    },
                    label: d.label.clone().unwrap_or_default(),
                    poll_interval_ms: (d.poll_interval * 1000.0) as u64,
                }),
            }),
            _ => None,
        };
        subchannels.push(DabSubchannel {
            uid: sub.uid.clone(),
            id: sub.id.unwrap_or(i as u8),
            typ,
            start_address: sub.start_address.unwrap_or(0),
            bitrate: sub.bitrate,
            protection: sub.protection.to_protection()?,
            input_uri: sub.input.clone().unwrap_or_default(),
            pad,
        });
    }

    let mut services = Vec::with_capacity(cfg.services.len());
    for svc in &cfg.services {
        services.push(DabService {
            uid: svc.uid.clone(),
            id: svc.id.to_u32()?,
            ecc: match &svc.ecc {
                Some(ecc) => ecc.to_u32()? as u8,
                None => 0,
            },
            label: make_label(&svc.label)?,
            pty: PtySettings { pty: svc.pty, dynamic_no_static: svc.pty_dynamic },
            language: svc.language,
            asu: svc.announcements.unwrap_or(0),
            clusters: svc.clusters.clone(),
        });
    }

    let mut components = Vec::new();
    if cfg.components.is_empty() {
        // One component per service/subchannel pair, in declaration
        // order.
        for (i, svc) in services.iter().enumerate() {
            let sub = match subchannels.get(i) {
                Some(s) => s,
                None => bail!("service {:?} has no subchannel to pair with", svc.uid),
            };
            components.push(DabComponent {
                uid: format!("comp_{}", svc.uid),
                label: None,
                service_id: svc.id,
                subchannel_id: sub.id,
                typ: default_component_type(sub.typ),
                scids: 0,
                packet: packet_component(sub, None, None, false),
                user_apps: default_user_apps(sub.typ),
                dynamic_label: None,
            });
        }
    } else {
        for comp in &cfg.components {
            let service_id = comp.service_id.to_u32()?;
            let sub = subchannels
                .iter()
                .find(|s| s.id == comp.subchannel_id)
                .ok_or_else(|| {
                    failure::format_err!(
                        "component {:?} references unknown subchannel {}",
                        comp.uid,
                        comp.subchannel_id
                    )
                })?;
            components.push(DabComponent {
                uid: comp.uid.clone(),
                label: comp.label.as_ref().map(make_label).transpose()?,
                service_id,
                subchannel_id: comp.subchannel_id,
                typ: comp.typ,
                scids: comp.scids.unwrap_or(0),
                packet: packet_component(sub, comp.packet_scid, comp.packet_address, comp.datagroup),
                user_apps: default_user_apps(sub.typ),
                dynamic_label: None,
            });
        }
    }

    let mut ensemble = DabEnsemble {
        id: e.id.to_u32()? as u16,
        ecc: e.ecc.to_u32()? as u8,
        label,
        mode,
        lto_auto: e.lto_auto,
        lto: e.lto,
        international_table: e.international_table,
        alarm_flag: false,
        mnsc: e.mnsc,
        datetime_enabled: e.datetime.as_ref().map(|d| d.enabled).unwrap_or(false),
        services,
        components,
        subchannels,
        announcements: vec![],
    };
    ensemble.assign_start_addresses()?;
    ensemble.validate()?;
    Ok(Config { ensemble, remote: cfg.remote.unwrap_or_default() })
}

fn default_component_type(typ: SubchannelType) -> u8 {
    match typ {
        SubchannelType::DabAudio => 0,
        // HE-AAC v2 audio.
        SubchannelType::DabPlusAudio => 63,
        SubchannelType::Packet | SubchannelType::Dmb => 0,
    }
}

/// Packet-mode components announce the slideshow user application
/// (FIG 0/13, UAType 0x002) so receivers start the MOT decoder.
fn default_user_apps(typ: SubchannelType) -> Vec<UserApplication> {
    match typ {
        SubchannelType::Packet => vec![UserApplication { ua_type: 0x002, xpad_app_type: 0 }],
        _ => vec![],
    }
}

fn packet_component(
    sub: &DabSubchannel,
    scid: Option<u16>,
    address: Option<u16>,
    datagroup: bool,
) -> Option<PacketComponent> {
    if sub.typ != SubchannelType::Packet {
        return None;
    }
    Some(PacketComponent {
        scid: scid.unwrap_or(u16::from(sub.id)),
        address: address.unwrap_or(0),
        datagroup,
        dscty: 0,
    })
}

fn make_label(cfg: &LabelCfg) -> Result<DabLabel, Error> {
    let short = match &cfg.short {
        Some(s) => s.clone(),
        None => cfg.text.chars().take(8).collect(),
    };
    DabLabel::new(&cfg.text, &short)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
ensemble:
  id: '0xCE15'
  ecc: '0xE1'
  transmission_mode: 'I'
  label: { text: 'Test DAB', short: 'Test' }
  lto_auto: true
subchannels:
  - uid: audio1
    id: 0
    type: audio
    bitrate: 128
    protection: { level: 2, shortform: true }
    input: 'file:///tmp/audio.mp2'
services:
  - uid: radio1
    id: '0x5001'
    label: { text: 'Radio One', short: 'Radio' }
    pty: 10
    language: 9
components:
  - uid: comp1
    service_id: '0x5001'
    subchannel_id: 0
    type: 0
"#;

    #[test]
    fn parses_basic_config() {
        let cfg = load_str(BASIC).unwrap();
        let e = cfg.ensemble;
        assert_eq!(e.id, 0xCE15);
        assert_eq!(e.ecc, 0xE1);
        assert_eq!(e.label.text, "Test DAB");
        assert_eq!(e.subchannels.len(), 1);
        assert_eq!(e.subchannels[0].bitrate, 128);
        assert_eq!(e.subchannels[0].size_cu().unwrap(), 96);
        assert_eq!(e.services[0].id, 0x5001);
        assert_eq!(e.components[0].uid, "comp1");
    }

    #[test]
    fn protection_string_forms() {
        assert_eq!(
            parse_protection_name("UEP_2").unwrap(),
            Protection::Uep { level: 2 }
        );
        assert_eq!(
            parse_protection_name("EEP_3A").unwrap(),
            Protection::Eep { profile: EepProfile::A, level: 3 }
        );
        assert_eq!(
            parse_protection_name("eep_1b").unwrap(),
            Protection::Eep { profile: EepProfile::B, level: 1 }
        );
        assert!(parse_protection_name("XYZ").is_err());
    }

    #[test]
    fn components_auto_synthesized() {
        let yaml = BASIC.replace(
            r#"components:
  - uid: comp1
    service_id: '0x5001'
    subchannel_id: 0
    type: 0
"#,
            "",
        );
        let cfg = load_str(&yaml).unwrap();
        assert_eq!(cfg.ensemble.components.len(), 1);
        assert_eq!(cfg.ensemble.components[0].uid, "comp_radio1");
        assert_eq!(cfg.ensemble.components[0].service_id, 0x5001);
    }

    #[test]
    fn capacity_overflow_rejected() {
        let yaml = BASIC.replace("bitrate: 128", "bitrate: 384").replace(
            "protection: { level: 2, shortform: true }",
            "protection: { level: 0, shortform: true }",
        );
        // One 416 CU subchannel fits; duplicate it to overflow 864.
        let mut cfg: ConfigFile = serde_yaml::from_str(&yaml).unwrap();
        let extra: SubchannelCfg = serde_yaml::from_str(
            r#"
uid: audio2
id: 1
type: audio
bitrate: 384
protection: { level: 0, shortform: true }
"#,
        )
        .unwrap();
        cfg.subchannels.push(extra);
        let extra2: SubchannelCfg = serde_yaml::from_str(
            r#"
uid: audio3
id: 2
type: audio
bitrate: 384
protection: { level: 0, shortform: true }
"#,
        )
        .unwrap();
        cfg.subchannels.push(extra2);
        assert!(build(cfg).is_err());
    }

    #[test]
    fn bad_mode_rejected() {
        let yaml = BASIC.replace("transmission_mode: 'I'", "transmission_mode: 'V'");
        assert!(load_str(&yaml).is_err());
    }

    #[test]
    fn dabplus_subchannel_with_pad() {
        let yaml = r#"
ensemble:
  id: 0xCE15
  ecc: 0xE1
  label: { text: 'Plus', short: 'Plus' }
subchannels:
  - uid: plus1
    type: dabplus
    bitrate: 48
    protection: 'EEP_3A'
    input: 'udp://0.0.0.0:9000'
    pad:
      enabled: true
      length: 16
      dls:
        enabled: true
        input_type: file
        input_path: /tmp/dls.txt
        charset: utf8
        poll_interval: 0.5
services:
  - uid: svc
    id: 0x5002
    label: { text: 'Plus One' }
"#;
        let cfg = load_str(yaml).unwrap();
        let sub = &cfg.ensemble.subchannels[0];
        assert_eq!(sub.typ, SubchannelType::DabPlusAudio);
        assert_eq!(sub.size_cu().unwrap(), 36);
        let pad = sub.pad.as_ref().unwrap();
        assert_eq!(pad.length, 16);
        let dls = pad.dls.as_ref().unwrap();
        assert_eq!(dls.charset, 1);
        assert_eq!(dls.poll_interval_ms, 500);
        // Auto component: HE-AAC v2 type.
        assert_eq!(cfg.ensemble.components[0].typ, 63);
    }
}

//! Remote control surface: a transport-agnostic command processor with
//! ZMQ REQ/REP (optional, behind the `zmq-remote` feature) and telnet
//! front ends speaking the same command set.
//!
//! Requests are `{ "command": ..., "args": {...}, "auth": ... }`;
//! responses `{ "success": true, "data": {...} }` or
//! `{ "success": false, "error": ... }`. Parameter writes become visible
//! to the frame loop at the next frame boundary.

pub mod audit;
pub mod auth;
pub mod telnet;
#[cfg(feature = "zmq-remote")]
pub mod zmq_server;

use std::time::Instant;

use failure::{bail, Error};
use log::LevelFilter;
use serde_json::{json, Map, Value};

use crate::ensemble::{ActiveAnnouncement, DabLabel};
use crate::mux::MuxHandle;
use audit::AuditLogger;
use auth::Authenticator;

/// Announcement type names and their ASw bits (ETSI EN 300 401 table 14).
const ANNOUNCEMENT_TYPES: [(&str, u16); 11] = [
    ("alarm", 0x0001),
    ("traffic", 0x0002),
    ("transport", 0x0004),
    ("warning", 0x0008),
    ("news", 0x0010),
    ("weather", 0x0020),
    ("event", 0x0040),
    ("special", 0x0080),
    ("programme_info", 0x0100),
    ("sport", 0x0200),
    ("financial", 0x0400),
];

/// The command registry: (name, description, argument names).
const COMMANDS: [(&str, &str, &[&str]); 19] = [
    ("get_statistics", "Get multiplexer statistics", &[]),
    ("get_label", "Get dynamic label text", &["component_uid"]),
    ("set_label", "Set dynamic label text", &["component_uid", "text"]),
    ("trigger_announcement", "Trigger an announcement", &["service_id", "type", "subchannel_id"]),
    ("clear_announcement", "Clear an active announcement", &["service_id", "type"]),
    ("get_service_info", "Get service information", &["service_uid"]),
    ("set_service_pty", "Set service programme type", &["service_uid", "pty"]),
    ("set_service_language", "Set service language", &["service_uid", "language"]),
    ("set_service_label", "Set service label", &["service_uid", "text", "short_text"]),
    ("get_all_services", "List all services", &[]),
    ("get_all_components", "List all components", &[]),
    ("get_all_subchannels", "List all subchannels", &[]),
    ("get_input_status", "Get input source health", &[]),
    ("reload_carousel", "Reload a MOT carousel from its directory", &["component_uid"]),
    ("get_carousel_stats", "Get carousel statistics", &["component_uid"]),
    ("get_log_level", "Get the current log level", &[]),
    ("set_log_level", "Set the log level at runtime", &["level"]),
    ("get_audit_log", "Read recent audit log entries", &["count"]),
    ("list_commands", "List available commands", &[]),
];

pub struct CommandProcessor {
    handle: MuxHandle,
    auth: Authenticator,
    audit: AuditLogger,
}

impl CommandProcessor {
    pub fn new(handle: MuxHandle, auth: Authenticator, audit: AuditLogger) -> Self {
        CommandProcessor { handle, auth, audit }
    }

    /// Runs one command and produces the wire response. `auth` is the
    /// password accompanying the request (ZMQ `auth` field or the
    /// telnet session's `auth` command).
    pub fn execute(
        &self,
        source: &str,
        client: &str,
        command: &str,
        args: &Value,
        auth: Option<&str>,
    ) -> Value {
        let start = Instant::now();
        let result = if self.auth.verify(auth) {
            self.dispatch(command, args)
        } else {
            Err(failure::format_err!("authentication failed"))
        };
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(data) => {
                self.audit
                    .log(source, client, command, args, true, duration_ms, None);
                json!({ "success": true, "data": data })
            }
            Err(e) => {
                let msg = e.to_string();
                self.audit
                    .log(source, client, command, args, false, duration_ms, Some(&msg));
                json!({ "success": false, "error": msg })
            }
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth.is_enabled()
    }

    pub fn verify_password(&self, password: &str) -> bool {
        self.auth.verify(Some(password))
    }

    fn dispatch(&self, command: &str, args: &Value) -> Result<Value, Error> {
        match command {
            "get_statistics" => self.get_statistics(),
            "get_label" => self.get_label(args),
            "set_label" => self.set_label(args),
            "trigger_announcement" => self.trigger_announcement(args),
            "clear_announcement" => self.clear_announcement(args),
            "get_service_info" => self.get_service_info(args),
            "set_service_pty" => self.set_service_pty(args),
            "set_service_language" => self.set_service_language(args),
            "set_service_label" => self.set_service_label(args),
            "get_all_services" => self.get_all_services(),
            "get_all_components" => self.get_all_components(),
            "get_all_subchannels" => self.get_all_subchannels(),
            "get_input_status" => self.get_input_status(),
            "reload_carousel" => self.reload_carousel(args),
            "get_carousel_stats" => self.get_carousel_stats(args),
            "get_log_level" => self.get_log_level(),
            "set_log_level" => self.set_log_level(args),
            "get_audit_log" => self.get_audit_log(args),
            "list_commands" => self.list_commands(),
            "get_command_info" => self.get_command_info(args),
            other => bail!("unknown command {:?}", other),
        }
    }

    fn get_statistics(&self) -> Result<Value, Error> {
        let ensemble = self.handle.ensemble.read();
        Ok(json!({
            "frame_count": self.handle.frame_count.load(std::sync::atomic::Ordering::Relaxed),
            "uptime_seconds": self.handle.started.elapsed().as_secs_f64(),
            "ensemble_id": format!("0x{:04X}", ensemble.id),
            "num_services": ensemble.services.len(),
            "num_components": ensemble.components.len(),
            "num_subchannels": ensemble.subchannels.len(),
            "fic_undelivered": self.handle.fic_undelivered.load(std::sync::atomic::Ordering::Relaxed),
        }))
    }

    fn get_label(&self, args: &Value) -> Result<Value, Error> {
        let uid = str_arg(args, "component_uid")?;
        let ensemble = self.handle.ensemble.read();
        let comp = ensemble
            .component(uid)
            .ok_or_else(|| failure::format_err!("unknown component {:?}", uid))?;
        Ok(json!({ "text": comp.dynamic_label.clone().unwrap_or_default() }))
    }

    fn set_label(&self, args: &Value) -> Result<Value, Error> {
        let uid = str_arg(args, "component_uid")?;
        let text = str_arg(args, "text")?;
        if text.chars().count() > crate::pad::dls::MAX_LABEL {
            bail!("label exceeds {} characters", crate::pad::dls::MAX_LABEL);
        }
        let mut ensemble = self.handle.ensemble.write();
        let comp = ensemble
            .component_mut(uid)
            .ok_or_else(|| failure::format_err!("unknown component {:?}", uid))?;
        comp.dynamic_label = Some(text.to_owned());
        Ok(json!({ "text": text }))
    }

    fn trigger_announcement(&self, args: &Value) -> Result<Value, Error> {
        let service_id = u64_arg(args, "service_id")? as u32;
        let kind = str_arg(args, "type")?;
        let subchannel_id = u64_arg(args, "subchannel_id")? as u8;
        let asw = announcement_bit(kind)?;
        let mut ensemble = self.handle.ensemble.write();
        let cluster = ensemble
            .service_by_id(service_id)
            .ok_or_else(|| failure::format_err!("unknown service 0x{:X}", service_id))?
            .clusters
            .first()
            .copied()
            .unwrap_or(0);
        let entry = ActiveAnnouncement { cluster, asw, subchannel_id };
        if !ensemble.announcements.contains(&entry) {
            ensemble.announcements.push(entry);
        }
        Ok(json!({ "cluster": cluster, "asw": asw }))
    }

    fn clear_announcement(&self, args: &Value) -> Result<Value, Error> {
        let service_id = u64_arg(args, "service_id")? as u32;
        let kind = str_arg(args, "type")?;
        let asw = announcement_bit(kind)?;
        let mut ensemble = self.handle.ensemble.write();
        let clusters: Vec<u8> = ensemble
            .service_by_id(service_id)
            .ok_or_else(|| failure::format_err!("unknown service 0x{:X}", service_id))?
            .clusters
            .clone();
        let before = ensemble.announcements.len();
        ensemble.announcements.retain(|a| {
            !(a.asw == asw && (clusters.contains(&a.cluster) || clusters.is_empty()))
        });
        Ok(json!({ "cleared": before - ensemble.announcements.len() }))
    }

    fn get_service_info(&self, args: &Value) -> Result<Value, Error> {
        let uid = str_arg(args, "service_uid")?;
        let ensemble = self.handle.ensemble.read();
        let svc = ensemble
            .service(uid)
            .ok_or_else(|| failure::format_err!("unknown service {:?}", uid))?;
        Ok(json!({
            "id": svc.id,
            "label": svc.label.text,
            "short_label": svc.label.short,
            "pty": svc.pty.pty,
            "language": svc.language,
            "ecc": svc.ecc,
        }))
    }

    fn set_service_pty(&self, args: &Value) -> Result<Value, Error> {
        let uid = str_arg(args, "service_uid")?;
        let pty = u64_arg(args, "pty")?;
        if pty > 31 {
            bail!("pty {} out of range 0..31", pty);
        }
        let mut ensemble = self.handle.ensemble.write();
        let svc = ensemble
            .service_mut(uid)
            .ok_or_else(|| failure::format_err!("unknown service {:?}", uid))?;
        svc.pty.pty = pty as u8;
        Ok(json!({ "pty": pty }))
    }

    fn set_service_language(&self, args: &Value) -> Result<Value, Error> {
        let uid = str_arg(args, "service_uid")?;
        let language = u64_arg(args, "language")?;
        if language > 255 {
            bail!("language {} out of range 0..255", language);
        }
        let mut ensemble = self.handle.ensemble.write();
        let svc = ensemble
            .service_mut(uid)
            .ok_or_else(|| failure::format_err!("unknown service {:?}", uid))?;
        svc.language = language as u8;
        Ok(json!({ "language": language }))
    }

    fn set_service_label(&self, args: &Value) -> Result<Value, Error> {
        let uid = str_arg(args, "service_uid")?;
        let text = str_arg(args, "text")?;
        let short = args
            .get("short_text")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| text.chars().take(8).collect());
        let label = DabLabel::new(text, &short)?;
        let mut ensemble = self.handle.ensemble.write();
        let svc = ensemble
            .service_mut(uid)
            .ok_or_else(|| failure::format_err!("unknown service {:?}", uid))?;
        svc.label = label;
        Ok(json!({ "label": text, "short_label": short }))
    }

    fn get_all_services(&self) -> Result<Value, Error> {
        let ensemble = self.handle.ensemble.read();
        let services: Vec<Value> = ensemble
            .services
            .iter()
            .map(|s| {
                json!({
                    "uid": s.uid,
                    "id": s.id,
                    "label": s.label.text,
                    "pty": s.pty.pty,
                    "language": s.language,
                })
            })
            .collect();
        Ok(json!({ "services": services }))
    }

    fn get_all_components(&self) -> Result<Value, Error> {
        let ensemble = self.handle.ensemble.read();
        let components: Vec<Value> = ensemble
            .components
            .iter()
            .map(|c| {
                json!({
                    "uid": c.uid,
                    "service_id": c.service_id,
                    "subchannel_id": c.subchannel_id,
                    "type": c.typ,
                    "dynamic_label": c.dynamic_label,
                })
            })
            .collect();
        Ok(json!({ "components": components }))
    }

    fn get_all_subchannels(&self) -> Result<Value, Error> {
        let ensemble = self.handle.ensemble.read();
        let mut subchannels = Vec::with_capacity(ensemble.subchannels.len());
        for s in &ensemble.subchannels {
            subchannels.push(json!({
                "uid": s.uid,
                "id": s.id,
                "type": format!("{:?}", s.typ),
                "bitrate": s.bitrate,
                "start_address": s.start_address,
                "size_cu": s.size_cu()?,
                "input": s.input_uri,
            }));
        }
        Ok(json!({ "subchannels": subchannels }))
    }

    fn get_input_status(&self) -> Result<Value, Error> {
        let status = self.handle.input_status.lock().expect("status lock");
        let mut map = Map::new();
        for (uid, report) in status.iter() {
            map.insert(uid.clone(), serde_json::to_value(report)?);
        }
        Ok(Value::Object(map))
    }

    fn reload_carousel(&self, args: &Value) -> Result<Value, Error> {
        let uid = str_arg(args, "component_uid")?;
        let carousel = self
            .handle
            .carousels
            .lock()
            .expect("carousel registry lock")
            .get(uid)
            .cloned()
            .ok_or_else(|| failure::format_err!("no carousel on component {:?}", uid))?;
        let objects = carousel.lock().expect("carousel lock").reload()?;
        Ok(json!({ "objects_loaded": objects }))
    }

    fn get_carousel_stats(&self, args: &Value) -> Result<Value, Error> {
        let uid = str_arg(args, "component_uid")?;
        let carousel = self
            .handle
            .carousels
            .lock()
            .expect("carousel registry lock")
            .get(uid)
            .cloned()
            .ok_or_else(|| failure::format_err!("no carousel on component {:?}", uid))?;
        let stats = carousel.lock().expect("carousel lock").stats();
        Ok(serde_json::to_value(stats)?)
    }

    fn get_log_level(&self) -> Result<Value, Error> {
        Ok(json!({ "level": log::max_level().to_string() }))
    }

    fn set_log_level(&self, args: &Value) -> Result<Value, Error> {
        let level = str_arg(args, "level")?;
        let filter = match level.to_ascii_lowercase().as_str() {
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            "off" => LevelFilter::Off,
            other => bail!("unknown log level {:?}", other),
        };
        log::set_max_level(filter);
        Ok(json!({ "level": filter.to_string() }))
    }

    fn get_audit_log(&self, args: &Value) -> Result<Value, Error> {
        let count = args.get("count").and_then(Value::as_u64).unwrap_or(100) as usize;
        Ok(json!({ "entries": self.audit.recent_entries(count) }))
    }

    fn list_commands(&self) -> Result<Value, Error> {
        let commands: Vec<&str> = COMMANDS
            .iter()
            .map(|&(name, _, _)| name)
            .chain(std::iter::once("get_command_info"))
            .collect();
        Ok(json!({ "commands": commands }))
    }

    fn get_command_info(&self, args: &Value) -> Result<Value, Error> {
        let name = str_arg(args, "command")?;
        let (_, description, arg_names) = COMMANDS
            .iter()
            .find(|&&(n, _, _)| n == name)
            .ok_or_else(|| failure::format_err!("unknown command {:?}", name))?;
        Ok(json!({ "command": name, "description": description, "args": arg_names }))
    }
}

fn announcement_bit(kind: &str) -> Result<u16, Error> {
    ANNOUNCEMENT_TYPES
        .iter()
        .find(|&&(name, _)| name.eq_ignore_ascii_case(kind))
        .map(|&(_, bit)| bit)
        .ok_or_else(|| failure::format_err!("unknown announcement type {:?}", kind))
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, Error> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| failure::format_err!("missing argument {:?}", name))
}

fn u64_arg(args: &Value, name: &str) -> Result<u64, Error> {
    args.get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| failure::format_err!("missing argument {:?}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::mux::Multiplexer;
    use serde_json::json;

    const CONFIG: &str = r#"
ensemble:
  id: '0xCE15'
  ecc: '0xE1'
  label: { text: 'Test', short: 'Test' }
subchannels:
  - uid: audio1
    id: 0
    type: audio
    bitrate: 64
    protection: { level: 2, shortform: true }
services:
  - uid: radio1
    id: '0x5001'
    label: { text: 'Radio One', short: 'Radio' }
    pty: 10
    clusters: [1]
components:
  - uid: comp1
    service_id: '0x5001'
    subchannel_id: 0
"#;

    fn processor() -> (Multiplexer, CommandProcessor) {
        let cfg = config::load_str(CONFIG).unwrap();
        let mux = Multiplexer::new(cfg, false).unwrap();
        let proc = CommandProcessor::new(
            mux.handle(),
            Authenticator::disabled(),
            AuditLogger::disabled(),
        );
        (mux, proc)
    }

    #[test]
    fn statistics_shape() {
        let (_mux, proc) = processor();
        let resp = proc.execute("zmq", "test", "get_statistics", &json!({}), None);
        assert_eq!(resp["success"], true);
        assert_eq!(resp["data"]["ensemble_id"], "0xCE15");
        assert_eq!(resp["data"]["num_services"], 1);
    }

    #[test]
    fn set_service_label_reaches_ensemble() {
        let (mux, proc) = processor();
        let resp = proc.execute(
            "zmq",
            "test",
            "set_service_label",
            &json!({"service_uid": "radio1", "text": "New", "short_text": "New"}),
            None,
        );
        assert_eq!(resp["success"], true);
        let ensemble = mux.handle().ensemble.read().clone();
        assert_eq!(ensemble.services[0].label.text, "New");
        assert_eq!(ensemble.services[0].label.flag, 0xE000);
    }

    #[test]
    fn set_and_get_dynamic_label() {
        let (_mux, proc) = processor();
        let resp = proc.execute(
            "zmq",
            "test",
            "set_label",
            &json!({"component_uid": "comp1", "text": "Now Playing"}),
            None,
        );
        assert_eq!(resp["success"], true);
        let resp = proc.execute(
            "zmq",
            "test",
            "get_label",
            &json!({"component_uid": "comp1"}),
            None,
        );
        assert_eq!(resp["data"]["text"], "Now Playing");
    }

    #[test]
    fn announcements_toggle() {
        let (mux, proc) = processor();
        let resp = proc.execute(
            "zmq",
            "t",
            "trigger_announcement",
            &json!({"service_id": 0x5001, "type": "traffic", "subchannel_id": 0}),
            None,
        );
        assert_eq!(resp["success"], true);
        assert_eq!(mux.handle().ensemble.read().announcements.len(), 1);
        let resp = proc.execute(
            "zmq",
            "t",
            "clear_announcement",
            &json!({"service_id": 0x5001, "type": "traffic"}),
            None,
        );
        assert_eq!(resp["data"]["cleared"], 1);
        assert!(mux.handle().ensemble.read().announcements.is_empty());
    }

    #[test]
    fn unknown_command_fails() {
        let (_mux, proc) = processor();
        let resp = proc.execute("telnet", "t", "frobnicate", &json!({}), None);
        assert_eq!(resp["success"], false);
        assert!(resp["error"].as_str().unwrap().contains("frobnicate"));
    }

    #[test]
    fn auth_gates_commands() {
        let cfg = config::load_str(CONFIG).unwrap();
        let mux = Multiplexer::new(cfg, false).unwrap();
        let proc = CommandProcessor::new(
            mux.handle(),
            Authenticator::with_password("pw"),
            AuditLogger::disabled(),
        );
        let denied = proc.execute("zmq", "t", "get_statistics", &json!({}), None);
        assert_eq!(denied["success"], false);
        let denied = proc.execute("zmq", "t", "get_statistics", &json!({}), Some("nope"));
        assert_eq!(denied["success"], false);
        let ok = proc.execute("zmq", "t", "get_statistics", &json!({}), Some("pw"));
        assert_eq!(ok["success"], true);
    }

    #[test]
    fn audit_redacts_auth_field() {
        let mut path = std::env::temp_dir();
        path.push(format!("dabmux-remote-audit-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let cfg = config::load_str(CONFIG).unwrap();
        let mux = Multiplexer::new(cfg, false).unwrap();
        let audit = AuditLogger::to_file(path.to_str().unwrap());
        let proc = CommandProcessor::new(mux.handle(), Authenticator::disabled(), audit);
        proc.execute(
            "zmq",
            "t",
            "set_label",
            &json!({"component_uid": "comp1", "text": "x", "auth": "secret-pw"}),
            None,
        );
        let entries = AuditLogger::to_file(path.to_str().unwrap()).recent_entries(1);
        assert_eq!(entries[0]["args"]["auth"], audit::REDACTED);
        assert_eq!(entries[0]["args"]["component_uid"], "comp1");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn command_listing_and_info() {
        let (_mux, proc) = processor();
        let resp = proc.execute("zmq", "t", "list_commands", &json!({}), None);
        let commands = resp["data"]["commands"].as_array().unwrap();
        assert!(commands.iter().any(|c| c == "get_statistics"));
        assert!(commands.iter().any(|c| c == "get_command_info"));
        let resp = proc.execute(
            "zmq",
            "t",
            "get_command_info",
            &json!({"command": "set_label"}),
            None,
        );
        assert_eq!(resp["data"]["args"][0], "component_uid");
    }
}

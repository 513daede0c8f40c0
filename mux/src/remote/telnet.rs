//! Telnet control endpoint: newline-delimited ASCII commands mapped onto
//! the shared command processor. Responses are one JSON line each.
//!
//! With authentication configured, a session must issue
//! `auth <password>` before any other command.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use failure::{bail, Error};
use log::{debug, info, warn};
use serde_json::{json, Value};

use super::CommandProcessor;

pub struct TelnetServer;

impl TelnetServer {
    /// Binds the listener and serves until the shutdown flag rises.
    pub fn spawn(
        port: u16,
        processor: Arc<CommandProcessor>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<std::thread::JoinHandle<()>, Error> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| failure::format_err!("telnet bind port {}: {}", port, e))?;
        listener.set_nonblocking(true)?;
        info!("telnet control listening on port {}", port);
        let handle = std::thread::Builder::new()
            .name("telnet-control".to_owned())
            .spawn(move || accept_loop(listener, processor, shutdown))?;
        Ok(handle)
    }
}

fn accept_loop(
    listener: TcpListener,
    processor: Arc<CommandProcessor>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("telnet client {} connected", peer);
                let processor = Arc::clone(&processor);
                let shutdown = Arc::clone(&shutdown);
                let _ = std::thread::Builder::new()
                    .name(format!("telnet-{}", peer))
                    .spawn(move || {
                        if let Err(e) = serve_client(stream, &processor, &shutdown) {
                            debug!("telnet client {}: {}", peer, e);
                        }
                    });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("telnet accept error: {}", e);
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn serve_client(
    stream: TcpStream,
    processor: &CommandProcessor,
    shutdown: &AtomicBool,
) -> Result<(), Error> {
    let peer = stream.peer_addr()?.to_string();
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut session_auth: Option<String> = None;

    writeln!(writer, "{}", json!({"ready": true, "auth_required": processor.auth_enabled()}))?;

    let mut line = String::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()), // peer closed
            Ok(_) => {}
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            return Ok(());
        }

        let tokens = match tokenize(trimmed) {
            Ok(t) => t,
            Err(e) => {
                writeln!(writer, "{}", json!({"success": false, "error": e.to_string()}))?;
                continue;
            }
        };
        if tokens.first().map(String::as_str) == Some("auth") {
            match tokens.get(1) {
                Some(pw) if processor.verify_password(pw) => {
                    session_auth = Some(pw.clone());
                    writeln!(writer, "{}", json!({"success": true}))?;
                }
                _ => {
                    writeln!(
                        writer,
                        "{}",
                        json!({"success": false, "error": "authentication failed"})
                    )?;
                }
            }
            continue;
        }

        let response = match map_command(&tokens) {
            Ok((command, args)) => {
                processor.execute("telnet", &peer, command, &args, session_auth.as_deref())
            }
            Err(e) => json!({"success": false, "error": e.to_string()}),
        };
        writeln!(writer, "{}", response)?;
    }
}

/// Splits a command line on whitespace, honouring single-quoted strings.
fn tokenize(line: &str) -> Result<Vec<String>, Error> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '\'' => {
                if quoted {
                    tokens.push(std::mem::replace(&mut current, String::new()));
                }
                quoted = !quoted;
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::replace(&mut current, String::new()));
                }
            }
            c => current.push(c),
        }
    }
    if quoted {
        bail!("unterminated quote");
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Maps telnet token lists to (command, args) pairs.
fn map_command(tokens: &[String]) -> Result<(&'static str, Value), Error> {
    let words: Vec<&str> = tokens.iter().map(String::as_str).collect();
    Ok(match words.as_slice() {
        ["help"] | ["list", "commands"] => ("list_commands", json!({})),
        ["get", "statistics"] => ("get_statistics", json!({})),
        ["get", "label", uid] => ("get_label", json!({ "component_uid": uid })),
        ["set", "label", uid, text] => {
            ("set_label", json!({ "component_uid": uid, "text": text }))
        }
        ["get", "service", uid] => ("get_service_info", json!({ "service_uid": uid })),
        ["set", "service", "pty", uid, value] => (
            "set_service_pty",
            json!({ "service_uid": uid, "pty": parse_number(value)? }),
        ),
        ["set", "service", "language", uid, value] => (
            "set_service_language",
            json!({ "service_uid": uid, "language": parse_number(value)? }),
        ),
        ["set", "service", "label", uid, text] => (
            "set_service_label",
            json!({ "service_uid": uid, "text": text }),
        ),
        ["set", "service", "label", uid, text, short] => (
            "set_service_label",
            json!({ "service_uid": uid, "text": text, "short_text": short }),
        ),
        ["get", "services"] => ("get_all_services", json!({})),
        ["get", "components"] => ("get_all_components", json!({})),
        ["get", "subchannels"] => ("get_all_subchannels", json!({})),
        ["get", "inputs"] | ["get", "input_status"] => ("get_input_status", json!({})),
        ["reload", "carousel", uid] => ("reload_carousel", json!({ "component_uid": uid })),
        ["get", "carousel", uid] => ("get_carousel_stats", json!({ "component_uid": uid })),
        ["get", "loglevel"] => ("get_log_level", json!({})),
        ["set", "loglevel", level] => ("set_log_level", json!({ "level": level })),
        ["get", "audit", count] => ("get_audit_log", json!({ "count": parse_number(count)? })),
        ["trigger", "announcement", sid, kind, subch] => (
            "trigger_announcement",
            json!({
                "service_id": parse_number(sid)?,
                "type": kind,
                "subchannel_id": parse_number(subch)?,
            }),
        ),
        ["clear", "announcement", sid, kind] => (
            "clear_announcement",
            json!({ "service_id": parse_number(sid)?, "type": kind }),
        ),
        _ => bail!("unrecognized command {:?}", tokens.join(" ")),
    })
}

fn parse_number(s: &str) -> Result<u64, Error> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map_err(|_| failure::format_err!("bad number {:?}", s));
    }
    s.parse().map_err(|_| failure::format_err!("bad number {:?}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_handles_quotes() {
        assert_eq!(
            tokenize("set label comp1 'Hello World'").unwrap(),
            vec!["set", "label", "comp1", "Hello World"]
        );
        assert_eq!(tokenize("get statistics").unwrap(), vec!["get", "statistics"]);
        assert!(tokenize("set label 'oops").is_err());
    }

    #[test]
    fn command_mapping() {
        let (cmd, args) = map_command(&tokenize("get statistics").unwrap()).unwrap();
        assert_eq!(cmd, "get_statistics");
        assert_eq!(args, json!({}));

        let (cmd, args) =
            map_command(&tokenize("set service pty radio1 10").unwrap()).unwrap();
        assert_eq!(cmd, "set_service_pty");
        assert_eq!(args["service_uid"], "radio1");
        assert_eq!(args["pty"], 10);

        let (cmd, args) =
            map_command(&tokenize("set service label radio1 'New' 'New'").unwrap()).unwrap();
        assert_eq!(cmd, "set_service_label");
        assert_eq!(args["short_text"], "New");

        let (cmd, args) =
            map_command(&tokenize("trigger announcement 0x5001 traffic 0").unwrap()).unwrap();
        assert_eq!(cmd, "trigger_announcement");
        assert_eq!(args["service_id"], 0x5001);

        assert!(map_command(&tokenize("fly me to the moon").unwrap()).is_err());
    }

    #[test]
    fn numbers_accept_hex() {
        assert_eq!(parse_number("10").unwrap(), 10);
        assert_eq!(parse_number("0x5001").unwrap(), 0x5001);
        assert!(parse_number("ten").is_err());
    }
}

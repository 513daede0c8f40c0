//! Audit log: one JSON object per executed command, appended to a file,
//! with credential-looking argument values redacted.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use log::error;
use serde_json::{json, Map, Value};

/// Argument keys containing any of these fragments are redacted.
const SENSITIVE_FRAGMENTS: [&str; 5] = ["password", "auth", "token", "secret", "key"];
pub const REDACTED: &str = "***REDACTED***";

pub struct AuditLogger {
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

impl AuditLogger {
    pub fn disabled() -> Self {
        AuditLogger { path: None, file: None }
    }

    pub fn to_file(path: &str) -> Self {
        if let Some(parent) = PathBuf::from(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => AuditLogger {
                path: Some(PathBuf::from(path)),
                file: Some(Mutex::new(f)),
            },
            Err(e) => {
                error!("audit log {:?} unavailable: {}", path, e);
                AuditLogger::disabled()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        source: &str,
        client: &str,
        command: &str,
        args: &Value,
        success: bool,
        duration_ms: f64,
        error: Option<&str>,
    ) {
        let file = match &self.file {
            Some(f) => f,
            None => return,
        };
        let now = chrono::Utc::now();
        let mut entry = json!({
            "timestamp": now.timestamp_millis() as f64 / 1000.0,
            "timestamp_iso": now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "source": source,
            "client": client,
            "command": command,
            "args": sanitize(args),
            "success": success,
            "duration_ms": (duration_ms * 100.0).round() / 100.0,
        });
        if let Some(err) = error {
            entry["error"] = Value::String(err.to_owned());
        }
        let mut guard = file.lock().expect("audit log lock");
        if let Err(e) = writeln!(guard, "{}", entry) {
            error!("audit log write failed: {}", e);
        }
    }

    /// The last `count` entries, newest first.
    pub fn recent_entries(&self, count: usize) -> Vec<Value> {
        let path = match &self.path {
            Some(p) => p,
            None => return vec![],
        };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(_) => return vec![],
        };
        let mut entries: Vec<Value> = BufReader::new(file)
            .lines()
            .filter_map(|l| l.ok())
            .filter_map(|l| serde_json::from_str(&l).ok())
            .collect();
        let keep = entries.len().saturating_sub(count);
        entries.drain(..keep);
        entries.reverse();
        entries
    }
}

/// Replaces values of credential-looking keys with the redaction marker.
fn sanitize(args: &Value) -> Value {
    match args.as_object() {
        Some(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                let lower = key.to_ascii_lowercase();
                if SENSITIVE_FRAGMENTS.iter().any(|f| lower.contains(f)) {
                    out.insert(key.clone(), Value::String(REDACTED.to_owned()));
                } else {
                    out.insert(key.clone(), value.clone());
                }
            }
            Value::Object(out)
        }
        None => args.clone(),
    }
}

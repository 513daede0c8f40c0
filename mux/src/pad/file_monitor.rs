//! DLS text from a watched file: the first line, polled by mtime at a
//! configured interval. A missing file reads as an empty label.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};

pub struct DlsFileMonitor {
    path: PathBuf,
    poll_interval: Duration,
    last_poll: Option<Instant>,
    last_mtime: Option<SystemTime>,
    missing: bool,
}

impl DlsFileMonitor {
    pub fn new(path: &str, poll_interval: Duration) -> Self {
        DlsFileMonitor {
            path: PathBuf::from(path),
            poll_interval,
            last_poll: None,
            last_mtime: None,
            missing: false,
        }
    }

    /// Polls for a change; returns the new label text when the file
    /// appeared, changed, or went away.
    pub fn update(&mut self) -> Option<String> {
        let now = Instant::now();
        if let Some(last) = self.last_poll {
            if now.duration_since(last) < self.poll_interval {
                return None;
            }
        }
        self.last_poll = Some(now);

        match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                if self.last_mtime == Some(mtime) && !self.missing {
                    return None;
                }
                self.last_mtime = Some(mtime);
                self.missing = false;
                match std::fs::read_to_string(&self.path) {
                    Ok(contents) => {
                        let text = contents.lines().next().unwrap_or("").trim().to_owned();
                        debug!("DLS file {:?} -> {:?}", self.path, text);
                        Some(text)
                    }
                    Err(e) => {
                        warn!("DLS file {:?} read error: {}", self.path, e);
                        None
                    }
                }
            }
            Err(_) => {
                // File disappeared: one transition to the empty label.
                if !self.missing {
                    self.missing = true;
                    self.last_mtime = None;
                    debug!("DLS file {:?} missing, clearing label", self.path);
                    return Some(String::new());
                }
                None
            }
        }
    }
}

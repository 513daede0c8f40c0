//! MOT objects: header + body, loaded from content files with optional
//! YAML sidecar metadata.

use std::path::Path;

use failure::{bail, Error};
use log::debug;
use serde::Deserialize;

use super::header::{self, MotHeader};

#[derive(Clone, Debug)]
pub struct MotObject {
    pub header: MotHeader,
    pub body: Vec<u8>,
    pub transport_id: u16,
    pub enabled: bool,
    /// 1..8; higher transmits more often.
    pub priority: u8,
}

/// Sidecar metadata, `<content file>.yaml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Sidecar {
    transport_id: Option<u16>,
    priority: Option<u8>,
    enabled: Option<bool>,
    content_type: Option<String>,
    content_subtype: Option<u16>,
    content_name: Option<String>,
    category: Option<String>,
    category_id: Option<u8>,
    slide_id: Option<u8>,
    url: Option<String>,
    trigger_time: Option<u32>,
}

impl MotObject {
    pub fn new(header: MotHeader, body: Vec<u8>, transport_id: u16) -> Self {
        MotObject { header, body, transport_id, enabled: true, priority: 1 }
    }

    pub fn total_size(&self) -> usize {
        self.header.encode().len() + self.body.len()
    }

    /// Loads a content file; `default_transport_id` applies when the
    /// sidecar does not assign one.
    pub fn from_file(path: &Path, default_transport_id: u16) -> Result<MotObject, Error> {
        let body = std::fs::read(path)
            .map_err(|e| failure::format_err!("read {:?}: {}", path, e))?;

        let sidecar_path = {
            let mut p = path.as_os_str().to_owned();
            p.push(".yaml");
            std::path::PathBuf::from(p)
        };
        let sidecar: Sidecar = if sidecar_path.exists() {
            let text = std::fs::read_to_string(&sidecar_path)?;
            serde_yaml::from_str(&text)
                .map_err(|e| failure::format_err!("parse {:?}: {}", sidecar_path, e))?
        } else {
            Sidecar::default()
        };

        let priority = sidecar.priority.unwrap_or(1);
        if !(1..=8).contains(&priority) {
            bail!("{:?}: priority {} out of range 1..8", path, priority);
        }

        let content_type = match &sidecar.content_type {
            Some(s) => header::content_type_from_str(s),
            None => {
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                header::content_type_from_extension(ext)
            }
        };

        let mut h = MotHeader::new(body.len() as u32, content_type)?;
        h.content_subtype = sidecar.content_subtype.unwrap_or(0) & 0x01FF;
        let name = sidecar.content_name.clone().unwrap_or_else(|| {
            path.file_name().and_then(|n| n.to_str()).unwrap_or("object").to_owned()
        });
        h.set_content_name(&name);
        if let Some(id) = sidecar.category_id {
            h.set_category_id(id);
        } else if let Some(cat) = &sidecar.category {
            h.set_category_id(parse_category(cat));
        }
        if let Some(id) = sidecar.slide_id {
            h.set_slide_id(id);
        }
        if let Some(url) = &sidecar.url {
            h.set_click_through_url(url);
        }
        if let Some(t) = sidecar.trigger_time {
            h.set_trigger_time(t);
        }

        let obj = MotObject {
            header: h,
            body,
            transport_id: sidecar.transport_id.unwrap_or(default_transport_id),
            enabled: sidecar.enabled.unwrap_or(true),
            priority,
        };
        debug!(
            "MOT object {:?}: tid {}, {} bytes, priority {}",
            path,
            obj.transport_id,
            obj.body.len(),
            obj.priority
        );
        Ok(obj)
    }
}

/// Slideshow CategoryID from a category name.
fn parse_category(s: &str) -> u8 {
    match s.to_ascii_lowercase().as_str() {
        "album_art" | "album" | "cover_art" => 0x01,
        "logo" | "station_logo" => 0x02,
        "programme_info" => 0x03,
        "text" => 0x10,
        "html" => 0x20,
        other => {
            let parsed = other
                .strip_prefix("0x")
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .or_else(|| other.parse().ok());
            parsed.filter(|v| (0x01..=0x20).contains(v)).unwrap_or(0x01)
        }
    }
}

//! MOT headers (ETSI TS 101 499 section 6): 13-bit header size, 28-bit
//! body size, content type/subtype and a TLV parameter list.

use bytes::BufMut;
use failure::{bail, Error};

/// MOT content types (TS 101 499 table 6; 0x60 is the directory).
pub mod content_type {
    pub const GENERAL_DATA: u8 = 0x00;
    pub const TEXT: u8 = 0x01;
    pub const HTML: u8 = 0x02;
    pub const IMAGE_GIF: u8 = 0x03;
    pub const IMAGE_JFIF: u8 = 0x04;
    pub const IMAGE_BMP: u8 = 0x05;
    pub const IMAGE_PNG: u8 = 0x06;
    pub const MOT_TRANSPORT: u8 = 0x60;
}

/// MOT parameter identifiers (TS 101 499 table 8).
pub mod param {
    pub const EXPIRATION_TIME: u8 = 0x04;
    pub const TRIGGER_TIME: u8 = 0x05;
    pub const CONTENT_NAME: u8 = 0x0C;
    pub const CATEGORY_ID: u8 = 0x25;
    pub const SLIDE_ID: u8 = 0x26;
    pub const CATEGORY_TITLE: u8 = 0x27;
    pub const CLICK_THROUGH_URL: u8 = 0x28;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MotParameter {
    /// 6-bit parameter id.
    pub id: u8,
    pub data: Vec<u8>,
}

impl MotParameter {
    /// Encodes the parameter; `more` sets the extension bit when further
    /// parameters follow.
    fn encode(&self, out: &mut Vec<u8>, more: bool) {
        out.put_u8(((self.id & 0x3F) << 2) | if more { 0x01 } else { 0 });
        crate::pad::put_length(out, self.data.len());
        out.extend_from_slice(&self.data);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MotHeader {
    pub body_size: u32,
    pub content_type: u8,
    /// 9-bit content subtype.
    pub content_subtype: u16,
    pub parameters: Vec<MotParameter>,
}

impl MotHeader {
    pub fn new(body_size: u32, content_type: u8) -> Result<Self, Error> {
        if body_size >= 1 << 28 {
            bail!("MOT body size {} exceeds 28 bits", body_size);
        }
        Ok(MotHeader {
            body_size,
            content_type,
            content_subtype: 0,
            parameters: Vec::new(),
        })
    }

    pub fn add_parameter(&mut self, id: u8, data: Vec<u8>) {
        self.parameters.push(MotParameter { id, data });
    }

    pub fn set_content_name(&mut self, name: &str) {
        // Character set indicator: UTF-8.
        let mut data = vec![0x40u8];
        data.extend_from_slice(name.as_bytes());
        self.add_parameter(param::CONTENT_NAME, data);
    }

    pub fn set_category_id(&mut self, category: u8) {
        self.add_parameter(param::CATEGORY_ID, vec![category]);
    }

    pub fn set_slide_id(&mut self, slide_id: u8) {
        self.add_parameter(param::SLIDE_ID, vec![slide_id]);
    }

    pub fn set_click_through_url(&mut self, url: &str) {
        self.add_parameter(param::CLICK_THROUGH_URL, url.as_bytes().to_vec());
    }

    pub fn set_trigger_time(&mut self, seconds: u32) {
        self.add_parameter(param::TRIGGER_TIME, seconds.to_be_bytes().to_vec());
    }

    /// Serializes the header: the 7 fixed bytes then the parameters.
    pub fn encode(&self) -> Vec<u8> {
        let mut params = Vec::new();
        for (i, p) in self.parameters.iter().enumerate() {
            p.encode(&mut params, i + 1 < self.parameters.len());
        }
        let header_size = (7 + params.len()) as u64 & 0x1FFF;

        // 56 fixed bits: header size(13) ‖ body size(28) ‖ content
        // type(6) ‖ content subtype(9).
        let word = (header_size << 43)
            | (u64::from(self.body_size & 0x0FFF_FFFF) << 15)
            | (u64::from(self.content_type & 0x3F) << 9)
            | u64::from(self.content_subtype & 0x01FF);
        let mut out = Vec::with_capacity(7 + params.len());
        out.extend_from_slice(&word.to_be_bytes()[1..]);
        out.extend_from_slice(&params);
        out
    }

    /// Parses an encoded header (tests and the directory body use this).
    pub fn decode(data: &[u8]) -> Result<MotHeader, Error> {
        if data.len() < 7 {
            bail!("MOT header too short: {} bytes", data.len());
        }
        let mut word = 0u64;
        for &b in &data[..7] {
            word = (word << 8) | u64::from(b);
        }
        let header_size = ((word >> 43) & 0x1FFF) as usize;
        let body_size = ((word >> 15) & 0x0FFF_FFFF) as u32;
        let content_type = ((word >> 9) & 0x3F) as u8;
        let content_subtype = (word & 0x01FF) as u16;
        if header_size < 7 {
            bail!("MOT header size field {} below the fixed fields", header_size);
        }
        let mut parameters = Vec::new();
        let mut off = 7;
        while off < header_size.min(data.len()) {
            let id = (data[off] >> 2) & 0x3F;
            let more = data[off] & 0x01 != 0;
            off += 1;
            let (len, consumed) = crate::pad::read_length(&data[off..])
                .ok_or_else(|| failure::format_err!("MOT parameter length truncated"))?;
            off += consumed;
            if off + len > data.len() {
                bail!("MOT parameter data truncated");
            }
            parameters.push(MotParameter { id, data: data[off..off + len].to_vec() });
            off += len;
            if !more {
                break;
            }
        }
        Ok(MotHeader { body_size, content_type, content_subtype, parameters })
    }
}

/// Maps a MIME type or type name from sidecar metadata to the MOT
/// content type.
pub fn content_type_from_str(s: &str) -> u8 {
    match s.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => content_type::IMAGE_JFIF,
        "image/png" => content_type::IMAGE_PNG,
        "image/gif" => content_type::IMAGE_GIF,
        "image/bmp" => content_type::IMAGE_BMP,
        "text/html" => content_type::HTML,
        "text/plain" => content_type::TEXT,
        _ => {
            // Accept a bare MOT code like "0x60".
            if let Some(hex) = s.strip_prefix("0x") {
                if let Ok(v) = u8::from_str_radix(hex, 16) {
                    return v;
                }
            }
            content_type::GENERAL_DATA
        }
    }
}

/// Content type from a file extension.
pub fn content_type_from_extension(ext: &str) -> u8 {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => content_type::IMAGE_JFIF,
        "png" => content_type::IMAGE_PNG,
        "gif" => content_type::IMAGE_GIF,
        "bmp" => content_type::IMAGE_BMP,
        _ => content_type::GENERAL_DATA,
    }
}

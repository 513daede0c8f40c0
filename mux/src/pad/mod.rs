//! Programme-associated data: F-PAD, X-PAD and the PAD data groups that
//! carry DLS (ETSI EN 300 401 section 7.4).
//!
//! The PAD field sits at the end of each audio frame: X-PAD first (zero
//! padded at its start), the two F-PAD bytes last.

pub mod dls;
pub mod file_monitor;

use bytes::BufMut;

use dls::DlsEncoder;

/// X-PAD application type for DLS data groups.
pub const APP_TYPE_DLS: u8 = 2;

/// A PAD data group: header, variable-length field, data and the plain
/// (uninverted) CRC-16.
pub struct PadDataGroup<'a> {
    pub extension: bool,
    pub crc: bool,
    pub segment: bool,
    /// 5-bit user access field (application type).
    pub user_access: u8,
    pub data: &'a [u8],
}

impl<'a> PadDataGroup<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.put_u8(
            (if self.extension { 0x80 } else { 0 })
                | (if self.crc { 0x40 } else { 0 })
                | (if self.segment { 0x20 } else { 0 })
                | (self.user_access & 0x1F),
        );
        put_length(&mut out, self.data.len());
        out.extend_from_slice(self.data);
        if self.crc {
            let crc = fec::crc16_no_invert(&out);
            out.put_u16(crc);
        }
        out
    }
}

/// Variable length field: one byte below 128, else two bytes with the
/// MSB set and 15 bits of length.
pub fn put_length(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.put_u8(len as u8);
    } else {
        out.put_u8(0x80 | ((len >> 8) as u8 & 0x7F));
        out.put_u8(len as u8);
    }
}

/// Reads a variable length field, returning (length, bytes consumed).
pub fn read_length(data: &[u8]) -> Option<(usize, usize)> {
    let first = *data.first()?;
    if first & 0x80 == 0 {
        Some((usize::from(first), 1))
    } else {
        let second = *data.get(1)?;
        Some(((usize::from(first & 0x7F) << 8) | usize::from(second), 2))
    }
}

/// The two F-PAD bytes: CI ‖ application type ‖ reserved, then the L
/// field encoding the X-PAD length as (len - 4) / 2.
pub fn encode_fpad(xpad_len: usize, app_type: u8) -> [u8; 2] {
    if xpad_len == 0 {
        return [0, 0];
    }
    let l = if xpad_len < 4 { 0 } else { ((xpad_len - 4) / 2).min(31) as u8 };
    [0x80 | ((app_type & 0x1F) << 2), l]
}

/// Assembles the complete PAD field for one audio frame.
pub struct PadAssembler {
    pad_length: usize,
    pub dls: DlsEncoder,
}

impl PadAssembler {
    pub fn new(pad_length: usize, dls: DlsEncoder) -> Self {
        PadAssembler { pad_length, dls }
    }

    pub fn pad_length(&self) -> usize {
        self.pad_length
    }

    /// The PAD bytes for this frame: a DLS data group in X-PAD (zero
    /// padded in front), F-PAD at the end. All zeros while no label is
    /// set.
    pub fn next_pad(&mut self) -> Vec<u8> {
        if self.pad_length < 2 {
            return vec![0; self.pad_length];
        }
        let xpad_len = self.pad_length - 2;
        let segment = match self.dls.next_segment() {
            Some(seg) => seg.to_vec(),
            None => return vec![0; self.pad_length],
        };
        let group = PadDataGroup {
            extension: false,
            crc: true,
            segment: true,
            user_access: APP_TYPE_DLS,
            data: &segment,
        }
        .encode();

        let mut pad = vec![0u8; self.pad_length];
        let copy = group.len().min(xpad_len);
        // Data group at the end of the X-PAD region, zeros in front.
        pad[xpad_len - copy..xpad_len].copy_from_slice(&group[..copy]);
        let fpad = encode_fpad(xpad_len, APP_TYPE_DLS);
        pad[xpad_len..].copy_from_slice(&fpad);
        pad
    }
}

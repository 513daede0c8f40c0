//! MSC data groups (ETSI EN 300 401 section 5.3.3): the segmentation
//! layer between MOT objects and MSC packets. The first segment carries
//! the MOT header, the rest carry body chunks.

use bytes::BufMut;

use super::object::MotObject;

/// User access field for MOT.
pub const USER_ACCESS_MOT: u8 = 0x01;
/// Default maximum data bytes per segment for packet mode.
pub const DEFAULT_MAX_SEGMENT: usize = 8188;

#[derive(Clone, Debug)]
pub struct MscDataGroup {
    pub extension: bool,
    pub crc: bool,
    /// More segments follow.
    pub segment: bool,
    pub user_access: u8,
    pub data: Vec<u8>,
}

impl MscDataGroup {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.put_u8(
            (if self.extension { 0x80 } else { 0 })
                | (if self.crc { 0x40 } else { 0 })
                | (if self.segment { 0x20 } else { 0 })
                | (self.user_access & 0x1F),
        );
        crate::pad::put_length(&mut out, self.data.len());
        out.extend_from_slice(&self.data);
        if self.crc {
            let crc = fec::crc16_no_invert(&out);
            out.put_u16(crc);
        }
        out
    }
}

/// Splits one MOT object into data groups: header first, then body
/// chunks of at most `max_segment`.
pub fn segment_object(object: &MotObject, max_segment: usize) -> Vec<MscDataGroup> {
    let mut groups = Vec::new();
    groups.push(MscDataGroup {
        extension: false,
        crc: true,
        segment: !object.body.is_empty(),
        user_access: USER_ACCESS_MOT,
        data: object.header.encode(),
    });
    let mut off = 0;
    while off < object.body.len() {
        let end = (off + max_segment).min(object.body.len());
        groups.push(MscDataGroup {
            extension: false,
            crc: true,
            segment: end < object.body.len(),
            user_access: USER_ACCESS_MOT,
            data: object.body[off..end].to_vec(),
        });
        off = end;
    }
    groups
}

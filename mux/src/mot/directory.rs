//! The MOT directory object (ETSI TS 101 499 section 6.3): an index of
//! every object in the carousel, itself transmitted as the object with
//! TransportId 0.

use bytes::BufMut;

use super::header::{content_type, MotHeader};
use super::object::MotObject;

/// TransportId of the directory object.
pub const DIRECTORY_TRANSPORT_ID: u16 = 0;
/// The directory always transmits at the highest priority.
pub const DIRECTORY_PRIORITY: u8 = 8;

/// One directory entry: TransportId and total object size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub transport_id: u16,
    pub size: u32,
}

impl DirectoryEntry {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.transport_id);
        out.put_u32(self.size);
    }

    pub fn decode(data: &[u8]) -> Option<DirectoryEntry> {
        if data.len() < 6 {
            return None;
        }
        Some(DirectoryEntry {
            transport_id: u16::from_be_bytes([data[0], data[1]]),
            size: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
        })
    }
}

/// Builds the directory object over the given carousel objects.
pub fn build_directory(objects: &[&MotObject]) -> MotObject {
    let mut body = Vec::with_capacity(2 + objects.len() * 6);
    body.put_u16(objects.len() as u16);
    for obj in objects {
        DirectoryEntry {
            transport_id: obj.transport_id,
            size: obj.total_size() as u32,
        }
        .encode(&mut body);
    }
    let header = MotHeader::new(body.len() as u32, content_type::MOT_TRANSPORT)
        .expect("directory body size is bounded");
    let mut dir = MotObject::new(header, body, DIRECTORY_TRANSPORT_ID);
    dir.priority = DIRECTORY_PRIORITY;
    dir
}

/// Parses a directory body back into entries (tests, control surface).
pub fn parse_directory(body: &[u8]) -> Vec<DirectoryEntry> {
    let mut entries = Vec::new();
    if body.len() < 2 {
        return entries;
    }
    let count = usize::from(u16::from_be_bytes([body[0], body[1]]));
    let mut off = 2;
    for _ in 0..count {
        match DirectoryEntry::decode(&body[off..]) {
            Some(e) => {
                entries.push(e);
                off += 6;
            }
            None => break,
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(tid: u16, body_len: usize) -> MotObject {
        let header = MotHeader::new(body_len as u32, content_type::IMAGE_JFIF).unwrap();
        MotObject::new(header, vec![0xAB; body_len], tid)
    }

    #[test]
    fn directory_indexes_all_objects() {
        let a = object(1, 100);
        let b = object(2, 2000);
        let dir = build_directory(&[&a, &b]);
        assert_eq!(dir.transport_id, DIRECTORY_TRANSPORT_ID);
        assert_eq!(dir.priority, DIRECTORY_PRIORITY);
        assert_eq!(dir.header.content_type, content_type::MOT_TRANSPORT);

        let entries = parse_directory(&dir.body);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].transport_id, 1);
        assert_eq!(entries[0].size as usize, a.total_size());
        assert_eq!(entries[1].transport_id, 2);
        assert_eq!(entries[1].size as usize, b.total_size());
    }

    #[test]
    fn empty_directory() {
        let dir = build_directory(&[]);
        assert_eq!(dir.body, vec![0, 0]);
        assert!(parse_directory(&dir.body).is_empty());
    }
}

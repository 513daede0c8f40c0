//! Dynamic Label Segment encoding (ETSI EN 300 401 section 7.4.5.2):
//! label text split into 16-byte segments that cycle continuously, with a
//! toggle bit flipping on every label change.

use log::info;

use crate::charset;

/// Maximum label length in characters.
pub const MAX_LABEL: usize = 128;
/// Maximum text bytes per segment.
pub const MAX_SEGMENT_DATA: usize = 16;

/// DLS character sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DlsCharset {
    EbuLatin,
    Utf8,
}

impl DlsCharset {
    fn code(self) -> u8 {
        match self {
            DlsCharset::EbuLatin => 0,
            DlsCharset::Utf8 => 1,
        }
    }
}

pub struct DlsEncoder {
    charset: DlsCharset,
    label: String,
    segments: Vec<Vec<u8>>,
    segment_index: usize,
    toggle: bool,
}

impl DlsEncoder {
    pub fn new(charset: DlsCharset) -> Self {
        DlsEncoder {
            charset,
            label: String::new(),
            segments: Vec::new(),
            segment_index: 0,
            toggle: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn toggle(&self) -> bool {
        self.toggle
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Installs a new label, re-segmenting and flipping the toggle bit.
    /// Re-setting the current label is a no-op.
    pub fn set_label(&mut self, text: &str) {
        let text: String = text.chars().take(MAX_LABEL).collect();
        if text == self.label && !self.segments.is_empty() {
            return;
        }
        self.toggle = !self.toggle;
        let encoded: Vec<u8> = match self.charset {
            DlsCharset::Utf8 => text.as_bytes().to_vec(),
            DlsCharset::EbuLatin => text.chars().map(charset::encode_char).collect(),
        };
        self.segments = self.segment(&encoded);
        self.segment_index = 0;
        info!(
            "DLS label {:?} ({} segment(s), toggle {})",
            text,
            self.segments.len(),
            self.toggle
        );
        self.label = text;
    }

    fn segment(&self, data: &[u8]) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return vec![vec![self.prefix(0, true)]];
        }
        let count = ((data.len() + MAX_SEGMENT_DATA - 1) / MAX_SEGMENT_DATA).min(8);
        let mut segments = Vec::with_capacity(count);
        for n in 0..count {
            let start = n * MAX_SEGMENT_DATA;
            let end = (start + MAX_SEGMENT_DATA).min(data.len());
            let last = n == count - 1;
            let mut seg = Vec::with_capacity(1 + end - start);
            seg.push(self.prefix(n as u8, last));
            seg.extend_from_slice(&data[start..end]);
            segments.push(seg);
        }
        segments
    }

    /// Prefix byte: toggle ‖ charset(3) ‖ last flag ‖ segment number(3).
    fn prefix(&self, segnum: u8, last: bool) -> u8 {
        (if self.toggle { 0x80 } else { 0 })
            | ((self.charset.code() & 0x07) << 4)
            | (if last { 0x08 } else { 0 })
            | (segnum & 0x07)
    }

    /// The next segment in the continuous cycle, None before any label
    /// was set.
    pub fn next_segment(&mut self) -> Option<&[u8]> {
        if self.segments.is_empty() {
            return None;
        }
        let seg = &self.segments[self.segment_index];
        self.segment_index = (self.segment_index + 1) % self.segments.len();
        Some(seg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_label_is_one_segment() {
        let mut d = DlsEncoder::new(DlsCharset::Utf8);
        d.set_label("Now Playing");
        assert_eq!(d.num_segments(), 1);
        let seg = d.next_segment().unwrap().to_vec();
        // Toggle set on first label, UTF-8, last segment, number 0.
        assert_eq!(seg[0], 0x80 | 0x10 | 0x08);
        assert_eq!(&seg[1..], b"Now Playing");
    }

    #[test]
    fn long_label_segments_and_cycles() {
        let mut d = DlsEncoder::new(DlsCharset::Utf8);
        let text = "A very long dynamic label that needs several segments";
        d.set_label(text);
        let expect_segments = (text.len() + 15) / 16;
        assert_eq!(d.num_segments(), expect_segments);

        let mut collected = Vec::new();
        for i in 0..expect_segments {
            let seg = d.next_segment().unwrap().to_vec();
            assert_eq!(seg[0] & 0x07, i as u8);
            let last = i == expect_segments - 1;
            assert_eq!(seg[0] & 0x08 != 0, last);
            collected.extend_from_slice(&seg[1..]);
        }
        assert_eq!(collected, text.as_bytes());
        // The cycle restarts.
        let seg = d.next_segment().unwrap();
        assert_eq!(seg[0] & 0x07, 0);
    }

    #[test]
    fn toggle_flips_on_change_only() {
        let mut d = DlsEncoder::new(DlsCharset::Utf8);
        d.set_label("one");
        let t1 = d.toggle();
        d.set_label("one");
        assert_eq!(d.toggle(), t1);
        d.set_label("two");
        assert_ne!(d.toggle(), t1);
    }

    #[test]
    fn ebu_latin_charset_code() {
        let mut d = DlsEncoder::new(DlsCharset::EbuLatin);
        d.set_label("abc");
        let seg = d.next_segment().unwrap();
        assert_eq!(seg[0] & 0x70, 0x00);
        assert_eq!(&seg[1..], b"abc");
    }

    #[test]
    fn empty_label_is_single_empty_segment() {
        let mut d = DlsEncoder::new(DlsCharset::Utf8);
        d.set_label("");
        assert_eq!(d.num_segments(), 1);
        let seg = d.next_segment().unwrap();
        assert_eq!(seg.len(), 1);
        assert_eq!(seg[0] & 0x08, 0x08);
    }

    #[test]
    fn label_truncates_at_128() {
        let mut d = DlsEncoder::new(DlsCharset::Utf8);
        let long: String = std::iter::repeat('x').take(200).collect();
        d.set_label(&long);
        assert_eq!(d.label().len(), 128);
        // 128 bytes / 16 = 8 segments, the segment number cap.
        assert_eq!(d.num_segments(), 8);
    }
}

//! DAB+ superframe pipeline (ETSI TS 102 563): buffers AAC access units,
//! groups them into 120 ms superframes, applies the FireCode header CRC
//! and the column-interleaved RS(120,110) protection, and serves one
//! fifth of the protected superframe per 24 ms frame.

pub mod adts;

use failure::Error;
use fec::{FireCode, ReedSolomon};
use log::warn;

use crate::input::InputSource;

/// RS(120,110) row geometry.
const RS_N: usize = 120;
const RS_K: usize = 110;
/// Superframe header: FireCode CRC (2), format byte (1), AU start
/// pointers (8).
const HEADER_LEN: usize = 11;
/// AUs per superframe.
const NUM_AUS: usize = 5;

/// Format byte: 48 kHz, SBR present, stereo, PS present (HE-AAC v2).
const DEFAULT_FORMAT: u8 = 0x28;

pub struct SuperframeBuilder {
    bitrate: u16,
    /// Raw AAC bytes per AU (bitrate * 3).
    au_size: usize,
    /// Raw payload per superframe (bitrate * 15).
    payload_size: usize,
    num_rs_blocks: usize,
    protected_size: usize,
    rs: ReedSolomon,
    firecode: FireCode,
    format_byte: u8,
    /// Complete ADTS frames (and the tail of a split superframe) waiting
    /// to be packed.
    buffer: Vec<u8>,
    /// Raw input bytes not yet resolved into complete frames.
    pending: Vec<u8>,
    /// The five protected AUs of the current superframe.
    aus: Vec<Vec<u8>>,
    au_index: usize,
    superframe_count: u64,
    underruns: u64,
}

impl SuperframeBuilder {
    pub fn new(bitrate: u16) -> Result<Self, Error> {
        let au_size = usize::from(bitrate) * 3;
        let payload_size = au_size * NUM_AUS;
        let num_rs_blocks = (HEADER_LEN + payload_size + RS_K - 1) / RS_K;
        let protected_size = num_rs_blocks * RS_N;
        Ok(SuperframeBuilder {
            bitrate,
            au_size,
            payload_size,
            num_rs_blocks,
            protected_size,
            rs: ReedSolomon::new(RS_N, RS_K)?,
            firecode: FireCode::new(),
            format_byte: DEFAULT_FORMAT,
            buffer: Vec::new(),
            pending: Vec::new(),
            aus: vec![Vec::new(); NUM_AUS],
            au_index: 0,
            superframe_count: 0,
            underruns: 0,
        })
    }

    pub fn bitrate(&self) -> u16 {
        self.bitrate
    }

    pub fn au_size(&self) -> usize {
        self.au_size
    }

    /// Size of one fifth of the protected superframe.
    pub fn protected_au_size(&self) -> usize {
        self.protected_size / NUM_AUS
    }

    pub fn protected_size(&self) -> usize {
        self.protected_size
    }

    /// Completed superframes (all five AUs served).
    pub fn superframe_count(&self) -> u64 {
        self.superframe_count
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.pending.len()
    }

    /// Accepts raw ADTS bytes, extracting every complete AAC frame.
    /// Bytes without a sync word are discarded.
    pub fn feed(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        loop {
            match adts::read_frame(&self.pending) {
                Some((_, frame, consumed)) => {
                    self.buffer.extend_from_slice(frame);
                    self.pending.drain(..consumed);
                }
                None => {
                    // Drop everything before a potential sync so garbage
                    // cannot grow the pending buffer without bound.
                    if let Some(sync) = adts::find_sync(&self.pending, 0) {
                        if sync > 0 {
                            self.pending.drain(..sync);
                        }
                    } else if self.pending.len() > 1 {
                        let keep = self.pending.len() - 1;
                        self.pending.drain(..keep);
                    }
                    return;
                }
            }
        }
    }

    /// Resets all buffered state after an input discontinuity.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending.clear();
        for au in &mut self.aus {
            au.clear();
        }
        self.au_index = 0;
    }

    /// Serves the next protected AU, building a fresh superframe when the
    /// round-robin index wraps to the first AU.
    pub fn next_au(&mut self) -> Vec<u8> {
        if self.au_index == 0 {
            self.build_superframe();
        }
        let au = self.aus[self.au_index].clone();
        self.au_index = (self.au_index + 1) % NUM_AUS;
        if self.au_index == 0 {
            self.superframe_count += 1;
        }
        au
    }

    fn build_superframe(&mut self) {
        let mut payload;
        if self.buffer.is_empty() {
            // No audio at all: a silent superframe with a valid header
            // and FEC keeps receivers locked.
            warn!("superframe build with empty buffer, inserting silence");
            self.underruns += 1;
            payload = vec![0u8; self.payload_size];
        } else if self.buffer.len() < self.payload_size {
            warn!(
                "superframe underrun: {} of {} bytes, zero padding",
                self.buffer.len(),
                self.payload_size
            );
            self.underruns += 1;
            payload = std::mem::replace(&mut self.buffer, Vec::new());
            payload.resize(self.payload_size, 0);
        } else {
            payload = self.buffer.drain(..self.payload_size).collect();
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + self.payload_size);
        frame.extend_from_slice(&self.build_header());
        frame.append(&mut payload);
        let protected = self.protect(&frame);

        let au_len = self.protected_au_size();
        for (i, au) in self.aus.iter_mut().enumerate() {
            au.clear();
            au.extend_from_slice(&protected[i * au_len..(i + 1) * au_len]);
        }
    }

    /// The 11-byte superframe header: FireCode over bytes 2..10, the
    /// format byte and four 12-bit AU start pointers for AUs 1..4 (AU 0
    /// begins right after the header).
    fn build_header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[2] = self.format_byte;
        let mut bitpos = 24usize; // after CRC and format byte
        for i in 1..NUM_AUS {
            let start = (HEADER_LEN + i * self.au_size) as u32 & 0x0FFF;
            let byte = bitpos / 8;
            if bitpos % 8 == 0 {
                header[byte] = (start >> 4) as u8;
                header[byte + 1] |= ((start & 0x0F) << 4) as u8;
            } else {
                header[byte] |= (start >> 8) as u8;
                header[byte + 1] = start as u8;
            }
            bitpos += 12;
        }
        let crc = self.firecode.calculate(&header[2..HEADER_LEN]);
        header[0] = (crc >> 8) as u8;
        header[1] = crc as u8;
        header
    }

    /// Column interleaving per ETSI TS 102 563: data fills the first 110
    /// columns top to bottom, each row is RS encoded into columns
    /// 110..119, and the array is read out row by row.
    fn protect(&self, data: &[u8]) -> Vec<u8> {
        let rows = self.num_rs_blocks;
        let mut matrix = vec![[0u8; RS_N]; rows];
        let mut idx = 0;
        for col in 0..RS_K {
            for row in matrix.iter_mut() {
                row[col] = if idx < data.len() { data[idx] } else { 0 };
                idx += 1;
            }
        }
        let mut out = Vec::with_capacity(self.protected_size);
        for row in &mut matrix {
            let parity = self
                .rs
                .encode(&row[..RS_K])
                .expect("row length equals RS k");
            row[RS_K..].copy_from_slice(&parity);
            out.extend_from_slice(&row[..]);
        }
        out
    }
}

/// Wraps a raw input source for a DAB+ subchannel: pulls one AU's worth
/// of ADTS bytes per tick and serves protected AUs in their place.
pub struct DabPlusInput {
    inner: Box<dyn InputSource>,
    builder: SuperframeBuilder,
}

impl DabPlusInput {
    pub fn new(inner: Box<dyn InputSource>, bitrate: u16) -> Result<Self, Error> {
        Ok(DabPlusInput { inner, builder: SuperframeBuilder::new(bitrate)? })
    }

    pub fn builder(&self) -> &SuperframeBuilder {
        &self.builder
    }
}

impl InputSource for DabPlusInput {
    fn open(&mut self) -> Result<(), Error> {
        self.inner.open()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn read_frame(&mut self, size: usize) -> Vec<u8> {
        let au_size = self.builder.au_size();
        let raw = self.inner.read_frame(au_size);
        // Zero fill from an underrunning source carries no sync word and
        // is discarded by the frame parser.
        self.builder.feed(&raw);
        let mut au = self.builder.next_au();
        au.resize(size, 0);
        au
    }

    fn bitrate(&self) -> u16 {
        self.inner.bitrate()
    }

    fn close(&mut self) {
        self.inner.close();
        self.builder.reset();
    }

    fn underruns(&self) -> u64 {
        self.inner.underruns() + self.builder.underruns()
    }

    fn buffered(&self) -> usize {
        self.inner.buffered() + self.builder.buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_for_48_kbps() {
        let b = SuperframeBuilder::new(48).unwrap();
        assert_eq!(b.au_size(), 144);
        // 11 + 720 = 731 bytes -> 7 rows -> 840 protected bytes.
        assert_eq!(b.num_rs_blocks, 7);
        assert_eq!(b.protected_size(), 840);
        assert_eq!(b.protected_au_size(), 168);
    }

    #[test]
    fn builds_from_six_frames_with_remainder() {
        let mut b = SuperframeBuilder::new(48).unwrap();
        for i in 0..6 {
            b.feed(&adts::synth_frame(128, i as u8));
        }
        assert_eq!(b.buffered(), 768);

        // Five AU reads serve one superframe and wrap.
        let mut aus = vec![];
        for _ in 0..5 {
            aus.push(b.next_au());
        }
        assert!(aus.iter().all(|au| au.len() == 168));
        assert_eq!(b.superframe_count(), 1);
        assert_eq!(b.underruns(), 0);
        // 768 - 720 = 48 bytes carry into the next superframe.
        assert_eq!(b.buffered(), 48);
    }

    #[test]
    fn header_has_valid_firecode() {
        let mut b = SuperframeBuilder::new(48).unwrap();
        b.feed(&adts::synth_frame(800, 0x33));
        let _ = b.next_au();
        // Reconstruct the de-interleaved header from the protected AUs:
        // column-major readback of the first 11 data positions.
        let mut protected = vec![];
        protected.extend_from_slice(&b.aus[0]);
        for au in &b.aus[1..] {
            protected.extend_from_slice(au);
        }
        let rows = b.num_rs_blocks;
        let mut header = [0u8; HEADER_LEN];
        for (i, h) in header.iter_mut().enumerate() {
            let col = i / rows;
            let row = i % rows;
            *h = protected[row * RS_N + col];
        }
        let crc = (u16::from(header[0]) << 8) | u16::from(header[1]);
        assert_eq!(crc, FireCode::new().calculate(&header[2..]));
        assert_eq!(header[2], DEFAULT_FORMAT);
    }

    #[test]
    fn rows_are_valid_codewords() {
        let mut b = SuperframeBuilder::new(48).unwrap();
        b.feed(&adts::synth_frame(731, 0x5A));
        let _ = b.next_au();
        let mut protected = vec![];
        for au in &b.aus {
            protected.extend_from_slice(au);
        }
        let rs = ReedSolomon::new(RS_N, RS_K).unwrap();
        for row in protected.chunks(RS_N) {
            let expect = rs.encode_block(&row[..RS_K]).unwrap();
            assert_eq!(&expect[..], row);
        }
    }

    #[test]
    fn empty_buffer_yields_silent_superframe() {
        let mut b = SuperframeBuilder::new(24).unwrap();
        let au = b.next_au();
        assert_eq!(au.len(), b.protected_au_size());
        assert_eq!(b.underruns(), 1);
        // Payload columns past the header are all zero before parity.
    }

    #[test]
    fn partial_buffer_is_padded_and_counted() {
        let mut b = SuperframeBuilder::new(48).unwrap();
        b.feed(&adts::synth_frame(100, 1));
        let _ = b.next_au();
        assert_eq!(b.underruns(), 1);
        assert_eq!(b.buffered(), 0);
    }

    #[test]
    fn au_pointers_encode_au_starts() {
        let b = SuperframeBuilder::new(48).unwrap();
        let header = b.build_header();
        // AU 1 starts at 11 + 144 = 155 = 0x09B.
        assert_eq!(header[3], 0x09);
        assert_eq!(header[4] >> 4, 0xB);
        // AU 2 at 11 + 288 = 299 = 0x12B, packed into the low nibble of
        // byte 4 and byte 5.
        assert_eq!(header[4] & 0x0F, 0x1);
        assert_eq!(header[5], 0x2B);
    }
}

//! ETI(NI) frame assembly (ETSI EN 300 799): every 24 ms one 6144-byte
//! frame of ERR, FSYNC, FC, STC, EOH, FIC, MST, EOF and TIST, padded
//! with 0x55.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use failure::Error;

use crate::ensemble::TransmissionMode;

pub const FRAME_SIZE: usize = 6144;
/// FSYNC for even frame counts; the other phase is its complement
/// pattern.
pub const FSYNC_EVEN: u32 = 0xF8C549;
pub const FSYNC_ODD: u32 = 0x073AB6;
/// FCT counts modulo 250.
pub const FCT_MODULUS: u64 = 250;

/// One subchannel's contribution to a frame.
pub struct StreamSpec<'a> {
    /// SubChId.
    pub scid: u8,
    /// Start address in CUs.
    pub sad: u16,
    /// Type and protection level, 6 bits.
    pub tpl: u8,
    /// Frame payload; its length is a multiple of 4 (CU aligned).
    pub data: &'a [u8],
}

impl<'a> StreamSpec<'a> {
    /// Stream length in 32-bit words, as carried in the STC and summed
    /// into FL.
    pub fn stl(&self) -> u16 {
        (self.data.len() / 4) as u16
    }
}

pub struct EtiFrameBuilder {
    mode: TransmissionMode,
    mnsc: u16,
}

impl EtiFrameBuilder {
    pub fn new(mode: TransmissionMode, mnsc: u16) -> Self {
        EtiFrameBuilder { mode, mnsc }
    }

    /// Assembles the frame for `frame_number`. `tist` carries the 24-bit
    /// sub-second tick count, or None when timestamping is disabled.
    pub fn build(
        &self,
        frame_number: u64,
        fic: &[u8],
        streams: &[StreamSpec<'_>],
        tist: Option<u32>,
    ) -> Bytes {
        debug_assert_eq!(fic.len(), crate::fic::FIC_SIZE);

        let fct = (frame_number % FCT_MODULUS) as u8;
        let fsync = if fct % 2 == 0 { FSYNC_EVEN } else { FSYNC_ODD };
        let nst = streams.len();
        let stl_total: u32 = streams.iter().map(|s| u32::from(s.stl())).sum();
        let fl = (3 + nst as u32 + stl_total) & 0x07FF;

        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        buf.put_u8(0xFF); // ERR: no error
        buf.put_u8((fsync >> 16) as u8);
        buf.put_u8((fsync >> 8) as u8);
        buf.put_u8(fsync as u8);

        // FC: FCT, FICF ‖ NST, FP ‖ MID ‖ FL.
        let header_start = buf.len();
        let fp = (frame_number % 8) as u8;
        buf.put_u8(fct);
        buf.put_u8(0x80 | (nst as u8 & 0x7F));
        buf.put_u8((fp << 5) | ((self.mode.mid() & 0x03) << 3) | ((fl >> 8) as u8 & 0x07));
        buf.put_u8(fl as u8);

        // STC: TPL ‖ SAd ‖ STL ‖ SCID per stream.
        for s in streams {
            let word = (u32::from(s.tpl & 0x3F) << 26)
                | (u32::from(s.sad & 0x03FF) << 16)
                | (u32::from(s.stl() & 0x03FF) << 6)
                | u32::from(s.scid & 0x3F);
            buf.put_u32(word);
        }

        // EOH: MNSC then CRC over FC + STC.
        let crc = fec::crc16(&buf[header_start..]);
        buf.put_u16(self.mnsc);
        buf.put_u16(crc);

        buf.put_slice(fic);

        // MST: streams at their CU-aligned offsets.
        let mst_start = buf.len();
        buf.resize(mst_start + stl_total as usize * 4, 0);
        for s in streams {
            let off = mst_start + usize::from(s.sad) * 4;
            buf[off..off + s.data.len()].copy_from_slice(s.data);
        }

        // EOF: CRC over MST, then RFU.
        let crc = fec::crc16(&buf[mst_start..]);
        buf.put_u16(crc);
        buf.put_u16(0xFFFF);

        match tist {
            Some(ticks) => {
                buf.put_u8((ticks >> 16) as u8);
                buf.put_u8((ticks >> 8) as u8);
                buf.put_u8(ticks as u8);
                buf.put_u8(0xFF);
            }
            None => buf.put_u32(0xFFFF_FFFF),
        }

        debug_assert!(buf.len() <= FRAME_SIZE);
        buf.resize(FRAME_SIZE, 0x55);
        buf.freeze()
    }
}

/// ETI file output framing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EtiFormat {
    /// Bare 6144-byte frames (etisnoop/dablin compatible).
    Raw,
    /// Each frame prefixed with its length as 32-bit big endian.
    Framed,
    /// Raw with a flush after every frame.
    Streamed,
}

impl std::str::FromStr for EtiFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "raw" => Ok(EtiFormat::Raw),
            "framed" => Ok(EtiFormat::Framed),
            "streamed" => Ok(EtiFormat::Streamed),
            _ => failure::bail!("unknown ETI format {:?} (raw, framed, streamed)", s),
        }
    }
}

pub struct EtiFileSink {
    file: File,
    format: EtiFormat,
}

impl EtiFileSink {
    pub fn create(path: &Path, format: EtiFormat) -> Result<Self, Error> {
        let file = File::create(path)
            .map_err(|e| failure::format_err!("create {:?}: {}", path, e))?;
        Ok(EtiFileSink { file, format })
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        if self.format == EtiFormat::Framed {
            self.file.write_all(&(frame.len() as u32).to_be_bytes())?;
        }
        self.file.write_all(frame)?;
        if self.format == EtiFormat::Streamed {
            self.file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_fic() -> [u8; crate::fic::FIC_SIZE] {
        let mut fic = [0u8; crate::fic::FIC_SIZE];
        for fib in 0..3 {
            fic[fib * 32] = 0xFF;
            let crc = fec::crc16(&fic[fib * 32..fib * 32 + 30]);
            fic[fib * 32 + 30..fib * 32 + 32].copy_from_slice(&crc.to_be_bytes());
        }
        fic
    }

    #[test]
    fn frame_is_6144_bytes() {
        let b = EtiFrameBuilder::new(TransmissionMode::I, 0);
        let frame = b.build(0, &empty_fic(), &[], None);
        assert_eq!(frame.len(), FRAME_SIZE);
    }

    #[test]
    fn fsync_alternates() {
        let b = EtiFrameBuilder::new(TransmissionMode::I, 0);
        let mut prev = None;
        for n in 0u64..5 {
            let frame = b.build(n, &empty_fic(), &[], None);
            let fsync = (u32::from(frame[1]) << 16)
                | (u32::from(frame[2]) << 8)
                | u32::from(frame[3]);
            let expected = if n % 2 == 0 { FSYNC_EVEN } else { FSYNC_ODD };
            assert_eq!(fsync, expected);
            if let Some(p) = prev {
                assert_ne!(fsync, p);
            }
            prev = Some(fsync);
        }
    }

    #[test]
    fn fct_wraps_at_250() {
        let b = EtiFrameBuilder::new(TransmissionMode::I, 0);
        assert_eq!(b.build(249, &empty_fic(), &[], None)[4], 249);
        assert_eq!(b.build(250, &empty_fic(), &[], None)[4], 0);
    }

    #[test]
    fn empty_frame_header_fields() {
        let b = EtiFrameBuilder::new(TransmissionMode::I, 0);
        let frame = b.build(0, &empty_fic(), &[], None);
        assert_eq!(frame[5], 0x80); // FICF set, NST 0
        let fl = ((u16::from(frame[6]) & 0x07) << 8) | u16::from(frame[7]);
        assert_eq!(fl, 3);
        // EOH CRC over FC only.
        let crc = u16::from_be_bytes([frame[10], frame[11]]);
        assert_eq!(crc, fec::crc16(&frame[4..8]));
        // EOF directly after the FIC; CRC over zero MST bytes.
        let eof = 12 + 96;
        assert_eq!(u16::from_be_bytes([frame[eof], frame[eof + 1]]), fec::crc16(&[]));
        assert_eq!(&frame[eof + 2..eof + 4], &[0xFF, 0xFF]);
        // TIST disabled.
        assert_eq!(&frame[eof + 4..eof + 8], &[0xFF, 0xFF, 0xFF, 0xFF]);
        // Padding.
        assert!(frame[eof + 8..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn stream_lands_at_cu_offset() {
        let b = EtiFrameBuilder::new(TransmissionMode::I, 0);
        let data = vec![0xABu8; 384];
        let streams = [StreamSpec { scid: 0, sad: 0, tpl: 35, data: &data }];
        let frame = b.build(0, &empty_fic(), &streams, Some(12345));
        // FL = 3 + 1 + 96 words.
        let fl = ((u16::from(frame[6]) & 0x07) << 8) | u16::from(frame[7]);
        assert_eq!(fl, 3 + 1 + 96);
        // STC word.
        let stc = u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]);
        assert_eq!(stc >> 26, 35);
        assert_eq!((stc >> 16) & 0x3FF, 0);
        assert_eq!((stc >> 6) & 0x3FF, 96);
        assert_eq!(stc & 0x3F, 0);
        // MST follows EOH + FIC.
        let mst = 8 + 4 + 4 + 96;
        assert!(frame[mst..mst + 384].iter().all(|&b| b == 0xAB));
        // EOF CRC covers the MST.
        let eof = mst + 384;
        assert_eq!(
            u16::from_be_bytes([frame[eof], frame[eof + 1]]),
            fec::crc16(&frame[mst..eof])
        );
        // TIST carries the ticks and filler.
        let tist = eof + 4;
        assert_eq!(&frame[tist..tist + 4], &[0x00, 0x30, 0x39, 0xFF]);
    }
}

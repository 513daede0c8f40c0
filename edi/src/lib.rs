//! EDI output encoding (ETSI TS 102 693 / TS 102 821): wraps ETI frame
//! content in TAGged AF packets, optionally fragments them through the
//! PFT layer, and hands the resulting packets to UDP/TCP transports.

pub mod af;
pub mod pft;
pub mod transport;

use failure::Error;
use log::warn;

use pft::{PftConfig, PftFragmenter};
use transport::Transport;

/// One subchannel stream of a frame.
pub struct EdiStream<'a> {
    pub scid: u8,
    pub sad: u16,
    pub tpl: u8,
    pub data: &'a [u8],
}

/// Everything one ETI frame contributes to an AF packet.
pub struct EdiFrame<'a> {
    /// DAB logical frame count, modulo 2^24 on the wire.
    pub dlfc: u32,
    pub fct: u8,
    pub fp: u8,
    pub mid: u8,
    pub fic: &'a [u8],
    pub streams: &'a [EdiStream<'a>],
    /// TAI seconds since the EDI epoch.
    pub seconds: u32,
    /// Sub-second ticks at 1/16384000 s.
    pub ticks: u32,
    pub timestamp_valid: bool,
}

pub struct EdiEncoder {
    seq: u16,
    pft: Option<PftFragmenter>,
    transports: Vec<Box<dyn Transport>>,
}

impl EdiEncoder {
    pub fn new(pft: Option<PftConfig>) -> Result<Self, Error> {
        let pft = match pft {
            Some(config) => Some(PftFragmenter::new(config)?),
            None => None,
        };
        Ok(EdiEncoder { seq: 0, pft, transports: Vec::new() })
    }

    pub fn add_transport(&mut self, transport: Box<dyn Transport>) {
        self.transports.push(transport);
    }

    /// Builds the wire packets for one frame: a single AF packet, or its
    /// PF fragments when PFT is enabled.
    pub fn encode_frame(&mut self, frame: &EdiFrame<'_>) -> Result<Vec<Vec<u8>>, Error> {
        let mut tags = Vec::with_capacity(3 + frame.streams.len());
        tags.push(af::tag_ptr());
        tags.push(af::tag_deti(
            frame.dlfc & 0xFF_FFFF,
            frame.mid,
            frame.fp,
            frame.fct,
            frame.fic,
        ));
        for (i, stream) in frame.streams.iter().enumerate() {
            tags.push(af::tag_est(
                (i + 1) as u8,
                stream.scid,
                stream.sad,
                stream.tpl,
                stream.data,
            ));
        }
        if frame.timestamp_valid {
            tags.push(af::tag_tist(frame.seconds, frame.ticks));
        }

        let packet = af::assemble(self.seq, &tags);
        self.seq = self.seq.wrapping_add(1);

        match &mut self.pft {
            Some(pft) => Ok(pft
                .fragment(&packet)?
                .iter()
                .map(|f| f.assemble())
                .collect()),
            None => Ok(vec![packet]),
        }
    }

    /// Encodes and sends one frame to every transport. Transport errors
    /// are counted by the transports, never propagated.
    pub fn send_frame(&mut self, frame: &EdiFrame<'_>) -> Result<(), Error> {
        let packets = self.encode_frame(frame)?;
        for transport in &mut self.transports {
            for packet in &packets {
                transport.send_packet(packet);
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        for transport in &mut self.transports {
            transport.flush();
        }
    }

    pub fn report_errors(&self) {
        for transport in &self.transports {
            let errors = transport.error_count();
            if errors > 0 {
                warn!("EDI transport reported {} send error(s)", errors);
            }
        }
    }
}

//! Input sources for pre-encoded subchannel streams.
//!
//! Every source delivers exactly the requested number of bytes per 24 ms
//! tick, zero-filling on underrun, and returns in bounded time; network
//! and FIFO sources buffer internally to guarantee that.

mod file;
mod fifo;
mod udp;

pub use file::FileInput;
pub use fifo::FifoInput;
pub use udp::UdpInput;

use failure::{bail, Error};

/// A stream source feeding one subchannel.
pub trait InputSource: Send {
    fn open(&mut self) -> Result<(), Error>;
    fn is_open(&self) -> bool;
    /// Returns exactly `size` bytes, zero-filled on underrun. Must return
    /// well within one 24 ms tick.
    fn read_frame(&mut self, size: usize) -> Vec<u8>;
    fn bitrate(&self) -> u16;
    fn close(&mut self);
    /// Total underruns since open.
    fn underruns(&self) -> u64;
    /// Bytes (or whole frames, for datagram sources) currently buffered.
    fn buffered(&self) -> usize {
        0
    }
}

/// A parsed input URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputUri {
    File { path: String, looping: bool },
    Fifo { path: String },
    Udp { host: String, port: u16 },
}

impl InputUri {
    /// Parses `file://`, `fifo://` and `udp://` URIs. An absolute path
    /// without a scheme is a file. `edi://` is reserved but not carried
    /// by the core.
    pub fn parse(uri: &str) -> Result<InputUri, Error> {
        if let Some(rest) = uri.strip_prefix("file://") {
            let (path, query) = match rest.find('?') {
                Some(i) => (&rest[..i], &rest[i + 1..]),
                None => (rest, ""),
            };
            let mut looping = false;
            for kv in query.split('&').filter(|s| !s.is_empty()) {
                match kv {
                    "loop=true" => looping = true,
                    "loop=false" => looping = false,
                    _ => bail!("unknown file input option {:?}", kv),
                }
            }
            Ok(InputUri::File { path: path.to_owned(), looping })
        } else if let Some(path) = uri.strip_prefix("fifo://") {
            Ok(InputUri::Fifo { path: path.to_owned() })
        } else if let Some(rest) = uri.strip_prefix("udp://") {
            let mut parts = rest.rsplitn(2, ':');
            let port = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| failure::format_err!("udp input {:?} lacks a port", uri))?;
            let host = match parts.next() {
                Some(h) if !h.is_empty() => h.to_owned(),
                _ => bail!("udp input {:?} lacks a host", uri),
            };
            Ok(InputUri::Udp { host, port })
        } else if uri.starts_with("edi://") {
            bail!("edi:// input is reserved and not implemented");
        } else if uri.starts_with('/') {
            Ok(InputUri::File { path: uri.to_owned(), looping: false })
        } else {
            bail!("unrecognized input URI {:?}", uri);
        }
    }
}

/// Builds the source for a subchannel input URI. The caller opens it;
/// an open failure leaves the subchannel in zero-fill mode.
pub fn create_input(uri: &str, bitrate: u16) -> Result<Box<dyn InputSource>, Error> {
    match InputUri::parse(uri)? {
        InputUri::File { path, looping } => Ok(Box::new(FileInput::new(&path, bitrate, looping))),
        InputUri::Fifo { path } => Ok(Box::new(FifoInput::new(&path, bitrate))),
        InputUri::Udp { host, port } => Ok(Box::new(UdpInput::new(&host, port, bitrate))),
    }
}

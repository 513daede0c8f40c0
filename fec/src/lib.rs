//! Error protection primitives shared by the DAB multiplexer:
//! CRC-16-CCITT (both DAB variants), the DAB+ superframe FireCode, and a
//! systematic Reed-Solomon encoder over GF(2^8).

mod crc;
mod firecode;
mod reed_solomon;

pub use crc::{crc16, crc16_no_invert};
pub use firecode::FireCode;
pub use reed_solomon::ReedSolomon;

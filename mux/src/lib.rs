//! DAB/DAB+ ensemble multiplexer core.
//!
//! Assembles audio subchannels, FIC signalling and programme-associated
//! data into 6144-byte ETI frames (ETSI EN 300 799) on a 24 ms cadence.
//! See the following references:
//! *   ETSI EN 300 401: Radio Broadcasting Systems; DAB to mobile,
//!     portable and fixed receivers.
//! *   ETSI EN 300 799: Ensemble Transport Interface (ETI).
//! *   ETSI TS 102 563: Transport of Advanced Audio Coding (AAC) audio
//!     (DAB+ superframes).
//! *   ETSI TR 101 496-2: Guidelines and rules for implementation and
//!     operation (FIG repetition rates).

pub mod charset;
pub mod config;
pub mod dabplus;
pub mod ensemble;
pub mod eti;
pub mod fic;
pub mod fig;
pub mod input;
pub mod mot;
pub mod mux;
pub mod pad;
pub mod remote;
pub mod stats;
pub mod timestamp;

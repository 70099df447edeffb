#[macro_use]
extern crate log;

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy from spec.md §7: kinds, not types. The core treats all of these
/// as fatal at the call boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A trace line could not be parsed.
    MalformedInput(String),

    /// An unrecognized strategy tag.
    InvalidStrategy(String),

    /// An out-of-range rate or size passed to a constructor.
    InvalidParameter(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedInput(msg) => write!(f, "malformed input: {msg}"),
            Error::InvalidStrategy(tag) => write!(f, "invalid strategy: {tag:?}"),
            Error::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub mod decoder;
pub mod drop;
pub mod injector;
pub mod model;
pub mod simulator;
pub mod stats;
pub mod trace;

pub use model::{Direction, Metadata, OutputPacket, Packet, ScheduledPacket, SimId, Strategy};

//! Error types shared by all formats.

use std::fmt;

use thiserror::Error;

use crate::model::PreviewKind;
use crate::rle::RleError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong reading or writing a file.
///
/// Malformed input is never transient, so none of these are worth retrying.
#[derive(Debug, Error)]
pub enum Error {
    /// The magic number (or mark) at offset zero does not belong to the
    /// format being decoded. This is checked before anything else so that
    /// feeding garbage to a decoder gives a useful message.
    #[error("not a {format} file (magic 0x{found:08x})")]
    FormatMismatch { format: &'static str, found: u32 },
    /// The magic matched, but the version field is one we don't handle.
    #[error("{format} version {version} is not supported")]
    UnsupportedVersion { format: &'static str, version: u32 },
    /// A record or payload reference points outside the file.
    #[error(
        "file truncated: {len} bytes at offset 0x{offset:x} exceed \
         {available}-byte file"
    )]
    Truncated {
        offset: u64,
        len: u64,
        available: usize,
    },
    /// A compressed payload did not decode to exactly the expected image.
    #[error("corrupt {payload}: {source}")]
    CorruptPayload {
        payload: Payload,
        #[source]
        source: RleError,
    },
    /// A setting can't be represented in the requested format.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }
}

/// Identifies which compressed payload failed to decode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    Layer(u32),
    Preview(PreviewKind),
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Layer(i) => write!(f, "layer {}", i),
            Payload::Preview(kind) => write!(f, "{:?} preview", kind),
        }
    }
}

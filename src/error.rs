//! Error types for the relay core.
//!
//! Mirrors the hand-rolled `Display` + `std::error::Error` style used
//! throughout this workspace (see `RegistryError`, `UnknownEncoding`)
//! rather than reaching for a derive-macro error crate.

use std::fmt;
use std::io;

/// A malformed or unparseable CapUrn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapUrnError {
    /// Text did not start with the `cap:` prefix.
    MissingPrefix,
    /// The `in=` field was absent.
    MissingIn,
    /// The `out=` field was absent.
    MissingOut,
    /// A field's quoted value was never closed.
    UnterminatedQuote,
    /// A `key=value` pair could not be split.
    MalformedField(String),
}

impl fmt::Display for CapUrnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapUrnError::MissingPrefix => write!(f, "cap urn must start with 'cap:'"),
            CapUrnError::MissingIn => write!(f, "cap urn missing required 'in=' field"),
            CapUrnError::MissingOut => write!(f, "cap urn missing required 'out=' field"),
            CapUrnError::UnterminatedQuote => write!(f, "cap urn has an unterminated quoted value"),
            CapUrnError::MalformedField(field) => write!(f, "malformed cap urn field: {field}"),
        }
    }
}

impl std::error::Error for CapUrnError {}

/// Errors surfaced while reading/writing length-delimited frames.
#[derive(Debug)]
pub enum ProtocolError {
    /// A plain string message, for invariant violations that don't fit a
    /// more specific variant (construction with an empty master list, a
    /// non-routable frame kind passed to `sendToMaster`, ...).
    Message(String),
    /// The length-prefix varint exceeded the maximum varint length.
    VarintTooLong,
    /// The stream ended mid-varint (after some bytes were read, before EOF).
    TruncatedVarint,
    /// A frame or one of its fields exceeded the active limit.
    LimitExceeded(LimitExceeded),
    /// Underlying I/O failure.
    Io(io::Error),
    /// A record's bytes didn't decode as a valid frame.
    Decode(String),
}

impl ProtocolError {
    pub fn msg(s: impl Into<String>) -> Self {
        ProtocolError::Message(s.into())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Message(m) => write!(f, "{m}"),
            ProtocolError::VarintTooLong => write!(f, "length prefix varint exceeded 10 bytes"),
            ProtocolError::TruncatedVarint => {
                write!(f, "stream ended before varint length prefix terminated")
            }
            ProtocolError::LimitExceeded(e) => write!(f, "{e}"),
            ProtocolError::Io(e) => write!(f, "io error: {e}"),
            ProtocolError::Decode(m) => write!(f, "frame decode error: {m}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

/// A frame or chunk exceeded a negotiated size limit on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitExceeded {
    pub field: LimitField,
    pub len: usize,
    pub max: usize,
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} of {} bytes exceeds negotiated limit of {} bytes",
            self.field, self.len, self.max
        )
    }
}

impl std::error::Error for LimitExceeded {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitField {
    Frame,
    Chunk,
}

/// Raised when a REQ's CapUrn matches no master, or a continuation frame
/// references an unknown request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoHandler {
    /// No master's advertised capabilities accept this CapUrn.
    CapUrn(String),
    /// A CHUNK/END referenced a request id with no recorded affinity.
    UnknownRequestId,
}

impl fmt::Display for NoHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoHandler::CapUrn(urn) => write!(f, "no handler for capability: {urn}"),
            NoHandler::UnknownRequestId => write!(f, "unknown request id"),
        }
    }
}

impl std::error::Error for NoHandler {}

/// Raised by `Manifest::validate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestError {
    MissingIdentity,
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::MissingIdentity => {
                write!(f, "manifest does not declare the CAP_IDENTITY capability")
            }
        }
    }
}

impl std::error::Error for ManifestError {}

/// The union of everything `RelaySwitch::sendToMaster` can fail with.
#[derive(Debug)]
pub enum SendError {
    Protocol(ProtocolError),
    NoHandler(NoHandler),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Protocol(e) => write!(f, "{e}"),
            SendError::NoHandler(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<ProtocolError> for SendError {
    fn from(e: ProtocolError) -> Self {
        SendError::Protocol(e)
    }
}

impl From<NoHandler> for SendError {
    fn from(e: NoHandler) -> Self {
        SendError::NoHandler(e)
    }
}

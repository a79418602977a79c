//! Capability-routed relay core.
//!
//! A [`RelaySwitch`] demultiplexes requests across a set of master peers by
//! matching a request's [`CapUrn`] against each master's advertised
//! capabilities, routing continuations by sticky per-request affinity. A
//! [`RelaySlave`] sits on the other side of a master socket, pumping frames
//! between it and a local runtime while intercepting the manifest/resource
//! control frames.
//!
//! Wire encoding, plugin process management, and CLI argument parsing for
//! any particular deployment are outside this crate's scope; see
//! [`crate::framing`] for the one encoding this crate does own (the
//! length-delimited frame stream a master or slave socket speaks).

pub mod cap_urn;
pub mod error;
pub mod frame;
pub mod framing;
pub mod limits;
pub mod manifest;
pub mod master;
pub mod message_id;
pub mod slave;
pub mod switch;

pub use cap_urn::CapUrn;
pub use error::{CapUrnError, ManifestError, NoHandler, ProtocolError, SendError};
pub use frame::Frame;
pub use framing::{FrameReader, FrameWriter};
pub use limits::Limits;
pub use manifest::Manifest;
pub use master::RelayMaster;
pub use message_id::MessageId;
pub use slave::RelaySlave;
pub use switch::RelaySwitch;

//! The tagged frame variant and its checksum helper.

use serde::{Deserialize, Serialize};

use crate::limits::Limits;
use crate::message_id::MessageId;

/// A single relay protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Req {
        id: MessageId,
        cap_urn: String,
        payload: Vec<u8>,
        content_type: String,
    },
    Chunk {
        req_id: MessageId,
        stream_id: String,
        seq: u64,
        chunk_index: u64,
        checksum: u32,
        payload: Vec<u8>,
    },
    End {
        id: MessageId,
        final_payload: Option<Vec<u8>>,
    },
    RelayNotify {
        manifest: Vec<u8>,
        limits: Limits,
    },
    RelayState {
        resources: Vec<u8>,
    },
}

impl Frame {
    /// The request id this frame is routed by, where applicable.
    ///
    /// `REQ.id`, `CHUNK.req_id`, and `END.id` all carry a request affinity;
    /// `RELAY_NOTIFY`/`RELAY_STATE` carry none.
    pub fn request_id(&self) -> Option<&MessageId> {
        match self {
            Frame::Req { id, .. } => Some(id),
            Frame::Chunk { req_id, .. } => Some(req_id),
            Frame::End { id, .. } => Some(id),
            Frame::RelayNotify { .. } | Frame::RelayState { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Frame::Req { payload, .. } => Some(payload),
            Frame::Chunk { payload, .. } => Some(payload),
            Frame::End { final_payload, .. } => final_payload.as_deref(),
            Frame::RelayNotify { .. } | Frame::RelayState { .. } => None,
        }
    }

    pub fn manifest(&self) -> Option<&[u8]> {
        match self {
            Frame::RelayNotify { manifest, .. } => Some(manifest),
            _ => None,
        }
    }

    pub fn limits(&self) -> Option<&Limits> {
        match self {
            Frame::RelayNotify { limits, .. } => Some(limits),
            _ => None,
        }
    }

    pub fn is_relay_notify(&self) -> bool {
        matches!(self, Frame::RelayNotify { .. })
    }

    pub fn is_relay_state(&self) -> bool {
        matches!(self, Frame::RelayState { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Req { .. } => "REQ",
            Frame::Chunk { .. } => "CHUNK",
            Frame::End { .. } => "END",
            Frame::RelayNotify { .. } => "RELAY_NOTIFY",
            Frame::RelayState { .. } => "RELAY_STATE",
        }
    }

    /// A pure function of payload bytes. CHUNK carries it; the switch never
    /// validates it (consumers do).
    pub fn compute_checksum(payload: &[u8]) -> u32 {
        crc32fast::hash(payload)
    }
}

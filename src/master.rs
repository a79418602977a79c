//! Per-master state: a master's socket halves, its current manifest and
//! limits, and the `read_frame` that absorbs inline RELAY_NOTIFY updates.
//!
//! Any code path that reads from a master socket funnels through
//! [`RelayMaster::read_frame`] (or, once [`RelayMaster::split`] hands the
//! reader half to a dedicated task, [`MasterReader::read_frame`], which
//! shares the same intercept logic). The raw reader is never exposed
//! outside this module, which is the key invariant the manifest intercept
//! relies on (see DESIGN.md).

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::cap_urn::CapUrn;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::framing::{FrameReader, FrameWriter};
use crate::limits::Limits;
use crate::manifest::Manifest;

/// A master's current manifest, negotiated limits, and derived capability
/// list — shared (via `Arc<parking_lot::Mutex<_>>`, the same shape
/// `rapace-testkit`'s `Session` uses for its per-channel state) between
/// whatever owns the socket reader and anything that needs to read the
/// master's current state without owning the socket itself.
pub struct MasterState {
    manifest: Manifest,
    limits: Limits,
    parsed_caps: Vec<CapUrn>,
}

impl MasterState {
    fn from_notify(manifest: Vec<u8>, limits: Limits) -> Self {
        let manifest = Manifest::from_bytes(manifest);
        let parsed_caps = manifest.capabilities();
        MasterState { manifest, limits, parsed_caps }
    }

    pub fn manifest(&self) -> Manifest {
        self.manifest.clone()
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn capabilities(&self) -> Vec<CapUrn> {
        self.parsed_caps.clone()
    }
}

/// A connected master peer: its socket halves plus the shared manifest/
/// limits state, updated in place whenever a RELAY_NOTIFY arrives.
pub struct RelayMaster<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    state: Arc<SyncMutex<MasterState>>,
    /// Diagnostic label, defaulted to the master's construction index.
    label: String,
}

impl<R, W> RelayMaster<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Blocks reading exactly one frame off `reader`; it must be
    /// RELAY_NOTIFY or construction fails.
    pub async fn connect(reader: R, writer: W, label: impl Into<String>) -> Result<Self, ProtocolError> {
        let label = label.into();
        let mut frame_reader = FrameReader::new(reader);
        let frame_writer = FrameWriter::new(writer);

        let first = frame_reader
            .read_frame(&Limits::UNBOUNDED)
            .await?
            .ok_or_else(|| ProtocolError::msg("master closed before sending RELAY_NOTIFY"))?;

        let (manifest, limits) = match first {
            Frame::RelayNotify { manifest, limits } => (manifest, limits),
            other => {
                return Err(ProtocolError::msg(format!(
                    "expected RELAY_NOTIFY as first frame, got {}",
                    other.kind_name()
                )))
            }
        };

        let state = MasterState::from_notify(manifest, limits);
        debug!(caps = state.capabilities().len(), "master connected");

        Ok(RelayMaster {
            reader: frame_reader,
            writer: frame_writer,
            state: Arc::new(SyncMutex::new(state)),
            label,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn manifest(&self) -> Manifest {
        self.state.lock().manifest()
    }

    pub fn limits(&self) -> Limits {
        self.state.lock().limits()
    }

    pub fn capabilities(&self) -> Vec<CapUrn> {
        self.state.lock().capabilities()
    }

    /// Reads a frame, transparently replacing this master's manifest and
    /// limits on any RELAY_NOTIFY and reading onward. RELAY_STATE is *not*
    /// intercepted here — it is returned to the caller, typically the
    /// slave-side pump.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        read_frame_intercepting_notify(&mut self.reader, &self.state).await
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        self.writer.write_frame(frame).await
    }

    /// Splits the connection into an owned reader half (meant to live in a
    /// dedicated per-master task), a shared async-writer handle, and the
    /// state the two sides read/update in common. This is the
    /// cancellation-safe shape `RelaySwitch` multiplexes over: one
    /// long-lived reader task per master feeding a channel, rather than
    /// re-racing `read_frame` futures on every poll (see DESIGN.md).
    pub fn split(self) -> (MasterReader<R>, Arc<AsyncMutex<FrameWriter<W>>>, Arc<SyncMutex<MasterState>>, String) {
        (
            MasterReader { reader: self.reader, state: self.state.clone() },
            Arc::new(AsyncMutex::new(self.writer)),
            self.state,
            self.label,
        )
    }
}

/// The reader half of a split [`RelayMaster`]: owns the socket's read side
/// and the shared state it updates on RELAY_NOTIFY. Meant to be driven in a
/// loop by a single task — `read_frame` itself is not cancellation-safe
/// (see `FrameReader::read_frame`), so it must never be raced against
/// anything that might drop it mid-poll.
pub struct MasterReader<R> {
    reader: FrameReader<R>,
    state: Arc<SyncMutex<MasterState>>,
}

impl<R: AsyncRead + Unpin> MasterReader<R> {
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        read_frame_intercepting_notify(&mut self.reader, &self.state).await
    }
}

/// Shared intercept loop used by both [`RelayMaster::read_frame`] and
/// [`MasterReader::read_frame`]: reads frames off `reader` until one that
/// isn't RELAY_NOTIFY arrives, absorbing each RELAY_NOTIFY into `state`.
async fn read_frame_intercepting_notify<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    state: &Arc<SyncMutex<MasterState>>,
) -> Result<Option<Frame>, ProtocolError> {
    loop {
        let limits = state.lock().limits();
        let frame = match reader.read_frame(&limits).await? {
            Some(f) => f,
            None => return Ok(None),
        };

        if let Frame::RelayNotify { manifest, limits } = frame {
            let new_state = MasterState::from_notify(manifest, limits);
            debug!(caps = new_state.capabilities().len(), "master manifest updated");
            *state.lock() = new_state;
            continue;
        }

        return Ok(Some(frame));
    }
}

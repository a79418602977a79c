//! The slave-side bidirectional pump: adapts a local runtime to the relay
//! protocol, announcing a manifest to its master and passing everything
//! else through transparently.

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::framing::{FrameReader, FrameWriter};
use crate::limits::Limits;

/// Handle to a running slave pump. Dropping this does not stop the pump;
/// call [`RelaySlave::shutdown`] or await [`RelaySlave::join`].
pub struct RelaySlave<SW> {
    socket_writer: Arc<AsyncMutex<FrameWriter<SW>>>,
    last_resources: Arc<SyncMutex<Option<Vec<u8>>>>,
    socket_to_local: JoinHandle<Result<(), ProtocolError>>,
    local_to_socket: JoinHandle<Result<(), ProtocolError>>,
}

impl<SW> RelaySlave<SW>
where
    SW: AsyncWrite + Unpin + Send + 'static,
{
    /// Spawns the two pump tasks and emits the initial RELAY_NOTIFY on the
    /// socket before returning.
    pub async fn spawn<SR, LR, LW>(
        socket_reader: SR,
        socket_writer: SW,
        local_reader: LR,
        local_writer: LW,
        initial_manifest: Vec<u8>,
        initial_limits: Limits,
    ) -> Result<RelaySlave<SW>, ProtocolError>
    where
        SR: AsyncRead + Unpin + Send + 'static,
        LR: AsyncRead + Unpin + Send + 'static,
        LW: AsyncWrite + Unpin + Send + 'static,
    {
        let socket_writer = Arc::new(AsyncMutex::new(FrameWriter::new(socket_writer)));
        let last_resources = Arc::new(SyncMutex::new(None));

        {
            let mut w = socket_writer.lock().await;
            w.write_frame(&Frame::RelayNotify {
                manifest: initial_manifest,
                limits: initial_limits,
            })
            .await?;
        }

        let socket_to_local = tokio::spawn(pump_socket_to_local(
            socket_reader,
            local_writer,
            last_resources.clone(),
        ));
        let local_to_socket = tokio::spawn(pump_local_to_socket(
            local_reader,
            socket_writer.clone(),
        ));

        Ok(RelaySlave {
            socket_writer,
            last_resources,
            socket_to_local,
            local_to_socket,
        })
    }

    /// Emit an updated manifest at the next frame boundary (a manifest
    /// change). The slave is the sole authority for its outbound manifest.
    pub async fn send_notify(&self, manifest: Vec<u8>, limits: Limits) -> Result<(), ProtocolError> {
        let mut w = self.socket_writer.lock().await;
        w.write_frame(&Frame::RelayNotify { manifest, limits }).await
    }

    /// Emit a resource update at the next frame boundary.
    pub async fn send_state(&self, resources: Vec<u8>) -> Result<(), ProtocolError> {
        let mut w = self.socket_writer.lock().await;
        w.write_frame(&Frame::RelayState { resources }).await
    }

    /// The most recently received RELAY_STATE resources, if any arrived.
    pub fn last_resources(&self) -> Option<Vec<u8>> {
        self.last_resources.lock().clone()
    }

    /// Waits for both pump directions to terminate (end-of-stream on
    /// either side terminates the pump cleanly).
    pub async fn join(self) -> Result<(), ProtocolError> {
        let (a, b) = tokio::join!(self.socket_to_local, self.local_to_socket);
        a.expect("socket_to_local pump task panicked")?;
        b.expect("local_to_socket pump task panicked")?;
        Ok(())
    }
}

async fn pump_socket_to_local<SR, LW>(
    socket_reader: SR,
    local_writer: LW,
    last_resources: Arc<SyncMutex<Option<Vec<u8>>>>,
) -> Result<(), ProtocolError>
where
    SR: AsyncRead + Unpin,
    LW: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(socket_reader);
    let mut writer = FrameWriter::new(local_writer);
    let mut limits = Limits::UNBOUNDED;

    loop {
        let frame = match reader.read_frame(&limits).await? {
            Some(f) => f,
            None => {
                debug!("socket closed, ending socket->local pump");
                return Ok(());
            }
        };

        match frame {
            Frame::RelayState { resources } => {
                trace!(len = resources.len(), "intercepted RELAY_STATE");
                *last_resources.lock() = Some(resources);
            }
            Frame::RelayNotify { limits: new_limits, .. } => {
                // The engine side doesn't send RELAY_NOTIFY down to a
                // slave in the base protocol, but if it ever negotiates
                // limits downward we still track them for our own reads.
                limits = new_limits;
            }
            other => {
                writer.write_frame(&other).await?;
            }
        }
    }
}

async fn pump_local_to_socket<LR, SW>(
    local_reader: LR,
    socket_writer: Arc<AsyncMutex<FrameWriter<SW>>>,
) -> Result<(), ProtocolError>
where
    LR: AsyncRead + Unpin,
    SW: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(local_reader);

    loop {
        let frame = match reader.read_frame(&Limits::UNBOUNDED).await? {
            Some(f) => f,
            None => {
                debug!("local runtime closed, ending local->socket pump");
                return Ok(());
            }
        };

        if frame.is_relay_notify() {
            // The slave alone decides when to announce manifest changes.
            trace!("dropping RELAY_NOTIFY received from local runtime");
            continue;
        }

        let mut w = socket_writer.lock().await;
        w.write_frame(&frame).await?;
    }
}

//! One TCP connection serving one server-side secure channel.
//!
//! Three tasks per connection:
//!   reader — socket → bounded queue
//!   actor  — queue → `ChannelManager::on_bytes` (all crypto for the channel)
//!   writer — transport queue → socket
//!
//! The bounded queue keeps per-channel order while keeping crypto off the
//! socket task.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use uasc_channel::{ChannelError, ChannelHandle, ChannelManager, Transport};
use uasc_core::{MessageSecurityMode, MessageType, SecurityPolicy};

use crate::transport::SocketTransport;

/// Inbound reads buffered ahead of the actor.
const ACTOR_QUEUE_DEPTH: usize = 64;
const READ_BUFFER_SIZE: usize = 16 * 1024;

pub struct Connection {
    manager: Arc<ChannelManager>,
    transport: SocketTransport,
    policy: SecurityPolicy,
    mode: MessageSecurityMode,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: broadcast::Receiver<()>,
}

impl Connection {
    pub fn new(
        manager: Arc<ChannelManager>,
        transport: SocketTransport,
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            manager,
            transport,
            policy,
            mode,
            stream,
            peer,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let handle = self.manager.open_channel(self.policy.uri(), self.mode)?;
        let peer = self.peer;
        tracing::info!(%handle, %peer, "connection accepted");

        let (write_tx, write_rx) = mpsc::unbounded_channel::<Bytes>();
        self.transport.register(handle, write_tx);
        register_echo(&self.manager, handle)?;
        self.manager.on_error(handle, move |error: &ChannelError| {
            tracing::warn!(%handle, %peer, kind = ?error.kind(), %error, "channel error");
        })?;

        let (read_half, write_half) = self.stream.into_split();
        let (actor_tx, actor_rx) = mpsc::channel::<Bytes>(ACTOR_QUEUE_DEPTH);

        let writer = tokio::spawn(write_loop(write_half, write_rx));
        let actor = tokio::spawn(actor_loop(self.manager.clone(), handle, actor_rx));

        tokio::select! {
            _ = self.shutdown.recv() => {
                tracing::debug!(%handle, "shutting down connection");
                if let Err(error) = self.manager.close_channel(handle) {
                    tracing::debug!(%handle, %error, "channel already closed");
                }
            }
            result = read_loop(read_half, actor_tx) => {
                if let Err(error) = result {
                    tracing::debug!(%handle, %error, "socket read failed");
                }
            }
        }

        // Let the actor drain what was read, then drop the channel if the peer
        // did not close it.
        actor.await.ok();
        self.manager.on_transport_lost(handle);
        self.transport.close(handle);
        writer.await.ok();
        tracing::info!(%handle, %peer, "connection closed");
        Ok(())
    }
}

/// Echo every MSG body back under the same request id.
fn register_echo(manager: &Arc<ChannelManager>, handle: ChannelHandle) -> Result<(), ChannelError> {
    let weak: Weak<ChannelManager> = Arc::downgrade(manager);
    manager.on_message(handle, move |request_id, message_type, body| {
        let Some(manager) = weak.upgrade() else {
            return;
        };
        if message_type != MessageType::Message {
            return;
        }
        tracing::debug!(%handle, request_id, len = body.len(), "echoing message");
        if let Err(error) = manager.send_message(handle, MessageType::Message, request_id, &body) {
            tracing::warn!(%handle, request_id, %error, "echo failed");
        }
    })
}

async fn read_loop(mut read_half: OwnedReadHalf, actor_tx: mpsc::Sender<Bytes>) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if actor_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            // Actor gone: the channel was closed.
            return Ok(());
        }
    }
}

async fn actor_loop(manager: Arc<ChannelManager>, handle: ChannelHandle, mut actor_rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = actor_rx.recv().await {
        if manager.on_bytes(handle, &data).is_err() {
            tracing::debug!(%handle, "channel gone, discarding input");
            return;
        }
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut write_rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(chunk) = write_rx.recv().await {
        if let Err(error) = write_half.write_all(&chunk).await {
            tracing::debug!(%error, "socket write failed");
            break;
        }
    }
    write_half.shutdown().await.ok();
}

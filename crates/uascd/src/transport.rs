//! Socket transport — routes a channel's outbound chunks to its
//! connection's writer task.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use uasc_channel::{ChannelHandle, Transport};

/// Writer queues keyed by channel handle.
#[derive(Clone, Default)]
pub struct SocketTransport {
    writers: Arc<DashMap<ChannelHandle, mpsc::UnboundedSender<Bytes>>>,
}

impl SocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ChannelHandle, writer: mpsc::UnboundedSender<Bytes>) {
        self.writers.insert(handle, writer);
    }

    pub fn connection_count(&self) -> usize {
        self.writers.len()
    }
}

impl Transport for SocketTransport {
    fn send(&self, handle: ChannelHandle, chunk: Bytes) -> io::Result<()> {
        let writer = self
            .writers
            .get(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, format!("no connection for channel {handle}")))?;
        writer
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection writer has exited"))
    }

    /// Dropping the sender ends the writer task, which shuts the socket down.
    fn close(&self, handle: ChannelHandle) {
        self.writers.remove(&handle);
    }
}

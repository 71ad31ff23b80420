//! Channel manager — the handle-based API offered to the service layer.
//!
//! Channels live in a DashMap keyed by [`ChannelHandle`]. Each entry is a
//! mutex around one [`SecureChannel`], so chunks for one channel are handled
//! in order while different channels proceed in parallel. Callbacks run after
//! the channel's lock is released and may call back into the manager.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use uasc_core::certificate::CertificateProvider;
use uasc_core::clock::{Clock, SystemClock};
use uasc_core::policy::{MessageSecurityMode, SecurityPolicy};
use uasc_core::wire::MessageType;
use uasc_core::StatusCode;

use crate::channel::{ChannelEvent, ChannelLimits, ChannelOptions, ChannelState, Role, SecureChannel};
use crate::error::ChannelError;

/// Identifies a channel within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where chunks go.
///
/// `send` is called with the channel's lock held, so it must not call back
/// into the manager for the same channel. Queue the bytes and return.
pub trait Transport: Send + Sync {
    fn send(&self, handle: ChannelHandle, chunk: Bytes) -> io::Result<()>;

    /// The channel is gone; release the connection.
    fn close(&self, _handle: ChannelHandle) {}
}

pub type MessageCallback = Arc<dyn Fn(u32, MessageType, Bytes) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// Settings shared by every channel a manager creates.
#[derive(Clone)]
pub struct ManagerOptions {
    pub role: Role,
    pub limits: ChannelLimits,
    /// Lifetime clients ask for when opening.
    pub requested_lifetime: Duration,
    pub certificates: Option<Arc<dyn CertificateProvider>>,
    pub remote_certificate: Option<Bytes>,
    pub clock: Arc<dyn Clock>,
}

impl ManagerOptions {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            limits: ChannelLimits::default(),
            requested_lifetime: Duration::from_secs(3600),
            certificates: None,
            remote_certificate: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_limits(mut self, limits: ChannelLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_requested_lifetime(mut self, lifetime: Duration) -> Self {
        self.requested_lifetime = lifetime;
        self
    }

    pub fn with_certificates(mut self, certificates: Arc<dyn CertificateProvider>) -> Self {
        self.certificates = Some(certificates);
        self
    }

    pub fn with_remote_certificate(mut self, certificate: Bytes) -> Self {
        self.remote_certificate = Some(certificate);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn channel_options(&self, policy: SecurityPolicy, mode: MessageSecurityMode) -> ChannelOptions {
        let mut options = ChannelOptions::new(self.role, policy, mode)
            .with_limits(self.limits)
            .with_clock(self.clock.clone());
        if let Some(certificates) = &self.certificates {
            options = options.with_certificates(certificates.clone());
        }
        if let Some(certificate) = &self.remote_certificate {
            options = options.with_remote_certificate(certificate.clone());
        }
        options
    }
}

struct ChannelSlot {
    channel: SecureChannel,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
}

type SlotRef = Arc<Mutex<ChannelSlot>>;

fn lock(slot: &SlotRef) -> MutexGuard<'_, ChannelSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work left to do once the channel's lock is released.
#[derive(Default)]
struct Deferred {
    messages: Vec<(u32, MessageType, Bytes)>,
    errors: Vec<ChannelError>,
    closed: bool,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
}

pub struct ChannelManager {
    options: ManagerOptions,
    transport: Arc<dyn Transport>,
    channels: DashMap<ChannelHandle, SlotRef>,
    next_handle: AtomicU64,
    next_channel_id: AtomicU32,
}

impl ChannelManager {
    pub fn new(options: ManagerOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            options,
            transport,
            channels: DashMap::new(),
            next_handle: AtomicU64::new(1),
            next_channel_id: AtomicU32::new(1),
        }
    }

    pub fn role(&self) -> Role {
        self.options.role
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn state(&self, handle: ChannelHandle) -> Option<ChannelState> {
        self.slot(handle).ok().map(|slot| lock(&slot).channel.state())
    }

    pub fn secure_channel_id(&self, handle: ChannelHandle) -> Option<u32> {
        self.slot(handle).ok().map(|slot| lock(&slot).channel.secure_channel_id())
    }

    /// A fresh request id for a message on this channel.
    pub fn next_request_id(&self, handle: ChannelHandle) -> Result<u32, ChannelError> {
        let slot = self.slot(handle)?;
        let id = lock(&slot).channel.next_request_id();
        Ok(id)
    }

    fn slot(&self, handle: ChannelHandle) -> Result<SlotRef, ChannelError> {
        self.channels
            .get(&handle)
            .map(|entry| entry.value().clone())
            .ok_or(ChannelError::Closed)
    }

    /// Create a channel. Clients send their OpenSecureChannel request
    /// immediately; servers wait for the peer's.
    pub fn open_channel(&self, policy_uri: &str, mode: MessageSecurityMode) -> Result<ChannelHandle, ChannelError> {
        let policy = SecurityPolicy::from_uri(policy_uri)
            .map_err(|e| ChannelError::encoding(StatusCode::BAD_SECURITY_POLICY_REJECTED, e.to_string()))?;
        let secure_channel_id = match self.options.role {
            Role::Server => self.allocate_channel_id(),
            Role::Client => 0,
        };
        let mut channel = SecureChannel::new(self.options.channel_options(policy, mode), secure_channel_id)?;
        let handle = ChannelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let opening = match self.options.role {
            Role::Client => {
                let lifetime_ms = u32::try_from(self.options.requested_lifetime.as_millis()).unwrap_or(u32::MAX);
                channel.open(lifetime_ms)?
            }
            Role::Server => Vec::new(),
        };
        self.transmit(handle, &mut channel, opening)?;

        tracing::debug!(%handle, role = ?self.options.role, %policy, %mode, "channel created");
        self.channels.insert(
            handle,
            Arc::new(Mutex::new(ChannelSlot {
                channel,
                on_message: None,
                on_error: None,
            })),
        );
        Ok(handle)
    }

    fn allocate_channel_id(&self) -> u32 {
        loop {
            let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Chunk, secure and transmit one message.
    pub fn send_message(
        &self,
        handle: ChannelHandle,
        message_type: MessageType,
        request_id: u32,
        body: &[u8],
    ) -> Result<(), ChannelError> {
        let slot = self.slot(handle)?;
        let result = {
            let mut guard = lock(&slot);
            let channel = &mut guard.channel;
            channel
                .send(message_type, request_id, body)
                .and_then(|chunks| self.transmit(handle, channel, chunks))
                .map(|()| channel.state())
        };
        match result {
            Ok(ChannelState::Closed) => {
                self.remove(handle);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(error) => {
                if error.is_fatal() || error == ChannelError::Closed {
                    self.fault(handle, &slot);
                }
                Err(error)
            }
        }
    }

    /// Tell the peer to discard a message it has partly received.
    pub fn abort_message(
        &self,
        handle: ChannelHandle,
        request_id: u32,
        status: StatusCode,
        reason: &str,
    ) -> Result<(), ChannelError> {
        let slot = self.slot(handle)?;
        let result = {
            let mut guard = lock(&slot);
            let channel = &mut guard.channel;
            channel
                .abort_message(request_id, status, reason)
                .and_then(|chunks| self.transmit(handle, channel, chunks))
        };
        if let Err(error) = &result {
            if error.is_fatal() || *error == ChannelError::Closed {
                self.fault(handle, &slot);
            }
        }
        result
    }

    /// Register the callback for reassembled messages.
    pub fn on_message(
        &self,
        handle: ChannelHandle,
        callback: impl Fn(u32, MessageType, Bytes) + Send + Sync + 'static,
    ) -> Result<(), ChannelError> {
        let slot = self.slot(handle)?;
        lock(&slot).on_message = Some(Arc::new(callback));
        Ok(())
    }

    /// Register the callback for message failures and channel faults.
    pub fn on_error(
        &self,
        handle: ChannelHandle,
        callback: impl Fn(&ChannelError) + Send + Sync + 'static,
    ) -> Result<(), ChannelError> {
        let slot = self.slot(handle)?;
        lock(&slot).on_error = Some(Arc::new(callback));
        Ok(())
    }

    /// Ask the server for a new token.
    pub fn renew_token(&self, handle: ChannelHandle, lifetime: Duration) -> Result<(), ChannelError> {
        let slot = self.slot(handle)?;
        let lifetime_ms = u32::try_from(lifetime.as_millis()).unwrap_or(u32::MAX);
        let result = {
            let mut guard = lock(&slot);
            let channel = &mut guard.channel;
            channel
                .renew(lifetime_ms)
                .and_then(|chunks| self.transmit(handle, channel, chunks))
        };
        if let Err(error) = &result {
            if error.is_fatal() || *error == ChannelError::Closed {
                self.fault(handle, &slot);
            }
        }
        result
    }

    /// Renew every client channel past 75% of its token lifetime.
    /// Returns how many renewals were sent.
    pub fn renew_due_tokens(&self) -> usize {
        let due: Vec<ChannelHandle> = self
            .channels
            .iter()
            .filter(|entry| lock(entry.value()).channel.should_renew())
            .map(|entry| *entry.key())
            .collect();
        let lifetime = self.options.requested_lifetime;
        due.into_iter()
            .filter(|&handle| match self.renew_token(handle, lifetime) {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(%handle, %error, "token renewal failed");
                    false
                }
            })
            .count()
    }

    /// Send CloseSecureChannel and forget the channel.
    pub fn close_channel(&self, handle: ChannelHandle) -> Result<(), ChannelError> {
        let (_, slot) = self.channels.remove(&handle).ok_or(ChannelError::Closed)?;
        let result = {
            let mut guard = lock(&slot);
            let channel = &mut guard.channel;
            let result = channel
                .close()
                .and_then(|chunks| self.transmit(handle, channel, chunks));
            channel.invalidate();
            result
        };
        self.transport.close(handle);
        result
    }

    /// The connection under a channel is gone.
    pub fn on_transport_lost(&self, handle: ChannelHandle) {
        if let Some((_, slot)) = self.channels.remove(&handle) {
            lock(&slot).channel.invalidate();
            tracing::info!(%handle, "transport lost, channel closed");
        }
    }

    /// Bytes received from the transport.
    pub fn on_bytes(&self, handle: ChannelHandle, data: &[u8]) -> Result<(), ChannelError> {
        let slot = self.slot(handle)?;
        let deferred = {
            let mut guard = lock(&slot);
            let outcome = guard.channel.feed(data);
            let mut deferred = Deferred {
                on_message: guard.on_message.clone(),
                on_error: guard.on_error.clone(),
                ..Deferred::default()
            };
            if let Err(error) = self.transmit(handle, &mut guard.channel, outcome.outbound) {
                deferred.errors.push(error);
                deferred.closed = true;
            }
            for event in outcome.events {
                match event {
                    ChannelEvent::Message {
                        request_id,
                        message_type,
                        body,
                    } => deferred.messages.push((request_id, message_type, body)),
                    ChannelEvent::MessageFailed { error, .. } => deferred.errors.push(error),
                    ChannelEvent::Faulted(error) => {
                        deferred.errors.push(error);
                        deferred.closed = true;
                    }
                    ChannelEvent::Closed => deferred.closed = true,
                    ChannelEvent::Opened { .. } | ChannelEvent::Renewed { .. } => {}
                }
            }
            deferred
        };

        if deferred.closed {
            self.remove(handle);
        }
        if let Some(callback) = &deferred.on_message {
            for (request_id, message_type, body) in deferred.messages {
                callback(request_id, message_type, body);
            }
        } else if !deferred.messages.is_empty() {
            tracing::debug!(%handle, dropped = deferred.messages.len(), "no message callback registered");
        }
        if let Some(callback) = &deferred.on_error {
            for error in &deferred.errors {
                callback(error);
            }
        }
        Ok(())
    }

    /// Hand chunks to the transport. A transport failure closes the channel.
    fn transmit(
        &self,
        handle: ChannelHandle,
        channel: &mut SecureChannel,
        chunks: Vec<Bytes>,
    ) -> Result<(), ChannelError> {
        for chunk in chunks {
            if let Err(error) = self.transport.send(handle, chunk) {
                tracing::warn!(%handle, %error, "transport send failed");
                channel.invalidate();
                return Err(ChannelError::Closed);
            }
        }
        Ok(())
    }

    fn fault(&self, handle: ChannelHandle, slot: &SlotRef) {
        lock(slot).channel.invalidate();
        self.remove(handle);
    }

    fn remove(&self, handle: ChannelHandle) {
        if self.channels.remove(&handle).is_some() {
            tracing::debug!(%handle, "channel removed");
            self.transport.close(handle);
        }
    }
}

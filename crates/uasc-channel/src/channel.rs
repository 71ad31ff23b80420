//! Secure channel state machine.
//!
//! ```text
//! Negotiating ──OPN Issue──▶ Open ──OPN Renew──▶ Renewing ──response──▶ Open
//!      │                      │                     │
//!      └──────────────────────┴─────CLO / fault─────┴──────────▶ Closed
//! ```
//!
//! A [`SecureChannel`] owns everything stream-positional for one channel:
//! the tokens and their keys, both sequence counters, and the reader's
//! partial messages. It performs no I/O. Bytes go in through
//! [`SecureChannel::feed`] and chunks to transmit come out of every call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use uasc_core::certificate::CertificateProvider;
use uasc_core::clock::{Clock, SystemClock};
use uasc_core::config::{LimitsConfig, DEFAULT_MAX_PENDING_MESSAGES};
use uasc_core::crypto::{generate_nonce, SessionKeys};
use uasc_core::policy::{MessageSecurityMode, SecurityPolicy};
use uasc_core::sequence::SequenceNumberGenerator;
use uasc_core::token::{revise_lifetime, ChannelSecurityToken};
use uasc_core::wire::{
    self, AsymmetricSecurityHeader, ChunkHeader, MessageType, OpenSecureChannelRequest,
    OpenSecureChannelResponse, RequestType, SecurityHeader, SymmetricSecurityHeader,
    DEFAULT_CHUNK_SIZE, PROTOCOL_VERSION,
};
use uasc_core::StatusCode;

use crate::chunk::reader::{ChunkReader, IncomingMessage, ReaderEvent, ReaderLimits, SecurityResolver};
use crate::chunk::writer::{ChunkWriter, WriterLimits};
use crate::chunk::ChunkSecurity;
use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Negotiating,
    Open,
    Renewing,
    Closed,
}

/// Buffer and message limits. The same limits bound what we send and
/// what we accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    /// 0 = unlimited.
    pub max_message_size: usize,
    /// 0 = unlimited.
    pub max_chunk_count: usize,
    /// Messages the peer may have in progress at once. 0 = unlimited.
    pub max_pending_messages: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            send_buffer_size: DEFAULT_CHUNK_SIZE,
            receive_buffer_size: DEFAULT_CHUNK_SIZE,
            max_message_size: 0,
            max_chunk_count: 0,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES as usize,
        }
    }
}

impl From<&LimitsConfig> for ChannelLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            send_buffer_size: config.send_buffer_size as usize,
            receive_buffer_size: config.receive_buffer_size as usize,
            max_message_size: config.max_message_size as usize,
            max_chunk_count: config.max_chunk_count as usize,
            max_pending_messages: config.max_pending_messages as usize,
        }
    }
}

/// Everything needed to create a channel.
#[derive(Clone)]
pub struct ChannelOptions {
    pub role: Role,
    pub policy: SecurityPolicy,
    pub mode: MessageSecurityMode,
    pub limits: ChannelLimits,
    /// Required for every policy other than None.
    pub certificates: Option<Arc<dyn CertificateProvider>>,
    /// The server's certificate, required by clients for every policy other
    /// than None. Servers learn the client's from its first OPN chunk.
    pub remote_certificate: Option<Bytes>,
    pub clock: Arc<dyn Clock>,
}

impl ChannelOptions {
    pub fn new(role: Role, policy: SecurityPolicy, mode: MessageSecurityMode) -> Self {
        Self {
            role,
            policy,
            mode,
            limits: ChannelLimits::default(),
            certificates: None,
            remote_certificate: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_limits(mut self, limits: ChannelLimits) -> Self {
        self.limits = limits;
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
}

/// Something that happened while processing inbound bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened {
        secure_channel_id: u32,
        token_id: u32,
        revised_lifetime: Duration,
    },
    Renewed {
        token_id: u32,
        revised_lifetime: Duration,
    },
    Message {
        request_id: u32,
        message_type: MessageType,
        body: Bytes,
    },
    /// One message failed; the channel stays open.
    MessageFailed { request_id: u32, error: ChannelError },
    /// The peer closed the channel.
    Closed,
    /// A fatal error closed the channel.
    Faulted(ChannelError),
}

/// Result of [`SecureChannel::feed`].
#[derive(Debug, Default)]
pub struct FeedOutcome {
    pub events: Vec<ChannelEvent>,
    /// Chunks to transmit, in order.
    pub outbound: Vec<Bytes>,
}

// ── Tokens ────────────────────────────────────────────────────────────────────

struct TokenKeys {
    token: ChannelSecurityToken,
    /// Keys we send with. None under policy None.
    local: Option<SessionKeys>,
    /// Keys the peer sends with.
    remote: Option<SessionKeys>,
}

/// Tokens, certificates and policy. Consulted by the reader for every chunk.
struct ChannelSecurity {
    policy: SecurityPolicy,
    mode: MessageSecurityMode,
    secure_channel_id: u32,
    current: Option<TokenKeys>,
    previous: Option<TokenKeys>,
    certificates: Option<Arc<dyn CertificateProvider>>,
    remote_certificate: Option<Bytes>,
    clock: Arc<dyn Clock>,
}

impl ChannelSecurity {
    fn symmetric<'a>(&self, keys: Option<&'a SessionKeys>) -> ChunkSecurity<'a> {
        match keys {
            Some(keys) if !self.policy.is_none() => ChunkSecurity::Symmetric {
                policy: self.policy,
                mode: self.mode,
                keys,
            },
            _ => ChunkSecurity::None,
        }
    }

    /// Token for an inbound chunk: the current one or, until it expires, the previous one.
    fn inbound_token(&self, token_id: u32) -> Result<&TokenKeys, ChannelError> {
        let now = self.clock.now();
        for keys in [self.current.as_ref(), self.previous.as_ref()].into_iter().flatten() {
            if keys.token.token_id != token_id {
                continue;
            }
            if keys.token.is_expired(now) {
                return Err(ChannelError::token(
                    StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
                    format!("token {token_id} has expired"),
                ));
            }
            return Ok(keys);
        }
        Err(ChannelError::token(
            StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
            format!("token {token_id} is not known on this channel"),
        ))
    }

    fn resolve_asymmetric<'a>(
        &'a self,
        header: &'a AsymmetricSecurityHeader,
    ) -> Result<ChunkSecurity<'a>, ChannelError> {
        let policy = SecurityPolicy::from_uri(&header.security_policy_uri)?;
        if policy != self.policy {
            return Err(ChannelError::Security {
                status: StatusCode::BAD_SECURITY_POLICY_REJECTED,
            });
        }
        if policy.is_none() {
            return Ok(ChunkSecurity::None);
        }
        let certificates = self.certificates.as_deref().ok_or(ChannelError::Security {
            status: StatusCode::BAD_NO_VALID_CERTIFICATES,
        })?;
        let sender = header
            .sender_certificate
            .as_deref()
            .ok_or(ChannelError::Security {
                status: StatusCode::BAD_CERTIFICATE_INVALID,
            })?;
        if header.receiver_thumbprint.as_deref() != Some(&certificates.own_thumbprint()[..]) {
            return Err(ChannelError::Security {
                status: StatusCode::BAD_NO_VALID_CERTIFICATES,
            });
        }
        if let Some(expected) = &self.remote_certificate {
            if expected.as_ref() != sender {
                return Err(ChannelError::Security {
                    status: StatusCode::BAD_CERTIFICATE_INVALID,
                });
            }
        }
        Ok(ChunkSecurity::Asymmetric {
            policy,
            certificates,
            remote_certificate: sender,
        })
    }

    /// Header and protection for an outbound OPN chunk.
    fn outbound_asymmetric(&self) -> Result<(SecurityHeader, ChunkSecurity<'_>), ChannelError> {
        if self.policy.is_none() {
            let header = AsymmetricSecurityHeader::none(self.policy.uri());
            return Ok((SecurityHeader::Asymmetric(header), ChunkSecurity::None));
        }
        let (Some(certificates), Some(remote)) =
            (self.certificates.as_deref(), self.remote_certificate.as_deref())
        else {
            return Err(ChannelError::encoding(
                StatusCode::BAD_CERTIFICATE_INVALID,
                "peer certificate is not known",
            ));
        };
        let header = AsymmetricSecurityHeader {
            security_policy_uri: self.policy.uri().to_string(),
            sender_certificate: Some(certificates.own_certificate()),
            receiver_thumbprint: Some(certificates.thumbprint(remote)),
        };
        Ok((
            SecurityHeader::Asymmetric(header),
            ChunkSecurity::Asymmetric {
                policy: self.policy,
                certificates,
                remote_certificate: remote,
            },
        ))
    }

    /// Header and protection for an outbound MSG or CLO chunk: always the newest token.
    fn outbound_symmetric(&self) -> Result<(SecurityHeader, ChunkSecurity<'_>), ChannelError> {
        let current = self.current.as_ref().ok_or_else(|| {
            ChannelError::token(StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN, "no token issued yet")
        })?;
        if current.token.is_expired(self.clock.now()) {
            return Err(ChannelError::token(
                StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
                format!("token {} has expired", current.token.token_id),
            ));
        }
        let header = SecurityHeader::Symmetric(SymmetricSecurityHeader::new(current.token.token_id));
        Ok((header, self.symmetric(current.local.as_ref())))
    }

    fn clear(&mut self) {
        self.current = None;
        self.previous = None;
    }
}

impl SecurityResolver for ChannelSecurity {
    fn resolve_inbound<'a>(
        &'a self,
        header: &ChunkHeader,
        _message_type: MessageType,
        security_header: &'a SecurityHeader,
    ) -> Result<ChunkSecurity<'a>, ChannelError> {
        let channel_id = header.secure_channel_id();
        match security_header {
            SecurityHeader::Asymmetric(asymmetric) => {
                // The first OPN of a channel carries id 0; the client learns its id from the response.
                if channel_id != 0 && self.secure_channel_id != 0 && channel_id != self.secure_channel_id {
                    return Err(channel_id_invalid(channel_id));
                }
                self.resolve_asymmetric(asymmetric)
            }
            SecurityHeader::Symmetric(symmetric) => {
                if channel_id != self.secure_channel_id {
                    return Err(channel_id_invalid(channel_id));
                }
                let keys = self.inbound_token(symmetric.token_id())?;
                Ok(self.symmetric(keys.remote.as_ref()))
            }
        }
    }
}

fn channel_id_invalid(channel_id: u32) -> ChannelError {
    ChannelError::token(
        StatusCode::BAD_SECURE_CHANNEL_ID_INVALID,
        format!("chunk for secure channel {channel_id}"),
    )
}

// ── Channel ───────────────────────────────────────────────────────────────────

pub struct SecureChannel {
    role: Role,
    state: ChannelState,
    security: ChannelSecurity,
    writer: ChunkWriter,
    reader: ChunkReader,
    send_sequence: SequenceNumberGenerator,
    /// Our nonce from the latest OPN exchange.
    local_nonce: Bytes,
    /// Outstanding OPN request (client only).
    pending_open: Option<(u32, RequestType)>,
    next_token_id: u32,
    next_request_id: u32,
}

impl SecureChannel {
    /// Create a channel. Servers pass the id they assign; clients pass 0.
    pub fn new(options: ChannelOptions, secure_channel_id: u32) -> Result<Self, ChannelError> {
        options.policy.check_mode(options.mode).map_err(|e| {
            ChannelError::encoding(StatusCode::BAD_SECURITY_POLICY_REJECTED, e.to_string())
        })?;
        if !options.policy.is_none() {
            if options.certificates.is_none() {
                return Err(ChannelError::encoding(
                    StatusCode::BAD_NO_VALID_CERTIFICATES,
                    format!("policy {} needs a certificate provider", options.policy),
                ));
            }
            if options.role == Role::Client && options.remote_certificate.is_none() {
                return Err(ChannelError::encoding(
                    StatusCode::BAD_CERTIFICATE_INVALID,
                    format!("policy {} needs the server certificate", options.policy),
                ));
            }
        }

        let limits = options.limits;
        Ok(Self {
            role: options.role,
            state: ChannelState::Negotiating,
            security: ChannelSecurity {
                policy: options.policy,
                mode: options.mode,
                secure_channel_id,
                current: None,
                previous: None,
                certificates: options.certificates,
                remote_certificate: options.remote_certificate,
                clock: options.clock,
            },
            writer: ChunkWriter::new(WriterLimits {
                chunk_size: limits.send_buffer_size,
                max_message_size: limits.max_message_size,
                max_chunk_count: limits.max_chunk_count,
            }),
            reader: ChunkReader::new(ReaderLimits {
                max_chunk_size: limits.receive_buffer_size,
                max_message_size: limits.max_message_size,
                max_chunk_count: limits.max_chunk_count,
                max_pending_messages: limits.max_pending_messages,
            }),
            send_sequence: SequenceNumberGenerator::new(),
            local_nonce: Bytes::new(),
            pending_open: None,
            next_token_id: 1,
            next_request_id: 1,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Open | ChannelState::Renewing)
    }

    pub fn secure_channel_id(&self) -> u32 {
        self.security.secure_channel_id
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.security.policy
    }

    pub fn mode(&self) -> MessageSecurityMode {
        self.security.mode
    }

    /// The newest token, if one has been issued.
    pub fn current_token(&self) -> Option<&ChannelSecurityToken> {
        self.security.current.as_ref().map(|k| &k.token)
    }

    /// A request id not used by this channel before. Wraps, skipping 0.
    pub fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    /// Whether a client should renew its token now.
    pub fn should_renew(&self) -> bool {
        self.role == Role::Client
            && self.state == ChannelState::Open
            && self
                .current_token()
                .is_some_and(|t| t.should_renew(self.security.clock.now()))
    }

    /// Body bytes per MSG chunk under the current token.
    pub fn max_body_size(&self) -> Result<usize, ChannelError> {
        let (header, security) = self.security.outbound_symmetric()?;
        self.writer.max_body_size(&header, &security)
    }

    // ── Client operations ─────────────────────────────────────────────────────

    /// Start the handshake. Returns the OPN request chunks.
    pub fn open(&mut self, requested_lifetime_ms: u32) -> Result<Vec<Bytes>, ChannelError> {
        self.require_client()?;
        if self.state != ChannelState::Negotiating || self.pending_open.is_some() {
            return Err(ChannelError::encoding(
                StatusCode::BAD_UNEXPECTED_ERROR,
                format!("cannot open a channel in state {:?}", self.state),
            ));
        }
        self.send_open_request(RequestType::Issue, requested_lifetime_ms)
    }

    /// Ask for a new token. Returns the OPN request chunks.
    pub fn renew(&mut self, requested_lifetime_ms: u32) -> Result<Vec<Bytes>, ChannelError> {
        self.require_client()?;
        match self.state {
            ChannelState::Open => {}
            ChannelState::Closed => return Err(ChannelError::Closed),
            state => {
                return Err(ChannelError::encoding(
                    StatusCode::BAD_UNEXPECTED_ERROR,
                    format!("cannot renew a channel in state {state:?}"),
                ))
            }
        }
        let chunks = self.send_open_request(RequestType::Renew, requested_lifetime_ms)?;
        self.state = ChannelState::Renewing;
        tracing::debug!(channel_id = self.secure_channel_id(), "token renewal requested");
        Ok(chunks)
    }

    fn require_client(&self) -> Result<(), ChannelError> {
        if self.role != Role::Client {
            return Err(ChannelError::encoding(
                StatusCode::BAD_UNEXPECTED_ERROR,
                "only clients open or renew channels",
            ));
        }
        Ok(())
    }

    fn send_open_request(
        &mut self,
        request_type: RequestType,
        requested_lifetime_ms: u32,
    ) -> Result<Vec<Bytes>, ChannelError> {
        let nonce = Bytes::from(generate_nonce(self.security.policy.nonce_length()));
        let request = OpenSecureChannelRequest {
            protocol_version: PROTOCOL_VERSION,
            request_type,
            security_mode: self.security.mode,
            client_nonce: nonce.clone(),
            requested_lifetime: requested_lifetime_ms,
        };
        let request_id = self.next_request_id();
        let chunks = self.write_message(MessageType::OpenSecureChannel, request_id, &request.encode())?;
        self.local_nonce = nonce;
        self.pending_open = Some((request_id, request_type));
        Ok(chunks)
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Chunk and secure a message. OPN is driven by [`open`](Self::open) and
    /// [`renew`](Self::renew); sending CLO closes the channel.
    pub fn send(
        &mut self,
        message_type: MessageType,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<Bytes>, ChannelError> {
        if self.state == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        match message_type {
            MessageType::OpenSecureChannel => Err(ChannelError::encoding(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                "OpenSecureChannel messages are produced by open and renew",
            )),
            MessageType::CloseSecureChannel => {
                let result = self.write_message(message_type, request_id, body);
                self.invalidate();
                result
            }
            MessageType::Message => {
                if !self.is_open() {
                    return Err(ChannelError::encoding(
                        StatusCode::BAD_UNEXPECTED_ERROR,
                        "channel is not open yet",
                    ));
                }
                self.write_message(message_type, request_id, body)
            }
        }
    }

    pub fn send_message(&mut self, request_id: u32, body: &[u8]) -> Result<Vec<Bytes>, ChannelError> {
        self.send(MessageType::Message, request_id, body)
    }

    /// Tell the peer to drop a message it has partly received from us.
    pub fn abort_message(
        &mut self,
        request_id: u32,
        status: StatusCode,
        reason: &str,
    ) -> Result<Vec<Bytes>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let (header, security) = self.security.outbound_symmetric()?;
        let written = self.writer.abort(
            MessageType::Message,
            request_id,
            self.security.secure_channel_id,
            header,
            &security,
            self.send_sequence,
            status,
            reason,
        )?;
        self.send_sequence = written.sequence;
        Ok(written.chunks)
    }

    /// Send CLO if the channel is open, then close it. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<Vec<Bytes>, ChannelError> {
        if !self.is_open() {
            self.invalidate();
            return Ok(Vec::new());
        }
        let request_id = self.next_request_id();
        tracing::info!(channel_id = self.secure_channel_id(), "closing secure channel");
        self.send(MessageType::CloseSecureChannel, request_id, &[])
    }

    /// Drop tokens, keys and partial messages. Used on close and on transport loss.
    pub fn invalidate(&mut self) {
        if self.state != ChannelState::Closed {
            tracing::debug!(channel_id = self.secure_channel_id(), "secure channel invalidated");
        }
        self.state = ChannelState::Closed;
        self.security.clear();
        self.reader.reset();
        self.pending_open = None;
        self.local_nonce = Bytes::new();
    }

    fn write_message(
        &mut self,
        message_type: MessageType,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<Bytes>, ChannelError> {
        let (header, security) = if message_type.is_open_secure_channel() {
            self.security.outbound_asymmetric()?
        } else {
            self.security.outbound_symmetric()?
        };
        let mut message = self.writer.begin(
            message_type,
            request_id,
            self.security.secure_channel_id,
            header,
            &security,
            self.send_sequence,
        )?;
        self.writer.write(&mut message, body, &security)?;
        let written = self.writer.end(message, &security)?;
        self.send_sequence = written.sequence;
        Ok(written.chunks)
    }

    // ── Receiving ─────────────────────────────────────────────────────────────

    /// Process transport bytes. Fragments may split or join chunks arbitrarily.
    pub fn feed(&mut self, data: &[u8]) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();
        if self.state == ChannelState::Closed {
            return outcome;
        }
        // One event at a time: an OPN response installs the token the next chunk may use.
        self.reader.push(data);
        while self.state != ChannelState::Closed {
            let Some(event) = self.reader.poll(&self.security) else {
                break;
            };
            match event {
                ReaderEvent::Message(message) => {
                    if let Err(error) = self.dispatch(message, &mut outcome) {
                        self.fault(error, &mut outcome);
                    }
                }
                ReaderEvent::Failed(error) if error.is_fatal() => self.fault(error, &mut outcome),
                ReaderEvent::Failed(error) => {
                    tracing::warn!(
                        channel_id = self.secure_channel_id(),
                        request_id = error.request_id(),
                        %error,
                        "message failed"
                    );
                    outcome.events.push(ChannelEvent::MessageFailed {
                        request_id: error.request_id().unwrap_or_default(),
                        error,
                    });
                }
            }
        }
        outcome
    }

    fn fault(&mut self, error: ChannelError, outcome: &mut FeedOutcome) {
        tracing::warn!(channel_id = self.secure_channel_id(), %error, "secure channel faulted");
        self.invalidate();
        outcome.events.push(ChannelEvent::Faulted(error));
    }

    fn dispatch(&mut self, message: IncomingMessage, outcome: &mut FeedOutcome) -> Result<(), ChannelError> {
        match message.message_type {
            MessageType::OpenSecureChannel => match self.role {
                Role::Server => self.handle_open_request(message, outcome),
                Role::Client => self.handle_open_response(message, outcome),
            },
            MessageType::Message => {
                outcome.events.push(ChannelEvent::Message {
                    request_id: message.request_id,
                    message_type: message.message_type,
                    body: message.body,
                });
                Ok(())
            }
            MessageType::CloseSecureChannel => {
                tracing::info!(channel_id = self.secure_channel_id(), "secure channel closed by peer");
                self.invalidate();
                outcome.events.push(ChannelEvent::Closed);
                Ok(())
            }
        }
    }

    fn handle_open_request(
        &mut self,
        message: IncomingMessage,
        outcome: &mut FeedOutcome,
    ) -> Result<(), ChannelError> {
        let request = OpenSecureChannelRequest::decode(&message.body)?;
        match (request.request_type, self.state) {
            (RequestType::Issue, ChannelState::Negotiating)
            | (RequestType::Renew, ChannelState::Open | ChannelState::Renewing) => {}
            (request_type, state) => {
                return Err(ChannelError::framing(
                    StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN,
                    format!("{request_type:?} request on a channel in state {state:?}"),
                ))
            }
        }
        if request.security_mode != self.security.mode {
            return Err(ChannelError::Security {
                status: StatusCode::BAD_SECURITY_POLICY_REJECTED,
            });
        }
        let nonce_length = self.security.policy.nonce_length();
        if request.client_nonce.len() != nonce_length {
            return Err(ChannelError::Security {
                status: StatusCode::BAD_NONCE_INVALID,
            });
        }
        if self.security.remote_certificate.is_none() {
            self.security.remote_certificate = message
                .asymmetric_header
                .as_ref()
                .and_then(|h| h.sender_certificate.clone());
            if let (Some(certificates), Some(certificate)) =
                (self.security.certificates.as_deref(), self.security.remote_certificate.as_deref())
            {
                tracing::debug!(
                    channel_id = self.security.secure_channel_id,
                    thumbprint = hex::encode(certificates.thumbprint(certificate)),
                    "client certificate accepted"
                );
            }
        }

        let now = self.security.clock.now();
        let revised_lifetime = revise_lifetime(request.requested_lifetime);
        let token_id = self.next_token_id;
        self.next_token_id = self.next_token_id.wrapping_add(1).max(1);
        let server_nonce = Bytes::from(generate_nonce(nonce_length));
        let (local, remote) = self.derive_keys(&server_nonce, &request.client_nonce)?;

        let response = OpenSecureChannelResponse {
            protocol_version: PROTOCOL_VERSION,
            secure_channel_id: self.security.secure_channel_id,
            token_id,
            created_at: wire::to_ticks(now),
            revised_lifetime: revised_lifetime.as_millis() as u32,
            server_nonce: server_nonce.clone(),
        };
        let chunks = self.write_message(
            MessageType::OpenSecureChannel,
            message.request_id,
            &response.encode(),
        )?;
        outcome.outbound.extend(chunks);

        let token = ChannelSecurityToken::new(self.security.secure_channel_id, token_id, now, revised_lifetime);
        self.install(token, local, remote);
        self.local_nonce = server_nonce;
        self.state = ChannelState::Open;
        outcome.events.push(self.token_event(request.request_type, token_id, revised_lifetime));
        Ok(())
    }

    fn handle_open_response(
        &mut self,
        message: IncomingMessage,
        outcome: &mut FeedOutcome,
    ) -> Result<(), ChannelError> {
        let response = OpenSecureChannelResponse::decode(&message.body)?;
        let (request_id, request_type) = self.pending_open.take().ok_or_else(|| {
            ChannelError::framing(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                "OpenSecureChannel response without a request",
            )
        })?;
        if message.request_id != request_id {
            return Err(ChannelError::framing(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!(
                    "OpenSecureChannel response for request {}, expected {request_id}",
                    message.request_id
                ),
            ));
        }
        if response.server_nonce.len() != self.security.policy.nonce_length() {
            return Err(ChannelError::Security {
                status: StatusCode::BAD_NONCE_INVALID,
            });
        }
        match request_type {
            RequestType::Issue if response.secure_channel_id != 0 => {
                self.security.secure_channel_id = response.secure_channel_id;
            }
            RequestType::Renew if response.secure_channel_id == self.security.secure_channel_id => {}
            _ => return Err(channel_id_invalid(response.secure_channel_id)),
        }

        let local_nonce = self.local_nonce.clone();
        let (local, remote) = self.derive_keys(&local_nonce, &response.server_nonce)?;
        let revised_lifetime = Duration::from_millis(u64::from(response.revised_lifetime));
        // Expiry runs on our clock; the server's timestamp only matters for logging.
        let token = ChannelSecurityToken::new(
            response.secure_channel_id,
            response.token_id,
            self.security.clock.now(),
            revised_lifetime,
        );
        tracing::debug!(
            channel_id = response.secure_channel_id,
            token_id = response.token_id,
            server_created_at = ?wire::from_ticks(response.created_at),
            "token received"
        );
        self.install(token, local, remote);
        self.state = ChannelState::Open;
        outcome
            .events
            .push(self.token_event(request_type, response.token_id, revised_lifetime));
        Ok(())
    }

    /// Keys a peer sends with come from (secret = the other side's nonce, seed = its own nonce).
    fn derive_keys(
        &self,
        local_nonce: &[u8],
        remote_nonce: &[u8],
    ) -> Result<(Option<SessionKeys>, Option<SessionKeys>), ChannelError> {
        let policy = self.security.policy;
        if policy.is_none() {
            return Ok((None, None));
        }
        let local = policy.derive_keys(remote_nonce, local_nonce)?;
        let remote = policy.derive_keys(local_nonce, remote_nonce)?;
        Ok((Some(local), Some(remote)))
    }

    /// Make `token` current. The old current token is kept for inbound chunks
    /// until it expires; anything older is dropped.
    fn install(&mut self, token: ChannelSecurityToken, local: Option<SessionKeys>, remote: Option<SessionKeys>) {
        let now = self.security.clock.now();
        tracing::debug!(
            channel_id = token.secure_channel_id,
            token_id = token.token_id,
            lifetime_ms = token.revised_lifetime.as_millis() as u64,
            "token installed"
        );
        let previous = self.security.current.take();
        self.security.previous = previous.filter(|p| !p.token.is_expired(now));
        self.security.current = Some(TokenKeys { token, local, remote });
    }

    fn token_event(&self, request_type: RequestType, token_id: u32, revised_lifetime: Duration) -> ChannelEvent {
        let channel_id = self.security.secure_channel_id;
        match request_type {
            RequestType::Issue => {
                tracing::info!(channel_id, token_id, policy = %self.security.policy, mode = %self.security.mode, "secure channel opened");
                ChannelEvent::Opened {
                    secure_channel_id: channel_id,
                    token_id,
                    revised_lifetime,
                }
            }
            RequestType::Renew => {
                tracing::info!(channel_id, token_id, "secure channel token renewed");
                ChannelEvent::Renewed {
                    token_id,
                    revised_lifetime,
                }
            }
        }
    }
}

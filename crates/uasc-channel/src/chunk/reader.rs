//! Chunk reader — buffer, verify, decrypt, reassemble.
//!
//! Bytes arrive in arbitrary fragments. The reader buffers until a whole
//! chunk is present, then for each chunk:
//!
//!   1. validates the header (known type, sane length)
//!   2. asks the [`SecurityResolver`] which keys or certificates apply
//!   3. decrypts, verifies the signature, checks the padding
//!   4. checks the sequence number
//!   5. appends the body to the message for its request id
//!
//! Any failure in steps 1–4 is fatal and stops the reader for good.

use std::collections::{HashMap, HashSet};

use bytes::{Bytes, BytesMut};
use zerocopy::FromBytes;

use uasc_core::sequence::SequenceNumberGenerator;
use uasc_core::wire::{
    AbortBody, AsymmetricSecurityHeader, ChunkHeader, ChunkType, MessageType, SecurityHeader,
    SequenceHeader, MESSAGE_HEADER_SIZE, SEQUENCE_HEADER_SIZE, SYMMETRIC_HEADER_SIZE,
};
use uasc_core::StatusCode;

use super::padding::strip_padding;
use super::ChunkSecurity;
use crate::error::ChannelError;

/// Smallest asymmetric header: three null strings.
const MIN_ASYMMETRIC_HEADER_SIZE: usize = 12;

/// Limits on what we accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderLimits {
    /// Largest chunk, header included.
    pub max_chunk_size: usize,
    /// Largest reassembled body. 0 = unlimited.
    pub max_message_size: usize,
    /// Most chunks per message. 0 = unlimited.
    pub max_chunk_count: usize,
    /// Most messages in progress at once, and most dropped messages still
    /// awaiting their last chunk. 0 = unlimited.
    pub max_pending_messages: usize,
}

/// Looks up the protection for an inbound chunk.
///
/// Implemented by the channel, which owns the tokens.
pub trait SecurityResolver {
    fn resolve_inbound<'a>(
        &'a self,
        header: &ChunkHeader,
        message_type: MessageType,
        security_header: &'a SecurityHeader,
    ) -> Result<ChunkSecurity<'a>, ChannelError>;
}

/// A reassembled, verified message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message_type: MessageType,
    pub request_id: u32,
    pub body: Bytes,
    /// Security header of the first chunk, for OpenSecureChannel messages.
    pub asymmetric_header: Option<AsymmetricSecurityHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Message(IncomingMessage),
    /// A message-level failure, or a fatal one after which the reader stops.
    Failed(ChannelError),
}

/// Chunks received so far for one request id.
#[derive(Debug)]
struct PendingMessage {
    message_type: MessageType,
    asymmetric_header: Option<AsymmetricSecurityHeader>,
    fragments: Vec<Bytes>,
    total_bytes: usize,
    chunk_count: usize,
}

#[derive(Debug)]
pub struct ChunkReader {
    limits: ReaderLimits,
    buffer: BytesMut,
    sequence: SequenceNumberGenerator,
    pending: HashMap<u32, PendingMessage>,
    /// Request ids dropped for exceeding a limit, ignored until their last chunk.
    poisoned: HashSet<u32>,
    failed: bool,
}

impl ChunkReader {
    pub fn new(limits: ReaderLimits) -> Self {
        Self {
            limits,
            buffer: BytesMut::new(),
            sequence: SequenceNumberGenerator::new(),
            pending: HashMap::new(),
            poisoned: HashSet::new(),
            failed: false,
        }
    }

    pub fn limits(&self) -> ReaderLimits {
        self.limits
    }

    /// Number of messages with chunks received but no Final chunk yet.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Bytes buffered that do not yet form a whole chunk.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Drop every partial message and buffered byte. The reader stays usable
    /// only if it has not failed.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending.clear();
        self.poisoned.clear();
    }

    /// Consume transport bytes and process every complete chunk.
    pub fn feed(&mut self, data: &[u8], resolver: &dyn SecurityResolver) -> Vec<ReaderEvent> {
        self.push(data);
        let mut events = Vec::new();
        while let Some(event) = self.poll(resolver) {
            events.push(event);
        }
        events
    }

    /// Buffer transport bytes without processing them.
    pub fn push(&mut self, data: &[u8]) {
        if !self.failed {
            self.buffer.extend_from_slice(data);
        }
    }

    /// Process buffered chunks until one produces an event.
    ///
    /// Callers whose security state changes with each message (a new token
    /// arriving in an OpenSecureChannel response) poll one event at a time.
    pub fn poll(&mut self, resolver: &dyn SecurityResolver) -> Option<ReaderEvent> {
        while !self.failed {
            let chunk = match self.next_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return None,
                Err(e) => return Some(self.fail(e)),
            };
            match self.process_chunk(chunk, resolver) {
                Ok(Some(event)) => return Some(event),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Some(self.fail(e)),
                Err(e) => return Some(ReaderEvent::Failed(e)),
            }
        }
        None
    }

    fn fail(&mut self, error: ChannelError) -> ReaderEvent {
        tracing::warn!(%error, "chunk rejected, reader stopped");
        self.reset();
        self.failed = true;
        ReaderEvent::Failed(error)
    }

    /// Split off the next whole chunk, validating its header first.
    fn next_chunk(&mut self) -> Result<Option<BytesMut>, ChannelError> {
        let Some(header) = ChunkHeader::parse(&self.buffer) else {
            return Ok(None);
        };
        let message_type = header.message_type()?;
        header.chunk_type()?;

        let size = header.message_size();
        let min_size = MESSAGE_HEADER_SIZE
            + SEQUENCE_HEADER_SIZE
            + if message_type.is_open_secure_channel() {
                MIN_ASYMMETRIC_HEADER_SIZE
            } else {
                SYMMETRIC_HEADER_SIZE
            };
        if size < min_size {
            return Err(ChannelError::framing(
                StatusCode::BAD_DECODING_ERROR,
                format!("chunk size {size} is below the minimum of {min_size}"),
            ));
        }
        if size > self.limits.max_chunk_size {
            return Err(ChannelError::framing(
                StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
                format!(
                    "chunk size {size} exceeds the limit of {}",
                    self.limits.max_chunk_size
                ),
            ));
        }
        if self.buffer.len() < size {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(size)))
    }

    fn process_chunk(
        &mut self,
        mut chunk: BytesMut,
        resolver: &dyn SecurityResolver,
    ) -> Result<Option<ReaderEvent>, ChannelError> {
        // Both parsed successfully in `next_chunk`.
        let header = ChunkHeader::parse(&chunk).ok_or_else(ChannelError::security)?;
        let message_type = header.message_type()?;
        let chunk_type = header.chunk_type()?;

        let mut cursor = &chunk[MESSAGE_HEADER_SIZE..];
        let security_header = SecurityHeader::decode(message_type, &mut cursor)?;
        let region_start = chunk.len() - cursor.len();

        let security = resolver.resolve_inbound(&header, message_type, &security_header)?;
        let (data, payload_end) = unprotect(&mut chunk, region_start, &security)?;

        let sequence_header = SequenceHeader::read_from_prefix(&data[region_start..])
            .ok_or_else(ChannelError::security)?;
        let sequence_number = sequence_header.sequence_number();
        let request_id = sequence_header.request_id();
        self.sequence.accept(sequence_number)?;

        tracing::trace!(
            ?message_type,
            ?chunk_type,
            request_id,
            sequence_number,
            size = header.message_size(),
            "chunk verified"
        );

        let payload = data.slice(region_start + SEQUENCE_HEADER_SIZE..payload_end);
        let asymmetric_header = match security_header {
            SecurityHeader::Asymmetric(h) => Some(h),
            SecurityHeader::Symmetric(_) => None,
        };
        self.accumulate(message_type, chunk_type, request_id, payload, asymmetric_header)
    }

    fn accumulate(
        &mut self,
        message_type: MessageType,
        chunk_type: ChunkType,
        request_id: u32,
        payload: Bytes,
        asymmetric_header: Option<AsymmetricSecurityHeader>,
    ) -> Result<Option<ReaderEvent>, ChannelError> {
        if chunk_type == ChunkType::Abort {
            self.pending.remove(&request_id);
            self.poisoned.remove(&request_id);
            let abort = AbortBody::decode(&payload).unwrap_or(AbortBody {
                status: StatusCode::BAD_DECODING_ERROR,
                reason: String::new(),
            });
            tracing::debug!(request_id, status = %abort.status, "message aborted by peer");
            return Err(ChannelError::AbortedByPeer {
                request_id,
                status: abort.status,
                reason: abort.reason,
            });
        }

        if self.poisoned.contains(&request_id) {
            if chunk_type == ChunkType::Final {
                self.poisoned.remove(&request_id);
            }
            return Ok(None);
        }

        let max_pending = self.limits.max_pending_messages;
        if chunk_type != ChunkType::Final
            && max_pending > 0
            && self.pending.len() >= max_pending
            && !self.pending.contains_key(&request_id)
        {
            self.poison(request_id)?;
            let reason = format!("more than {max_pending} messages in progress");
            tracing::warn!(request_id, %reason, "message dropped");
            return Err(ChannelError::QuotaExceeded {
                request_id,
                status: StatusCode::BAD_ENCODING_LIMITS_EXCEEDED,
                reason,
            });
        }

        let entry = self.pending.entry(request_id).or_insert_with(|| PendingMessage {
            message_type,
            asymmetric_header,
            fragments: Vec::new(),
            total_bytes: 0,
            chunk_count: 0,
        });
        if entry.message_type != message_type {
            return Err(ChannelError::framing(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!(
                    "request {request_id} mixes {:?} and {message_type:?} chunks",
                    entry.message_type
                ),
            ));
        }
        entry.chunk_count += 1;
        entry.total_bytes += payload.len();

        let limits = self.limits;
        let over_size = limits.max_message_size > 0 && entry.total_bytes > limits.max_message_size;
        let over_count = limits.max_chunk_count > 0 && entry.chunk_count > limits.max_chunk_count;
        if over_size || over_count {
            let reason = if over_size {
                format!(
                    "message exceeds the limit of {} bytes",
                    limits.max_message_size
                )
            } else {
                format!("message exceeds the limit of {} chunks", limits.max_chunk_count)
            };
            self.pending.remove(&request_id);
            if chunk_type != ChunkType::Final {
                self.poison(request_id)?;
            }
            tracing::warn!(request_id, %reason, "message dropped");
            return Err(ChannelError::QuotaExceeded {
                request_id,
                status: StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
                reason,
            });
        }

        entry.fragments.push(payload);
        if chunk_type != ChunkType::Final {
            return Ok(None);
        }

        let Some(done) = self.pending.remove(&request_id) else {
            return Ok(None);
        };
        let body = if done.fragments.len() == 1 {
            done.fragments.into_iter().next().unwrap_or_default()
        } else {
            let mut body = BytesMut::with_capacity(done.total_bytes);
            for fragment in &done.fragments {
                body.extend_from_slice(fragment);
            }
            body.freeze()
        };
        Ok(Some(ReaderEvent::Message(IncomingMessage {
            message_type,
            request_id,
            body,
            asymmetric_header: done.asymmetric_header,
        })))
    }

    /// Ignore the rest of a dropped message. Too many dropped messages in
    /// progress at once is fatal.
    fn poison(&mut self, request_id: u32) -> Result<(), ChannelError> {
        let max = self.limits.max_pending_messages;
        if max > 0 && self.poisoned.len() >= max {
            return Err(ChannelError::framing(
                StatusCode::BAD_ENCODING_LIMITS_EXCEEDED,
                format!("more than {max} dropped messages still in progress"),
            ));
        }
        self.poisoned.insert(request_id);
        Ok(())
    }
}

/// Decrypt and verify a chunk in place.
///
/// Returns the chunk with its encrypted region in plaintext and the end of
/// the body. Every failure is the same [`ChannelError::security`].
fn unprotect(
    chunk: &mut BytesMut,
    region_start: usize,
    security: &ChunkSecurity<'_>,
) -> Result<(Bytes, usize), ChannelError> {
    let framing = security.inbound()?;
    let floor = region_start + SEQUENCE_HEADER_SIZE;

    let data = match *security {
        ChunkSecurity::None => {
            let data = chunk.split().freeze();
            let end = data.len();
            return Ok((data, end));
        }
        ChunkSecurity::Symmetric { policy, mode, keys } => {
            if mode.is_encrypted() {
                let region = &mut chunk[region_start..];
                if region.len() % framing.cipher_block != 0 {
                    return Err(ChannelError::security());
                }
                policy
                    .symmetric_decrypt(keys, region)
                    .map_err(|_| ChannelError::security())?;
            }
            let signature_start = chunk
                .len()
                .checked_sub(framing.signature_size)
                .filter(|&s| s >= floor)
                .ok_or_else(ChannelError::security)?;
            let (signed, signature) = chunk.split_at(signature_start);
            policy
                .symmetric_verify(keys, signed, signature)
                .map_err(|_| ChannelError::security())?;
            chunk.split().freeze()
        }
        ChunkSecurity::Asymmetric {
            policy,
            certificates,
            remote_certificate,
        } => {
            let plaintext = certificates
                .decrypt(policy, &chunk[region_start..])
                .map_err(|_| ChannelError::security())?;
            chunk.truncate(region_start);
            chunk.extend_from_slice(&plaintext);
            let signature_start = chunk
                .len()
                .checked_sub(framing.signature_size)
                .filter(|&s| s >= floor)
                .ok_or_else(ChannelError::security)?;
            let (signed, signature) = chunk.split_at(signature_start);
            certificates
                .verify(policy, remote_certificate, signed, signature)
                .map_err(|_| ChannelError::security())?;
            chunk.split().freeze()
        }
    };

    let signature_start = data.len() - framing.signature_size;
    let end = if framing.encrypted {
        strip_padding(&data, floor, signature_start, framing.min_padding)
            .ok_or_else(ChannelError::security)?
    } else {
        signature_start
    };
    Ok((data, end))
}

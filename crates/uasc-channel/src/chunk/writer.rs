//! Chunk writer — split, pad, sign, encrypt.
//!
//! The writer holds no per-message state of its own. A message in progress
//! lives in an [`OutgoingMessage`] that carries a snapshot of the channel's
//! sequence generator; the advanced generator comes back from
//! [`ChunkWriter::end`] and the caller commits it only if the whole message
//! was produced.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::AsBytes;

use uasc_core::sequence::SequenceNumberGenerator;
use uasc_core::wire::{
    AbortBody, ChunkHeader, ChunkType, MessageType, SecurityHeader, SequenceHeader,
    MESSAGE_HEADER_SIZE, SEQUENCE_HEADER_SIZE,
};
use uasc_core::StatusCode;

use super::padding::{padding_size, write_padding};
use super::{ChunkSecurity, Framing};
use crate::error::ChannelError;

/// Limits on what we send; these are the peer's receive limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterLimits {
    /// Largest chunk, header included.
    pub chunk_size: usize,
    /// Largest message body. 0 = unlimited.
    pub max_message_size: usize,
    /// Most chunks per message. 0 = unlimited.
    pub max_chunk_count: usize,
}

/// A message being written.
#[derive(Debug)]
pub struct OutgoingMessage {
    message_type: MessageType,
    request_id: u32,
    secure_channel_id: u32,
    security_header: SecurityHeader,
    sequence: SequenceNumberGenerator,
    max_body: usize,
    pending: BytesMut,
    chunks: Vec<Bytes>,
    total_len: usize,
}

impl OutgoingMessage {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Body bytes accepted so far.
    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }
}

/// Chunks of a finished message and the sequence state to commit.
#[derive(Debug)]
pub struct WrittenMessage {
    pub chunks: Vec<Bytes>,
    pub sequence: SequenceNumberGenerator,
}

#[derive(Debug, Clone)]
pub struct ChunkWriter {
    limits: WriterLimits,
}

impl ChunkWriter {
    pub fn new(limits: WriterLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> WriterLimits {
        self.limits
    }

    /// Largest body that fits one chunk with this header and protection.
    pub fn max_body_size(
        &self,
        security_header: &SecurityHeader,
        security: &ChunkSecurity<'_>,
    ) -> Result<usize, ChannelError> {
        let framing = security.outbound()?;
        self.body_capacity(MESSAGE_HEADER_SIZE + security_header.encoded_len(), &framing)
    }

    fn body_capacity(&self, header_len: usize, framing: &Framing) -> Result<usize, ChannelError> {
        let available = self.limits.chunk_size.checked_sub(header_len);
        let capacity = available.and_then(|available| {
            let region = if framing.encrypted {
                available / framing.cipher_block * framing.plain_block
            } else {
                available
            };
            region.checked_sub(SEQUENCE_HEADER_SIZE + framing.signature_size + framing.min_padding)
        });
        match capacity {
            Some(n) if n > 0 => Ok(n),
            _ => Err(ChannelError::encoding(
                StatusCode::BAD_TCP_INTERNAL_ERROR,
                format!("chunk size {} leaves no room for a body", self.limits.chunk_size),
            )),
        }
    }

    pub fn begin(
        &self,
        message_type: MessageType,
        request_id: u32,
        secure_channel_id: u32,
        security_header: SecurityHeader,
        security: &ChunkSecurity<'_>,
        sequence: SequenceNumberGenerator,
    ) -> Result<OutgoingMessage, ChannelError> {
        let max_body = self.max_body_size(&security_header, security)?;
        Ok(OutgoingMessage {
            message_type,
            request_id,
            secure_channel_id,
            security_header,
            sequence,
            max_body,
            pending: BytesMut::new(),
            chunks: Vec::new(),
            total_len: 0,
        })
    }

    /// Append body bytes, emitting Intermediate chunks as the buffer fills.
    ///
    /// Fails with QuotaExceeded, and writes nothing, if the message would
    /// outgrow the limits.
    pub fn write(
        &self,
        message: &mut OutgoingMessage,
        data: &[u8],
        security: &ChunkSecurity<'_>,
    ) -> Result<(), ChannelError> {
        let total_len = message.total_len + data.len();
        self.check_limits(message, total_len)?;
        message.total_len = total_len;
        message.pending.extend_from_slice(data);

        // Strictly greater: the last full block is left for `end` to mark Final.
        while message.pending.len() > message.max_body {
            let body = message.pending.split_to(message.max_body);
            let chunk = self.secure_chunk(message, ChunkType::Intermediate, &body, security)?;
            message.chunks.push(chunk);
        }
        Ok(())
    }

    fn check_limits(&self, message: &OutgoingMessage, total_len: usize) -> Result<(), ChannelError> {
        let status = if message.message_type == MessageType::Message {
            StatusCode::BAD_REQUEST_TOO_LARGE
        } else {
            StatusCode::BAD_ENCODING_LIMITS_EXCEEDED
        };
        if self.limits.max_message_size > 0 && total_len > self.limits.max_message_size {
            return Err(ChannelError::QuotaExceeded {
                request_id: message.request_id,
                status,
                reason: format!(
                    "message of {total_len} bytes exceeds the limit of {}",
                    self.limits.max_message_size
                ),
            });
        }
        let chunk_count = total_len.div_ceil(message.max_body).max(1);
        if self.limits.max_chunk_count > 0 && chunk_count > self.limits.max_chunk_count {
            return Err(ChannelError::QuotaExceeded {
                request_id: message.request_id,
                status,
                reason: format!(
                    "message needs {chunk_count} chunks, the limit is {}",
                    self.limits.max_chunk_count
                ),
            });
        }
        Ok(())
    }

    /// Flush the remaining bytes as the Final chunk.
    pub fn end(
        &self,
        mut message: OutgoingMessage,
        security: &ChunkSecurity<'_>,
    ) -> Result<WrittenMessage, ChannelError> {
        let body = message.pending.split();
        let chunk = self.secure_chunk(&mut message, ChunkType::Final, &body, security)?;
        message.chunks.push(chunk);
        Ok(WrittenMessage {
            chunks: message.chunks,
            sequence: message.sequence,
        })
    }

    /// A single Abort chunk telling the peer to drop `request_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn abort(
        &self,
        message_type: MessageType,
        request_id: u32,
        secure_channel_id: u32,
        security_header: SecurityHeader,
        security: &ChunkSecurity<'_>,
        sequence: SequenceNumberGenerator,
        status: StatusCode,
        reason: &str,
    ) -> Result<WrittenMessage, ChannelError> {
        let mut message = self.begin(
            message_type,
            request_id,
            secure_channel_id,
            security_header,
            security,
            sequence,
        )?;
        let mut body = AbortBody {
            status,
            reason: reason.to_string(),
        }
        .encode();
        if body.len() > message.max_body {
            // Drop the reason rather than split an Abort across chunks.
            body = AbortBody {
                status,
                reason: String::new(),
            }
            .encode();
        }
        let chunk = self.secure_chunk(&mut message, ChunkType::Abort, &body, security)?;
        Ok(WrittenMessage {
            chunks: vec![chunk],
            sequence: message.sequence,
        })
    }

    /// Build one chunk: headers, body, padding, signature, then encryption.
    fn secure_chunk(
        &self,
        message: &mut OutgoingMessage,
        chunk_type: ChunkType,
        body: &[u8],
        security: &ChunkSecurity<'_>,
    ) -> Result<Bytes, ChannelError> {
        let framing = security.outbound()?;
        let header_len = MESSAGE_HEADER_SIZE + message.security_header.encoded_len();
        let padding = if framing.encrypted {
            padding_size(body.len(), framing.signature_size, framing.plain_block, framing.min_padding)
        } else {
            0
        };
        let plain_len = SEQUENCE_HEADER_SIZE + body.len() + padding + framing.signature_size;
        let encrypted_len = if framing.encrypted {
            plain_len / framing.plain_block * framing.cipher_block
        } else {
            plain_len
        };
        let message_size = header_len + encrypted_len;

        let sequence_number = message.sequence.next();
        let mut buf = BytesMut::with_capacity(header_len + plain_len.max(encrypted_len));
        buf.put_slice(
            ChunkHeader::new(
                message.message_type,
                chunk_type,
                message_size as u32,
                message.secure_channel_id,
            )
            .as_bytes(),
        );
        message.security_header.encode(&mut buf);
        buf.put_slice(SequenceHeader::new(sequence_number, message.request_id).as_bytes());
        buf.put_slice(body);
        if padding > 0 {
            write_padding(&mut buf, padding, framing.min_padding);
        }

        match *security {
            ChunkSecurity::None => {}
            ChunkSecurity::Symmetric { policy, mode, keys } => {
                let signed_len = buf.len();
                buf.resize(signed_len + framing.signature_size, 0);
                let (signed, signature) = buf.split_at_mut(signed_len);
                policy.symmetric_sign(keys, signed, signature)?;
                if mode.is_encrypted() {
                    policy.symmetric_encrypt(keys, &mut buf[header_len..])?;
                }
            }
            ChunkSecurity::Asymmetric {
                policy,
                certificates,
                remote_certificate,
            } => {
                let signature = certificates.sign(policy, &buf)?;
                if signature.len() != framing.signature_size {
                    return Err(ChannelError::encoding(
                        StatusCode::BAD_SECURITY_CHECKS_FAILED,
                        format!(
                            "signature is {} bytes, expected {}",
                            signature.len(),
                            framing.signature_size
                        ),
                    ));
                }
                buf.put_slice(&signature);
                let ciphertext = certificates.encrypt(policy, remote_certificate, &buf[header_len..])?;
                buf.truncate(header_len);
                buf.put_slice(&ciphertext);
            }
        }

        if buf.len() != message_size {
            return Err(ChannelError::encoding(
                StatusCode::BAD_TCP_INTERNAL_ERROR,
                format!("chunk is {} bytes, header says {message_size}", buf.len()),
            ));
        }

        tracing::trace!(
            message_type = ?message.message_type,
            ?chunk_type,
            request_id = message.request_id,
            sequence_number,
            message_size,
            "chunk secured"
        );
        Ok(buf.freeze())
    }
}

//! Secure conversation wire format — on-wire types for every chunk.
//!
//! These types ARE the protocol. Every field and every size is part of the
//! wire format and is little-endian on the wire.
//!
//! Fixed-size headers are zerocopy structs built from unaligned
//! little-endian integers, so they can be read straight out of a receive
//! buffer. Variable-length bodies (the asymmetric security header, abort
//! bodies, OpenSecureChannel bodies) are encoded with `bytes`.
//!
//! Chunk layout:
//!
//! ```text
//! ChunkHeader (12) | SecurityHeader (4 or variable) | SequenceHeader (8) | body | padding | signature
//!                                                   |<------------ encrypted region ------------->|
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::policy::MessageSecurityMode;
use crate::status::StatusCode;

type LeU32 = U32<LittleEndian>;

// ── Chunk Header ─────────────────────────────────────────────────────────────

/// The fixed header that starts every chunk.
///
/// `message_size` is the exact length of the chunk as transmitted, header
/// included. A reader uses it to find chunk boundaries in the byte stream.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkHeader {
    /// ASCII tag: `OPN`, `MSG` or `CLO`.
    pub message_type: [u8; 3],
    /// ASCII chunk role: `F`, `C` or `A`.
    pub chunk_type: u8,
    /// Total chunk length including this header.
    pub message_size: LeU32,
    /// Server-assigned channel id. 0 in the first OpenSecureChannel request.
    pub secure_channel_id: LeU32,
}

assert_eq_size!(ChunkHeader, [u8; 12]);

impl ChunkHeader {
    pub fn new(
        message_type: MessageType,
        chunk_type: ChunkType,
        message_size: u32,
        secure_channel_id: u32,
    ) -> Self {
        Self {
            message_type: message_type.tag(),
            chunk_type: chunk_type as u8,
            message_size: LeU32::new(message_size),
            secure_channel_id: LeU32::new(secure_channel_id),
        }
    }

    /// Read a header from the start of `buf`. None if fewer than 12 bytes.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Self::read_from_prefix(buf)
    }

    pub fn message_type(&self) -> Result<MessageType, WireError> {
        MessageType::try_from(self.message_type)
    }

    pub fn chunk_type(&self) -> Result<ChunkType, WireError> {
        ChunkType::try_from(self.chunk_type)
    }

    pub fn message_size(&self) -> usize {
        self.message_size.get() as usize
    }

    pub fn secure_channel_id(&self) -> u32 {
        self.secure_channel_id.get()
    }
}

// ── Message / Chunk Types ────────────────────────────────────────────────────

/// Secure conversation message type — the 3-byte ASCII tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `OPN` — open or renew a secure channel. Secured asymmetrically.
    OpenSecureChannel,
    /// `MSG` — an ordinary service request or response.
    Message,
    /// `CLO` — close the secure channel.
    CloseSecureChannel,
}

impl MessageType {
    pub fn tag(self) -> [u8; 3] {
        match self {
            MessageType::OpenSecureChannel => *b"OPN",
            MessageType::Message => *b"MSG",
            MessageType::CloseSecureChannel => *b"CLO",
        }
    }

    pub fn is_open_secure_channel(self) -> bool {
        self == MessageType::OpenSecureChannel
    }
}

impl TryFrom<[u8; 3]> for MessageType {
    type Error = WireError;

    fn try_from(tag: [u8; 3]) -> Result<Self, Self::Error> {
        match &tag {
            b"OPN" => Ok(MessageType::OpenSecureChannel),
            b"MSG" => Ok(MessageType::Message),
            b"CLO" => Ok(MessageType::CloseSecureChannel),
            _ => Err(WireError::UnknownMessageType(tag)),
        }
    }
}

/// Role of a chunk within its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Last chunk of a message.
    Final = b'F',
    /// More chunks follow.
    Intermediate = b'C',
    /// The sender gave up on this message; the body carries the reason.
    Abort = b'A',
}

impl TryFrom<u8> for ChunkType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'F' => Ok(ChunkType::Final),
            b'C' => Ok(ChunkType::Intermediate),
            b'A' => Ok(ChunkType::Abort),
            other => Err(WireError::UnknownChunkType(other)),
        }
    }
}

// ── Security Headers ─────────────────────────────────────────────────────────

/// Security header of every non-OPN chunk.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SymmetricSecurityHeader {
    /// Token whose keys secure this chunk.
    pub token_id: LeU32,
}

assert_eq_size!(SymmetricSecurityHeader, [u8; 4]);

impl SymmetricSecurityHeader {
    pub fn new(token_id: u32) -> Self {
        Self {
            token_id: LeU32::new(token_id),
        }
    }

    pub fn token_id(&self) -> u32 {
        self.token_id.get()
    }
}

/// Security header of OpenSecureChannel chunks.
///
/// Null certificates and thumbprints are encoded with length -1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsymmetricSecurityHeader {
    pub security_policy_uri: String,
    /// DER certificate of the sender. None under policy None.
    pub sender_certificate: Option<Bytes>,
    /// Thumbprint of the receiver's certificate. None under policy None.
    pub receiver_thumbprint: Option<Bytes>,
}

impl AsymmetricSecurityHeader {
    pub fn none(security_policy_uri: &str) -> Self {
        Self {
            security_policy_uri: security_policy_uri.to_string(),
            sender_certificate: None,
            receiver_thumbprint: None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.security_policy_uri.len()
            + 4
            + self.sender_certificate.as_ref().map_or(0, |c| c.len())
            + 4
            + self.receiver_thumbprint.as_ref().map_or(0, |t| t.len())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, Some(&self.security_policy_uri));
        write_byte_string(buf, self.sender_certificate.as_deref());
        write_byte_string(buf, self.receiver_thumbprint.as_deref());
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        let security_policy_uri = read_string(buf)?.unwrap_or_default();
        let sender_certificate = read_byte_string(buf)?;
        let receiver_thumbprint = read_byte_string(buf)?;
        Ok(Self {
            security_policy_uri,
            sender_certificate,
            receiver_thumbprint,
        })
    }
}

/// Either kind of security header, as found after the chunk header.
#[derive(Debug, Clone)]
pub enum SecurityHeader {
    Asymmetric(AsymmetricSecurityHeader),
    Symmetric(SymmetricSecurityHeader),
}

impl SecurityHeader {
    pub fn encoded_len(&self) -> usize {
        match self {
            SecurityHeader::Asymmetric(h) => h.encoded_len(),
            SecurityHeader::Symmetric(_) => SYMMETRIC_HEADER_SIZE,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            SecurityHeader::Asymmetric(h) => h.encode(buf),
            SecurityHeader::Symmetric(h) => buf.put_slice(h.as_bytes()),
        }
    }

    /// Decode the security header that follows a chunk header of `message_type`.
    pub fn decode(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        if message_type.is_open_secure_channel() {
            AsymmetricSecurityHeader::decode(buf).map(SecurityHeader::Asymmetric)
        } else {
            let header = SymmetricSecurityHeader::read_from_prefix(*buf).ok_or(WireError::Truncated {
                needed: SYMMETRIC_HEADER_SIZE,
                remaining: buf.len(),
            })?;
            buf.advance(SYMMETRIC_HEADER_SIZE);
            Ok(SecurityHeader::Symmetric(header))
        }
    }
}

// ── Sequence Header ──────────────────────────────────────────────────────────

/// Per-chunk sequence number and the request the chunk belongs to.
///
/// Wire size: 8 bytes. First bytes of the encrypted region.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SequenceHeader {
    pub sequence_number: LeU32,
    pub request_id: LeU32,
}

assert_eq_size!(SequenceHeader, [u8; 8]);

impl SequenceHeader {
    pub fn new(sequence_number: u32, request_id: u32) -> Self {
        Self {
            sequence_number: LeU32::new(sequence_number),
            request_id: LeU32::new(request_id),
        }
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number.get()
    }

    pub fn request_id(&self) -> u32 {
        self.request_id.get()
    }
}

// ── Abort Body ───────────────────────────────────────────────────────────────

/// Body of an Abort chunk: why the sender gave up on the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortBody {
    pub status: StatusCode,
    pub reason: String,
}

impl AbortBody {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.reason.len());
        buf.put_u32_le(self.status.0);
        write_string(&mut buf, Some(&self.reason));
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(&buf, 4)?;
        let status = StatusCode(buf.get_u32_le());
        let reason = read_string(&mut buf)?.unwrap_or_default();
        Ok(Self { status, reason })
    }
}

// ── OpenSecureChannel Bodies ─────────────────────────────────────────────────

/// Whether an OpenSecureChannel request creates a channel or renews its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestType {
    Issue = 0,
    Renew = 1,
}

impl TryFrom<u32> for RequestType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RequestType::Issue),
            1 => Ok(RequestType::Renew),
            other => Err(WireError::UnknownRequestType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSecureChannelRequest {
    pub protocol_version: u32,
    pub request_type: RequestType,
    pub security_mode: MessageSecurityMode,
    /// Empty under policy None.
    pub client_nonce: Bytes,
    /// Requested token lifetime in milliseconds.
    pub requested_lifetime: u32,
}

impl OpenSecureChannelRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20 + self.client_nonce.len());
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.request_type as u32);
        buf.put_u32_le(self.security_mode as u32);
        write_byte_string(&mut buf, non_empty(&self.client_nonce));
        buf.put_u32_le(self.requested_lifetime);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(&buf, 12)?;
        let protocol_version = buf.get_u32_le();
        let request_type = RequestType::try_from(buf.get_u32_le())?;
        let mode = buf.get_u32_le();
        let security_mode =
            MessageSecurityMode::try_from(mode).map_err(|_| WireError::UnknownSecurityMode(mode))?;
        let client_nonce = read_byte_string(&mut buf)?.unwrap_or_default();
        need(&buf, 4)?;
        let requested_lifetime = buf.get_u32_le();
        Ok(Self {
            protocol_version,
            request_type,
            security_mode,
            client_nonce,
            requested_lifetime,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSecureChannelResponse {
    pub protocol_version: u32,
    pub secure_channel_id: u32,
    pub token_id: u32,
    /// Token creation time on the server, OPC UA DateTime ticks.
    pub created_at: i64,
    /// Revised token lifetime in milliseconds.
    pub revised_lifetime: u32,
    /// Empty under policy None.
    pub server_nonce: Bytes,
}

impl OpenSecureChannelResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(28 + self.server_nonce.len());
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.secure_channel_id);
        buf.put_u32_le(self.token_id);
        buf.put_i64_le(self.created_at);
        buf.put_u32_le(self.revised_lifetime);
        write_byte_string(&mut buf, non_empty(&self.server_nonce));
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(&buf, 24)?;
        let protocol_version = buf.get_u32_le();
        let secure_channel_id = buf.get_u32_le();
        let token_id = buf.get_u32_le();
        let created_at = buf.get_i64_le();
        let revised_lifetime = buf.get_u32_le();
        let server_nonce = read_byte_string(&mut buf)?.unwrap_or_default();
        Ok(Self {
            protocol_version,
            secure_channel_id,
            token_id,
            created_at,
            revised_lifetime,
            server_nonce,
        })
    }
}

// ── DateTime ─────────────────────────────────────────────────────────────────

/// Seconds between 1601-01-01 (OPC UA epoch) and 1970-01-01.
const EPOCH_OFFSET_SECS: u64 = 11_644_473_600;
const TICKS_PER_SEC: u64 = 10_000_000;

/// Convert a system time to OPC UA DateTime (100 ns ticks since 1601).
pub fn to_ticks(time: SystemTime) -> i64 {
    let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let ticks = (since_unix.as_secs() + EPOCH_OFFSET_SECS) * TICKS_PER_SEC
        + u64::from(since_unix.subsec_nanos()) / 100;
    ticks as i64
}

/// Convert OPC UA DateTime ticks back to a system time. Pre-1970 clamps to the Unix epoch.
pub fn from_ticks(ticks: i64) -> SystemTime {
    let ticks = ticks.max(0) as u64;
    let secs = (ticks / TICKS_PER_SEC).saturating_sub(EPOCH_OFFSET_SECS);
    let nanos = (ticks % TICKS_PER_SEC) * 100;
    UNIX_EPOCH + Duration::new(secs, nanos as u32)
}

// ── String Encoding ──────────────────────────────────────────────────────────

fn non_empty(bytes: &Bytes) -> Option<&[u8]> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

fn need(buf: &&[u8], n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated {
            needed: n,
            remaining: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// Write a ByteString: i32 length (-1 = null) followed by the bytes.
pub fn write_byte_string(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(v) => {
            buf.put_i32_le(v.len() as i32);
            buf.put_slice(v);
        }
        None => buf.put_i32_le(-1),
    }
}

pub fn read_byte_string(buf: &mut &[u8]) -> Result<Option<Bytes>, WireError> {
    need(buf, 4)?;
    let len = buf.get_i32_le();
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(WireError::InvalidLength(len));
    }
    let len = len as usize;
    need(buf, len)?;
    Ok(Some(buf.copy_to_bytes(len)))
}

pub fn write_string(buf: &mut BytesMut, value: Option<&str>) {
    write_byte_string(buf, value.map(str::as_bytes));
}

pub fn read_string(buf: &mut &[u8]) -> Result<Option<String>, WireError> {
    match read_byte_string(buf)? {
        Some(bytes) => String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| WireError::InvalidUtf8),
        None => Ok(None),
    }
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Size of [`ChunkHeader`].
pub const MESSAGE_HEADER_SIZE: usize = 12;

/// Size of [`SymmetricSecurityHeader`].
pub const SYMMETRIC_HEADER_SIZE: usize = 4;

/// Size of [`SequenceHeader`].
pub const SEQUENCE_HEADER_SIZE: usize = 8;

/// Smallest send/receive buffer a peer may negotiate.
pub const MIN_CHUNK_SIZE: usize = 8192;

/// Default send/receive buffer size.
pub const DEFAULT_CHUNK_SIZE: usize = 65535;

/// Secure conversation protocol version carried in OpenSecureChannel bodies.
pub const PROTOCOL_VERSION: u32 = 0;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type tag {:?}", String::from_utf8_lossy(.0))]
    UnknownMessageType([u8; 3]),

    #[error("unknown chunk type byte: 0x{0:02x}")]
    UnknownChunkType(u8),

    #[error("truncated data: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid length prefix {0}")]
    InvalidLength(i32),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown OpenSecureChannel request type {0}")]
    UnknownRequestType(u32),

    #[error("unknown message security mode {0}")]
    UnknownSecurityMode(u32),
}

// ── Tests ────────────────────────────────────────────────────────────────────

//! Channel errors.
//!
//! Framing, security, token and sequence errors are fatal: the channel is
//! closed and all of its state discarded. Quota and peer-abort errors fail a
//! single message and leave the channel open.

use thiserror::Error;

use uasc_core::crypto::CryptoError;
use uasc_core::policy::PolicyError;
use uasc_core::sequence::SequenceError;
use uasc_core::wire::WireError;
use uasc_core::StatusCode;

/// Coarse classification of a [`ChannelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Framing,
    Security,
    Token,
    Sequence,
    QuotaExceeded,
    AbortedByPeer,
    Closed,
    Encoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("framing error: {reason} ({status})")]
    Framing { status: StatusCode, reason: String },

    /// Signature, padding and decryption failures all look the same from
    /// outside.
    #[error("security checks failed ({status})")]
    Security { status: StatusCode },

    #[error("token error: {reason} ({status})")]
    Token { status: StatusCode, reason: String },

    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("request {request_id}: {reason} ({status})")]
    QuotaExceeded {
        request_id: u32,
        status: StatusCode,
        reason: String,
    },

    #[error("request {request_id} aborted by peer: {reason} ({status})")]
    AbortedByPeer {
        request_id: u32,
        status: StatusCode,
        reason: String,
    },

    #[error("secure channel is closed")]
    Closed,

    #[error("cannot send: {reason} ({status})")]
    Encoding { status: StatusCode, reason: String },
}

impl ChannelError {
    pub fn framing(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::Framing {
            status,
            reason: reason.into(),
        }
    }

    pub fn security() -> Self {
        Self::Security {
            status: StatusCode::BAD_SECURITY_CHECKS_FAILED,
        }
    }

    pub fn token(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::Token {
            status,
            reason: reason.into(),
        }
    }

    pub fn encoding(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::Encoding {
            status,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Framing { .. } => ErrorKind::Framing,
            Self::Security { .. } => ErrorKind::Security,
            Self::Token { .. } => ErrorKind::Token,
            Self::Sequence(_) => ErrorKind::Sequence,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::AbortedByPeer { .. } => ErrorKind::AbortedByPeer,
            Self::Closed => ErrorKind::Closed,
            Self::Encoding { .. } => ErrorKind::Encoding,
        }
    }

    /// Status code to report to the peer or the service layer.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Framing { status, .. }
            | Self::Security { status }
            | Self::Token { status, .. }
            | Self::QuotaExceeded { status, .. }
            | Self::AbortedByPeer { status, .. }
            | Self::Encoding { status, .. } => *status,
            Self::Sequence(_) => StatusCode::BAD_SEQUENCE_NUMBER_INVALID,
            Self::Closed => StatusCode::BAD_SECURE_CHANNEL_CLOSED,
        }
    }

    /// Whether the channel must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Framing | ErrorKind::Security | ErrorKind::Token | ErrorKind::Sequence
        )
    }

    /// The request a message-level error belongs to.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            Self::QuotaExceeded { request_id, .. } | Self::AbortedByPeer { request_id, .. } => {
                Some(*request_id)
            }
            _ => None,
        }
    }
}

impl From<WireError> for ChannelError {
    fn from(err: WireError) -> Self {
        let status = match err {
            WireError::UnknownMessageType(_) | WireError::UnknownChunkType(_) => {
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID
            }
            _ => StatusCode::BAD_DECODING_ERROR,
        };
        Self::framing(status, err.to_string())
    }
}

/// An inbound chunk named a policy or mode we do not use.
impl From<PolicyError> for ChannelError {
    fn from(_: PolicyError) -> Self {
        Self::Security {
            status: StatusCode::BAD_SECURITY_POLICY_REJECTED,
        }
    }
}

/// Local crypto failures while producing chunks. Never used for inbound
/// checks, which collapse to [`ChannelError::security`].
impl From<CryptoError> for ChannelError {
    fn from(err: CryptoError) -> Self {
        Self::encoding(StatusCode::BAD_SECURITY_CHECKS_FAILED, err.to_string())
    }
}

//! OPC UA status codes used by the secure conversation layer.
//!
//! Only the codes this layer can produce or receive are named. Any other
//! value received in an Abort body is carried through as-is.

use std::fmt;

/// A 32-bit OPC UA status code. The top two bits carry severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: Self = Self(0x0000_0000);
    pub const BAD_UNEXPECTED_ERROR: Self = Self(0x8001_0000);
    pub const BAD_INTERNAL_ERROR: Self = Self(0x8002_0000);
    pub const BAD_COMMUNICATION_ERROR: Self = Self(0x8005_0000);
    pub const BAD_DECODING_ERROR: Self = Self(0x8007_0000);
    pub const BAD_ENCODING_LIMITS_EXCEEDED: Self = Self(0x8008_0000);
    pub const BAD_CERTIFICATE_INVALID: Self = Self(0x8012_0000);
    pub const BAD_SECURITY_CHECKS_FAILED: Self = Self(0x8013_0000);
    pub const BAD_SECURE_CHANNEL_ID_INVALID: Self = Self(0x8022_0000);
    pub const BAD_NONCE_INVALID: Self = Self(0x8024_0000);
    pub const BAD_SECURITY_POLICY_REJECTED: Self = Self(0x8055_0000);
    pub const BAD_NO_VALID_CERTIFICATES: Self = Self(0x8059_0000);
    pub const BAD_TCP_MESSAGE_TYPE_INVALID: Self = Self(0x807E_0000);
    pub const BAD_TCP_SECURE_CHANNEL_UNKNOWN: Self = Self(0x807F_0000);
    pub const BAD_TCP_MESSAGE_TOO_LARGE: Self = Self(0x8080_0000);
    pub const BAD_TCP_INTERNAL_ERROR: Self = Self(0x8082_0000);
    pub const BAD_SECURE_CHANNEL_CLOSED: Self = Self(0x8086_0000);
    pub const BAD_SECURE_CHANNEL_TOKEN_UNKNOWN: Self = Self(0x8087_0000);
    pub const BAD_SEQUENCE_NUMBER_INVALID: Self = Self(0x8088_0000);
    pub const BAD_REQUEST_TOO_LARGE: Self = Self(0x80B8_0000);
    pub const BAD_RESPONSE_TOO_LARGE: Self = Self(0x80B9_0000);

    pub fn is_good(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    pub fn is_bad(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Symbolic name, if this is one of the codes this layer knows.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::GOOD => "Good",
            Self::BAD_UNEXPECTED_ERROR => "BadUnexpectedError",
            Self::BAD_INTERNAL_ERROR => "BadInternalError",
            Self::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            Self::BAD_DECODING_ERROR => "BadDecodingError",
            Self::BAD_ENCODING_LIMITS_EXCEEDED => "BadEncodingLimitsExceeded",
            Self::BAD_CERTIFICATE_INVALID => "BadCertificateInvalid",
            Self::BAD_SECURITY_CHECKS_FAILED => "BadSecurityChecksFailed",
            Self::BAD_SECURE_CHANNEL_ID_INVALID => "BadSecureChannelIdInvalid",
            Self::BAD_NONCE_INVALID => "BadNonceInvalid",
            Self::BAD_SECURITY_POLICY_REJECTED => "BadSecurityPolicyRejected",
            Self::BAD_NO_VALID_CERTIFICATES => "BadNoValidCertificates",
            Self::BAD_TCP_MESSAGE_TYPE_INVALID => "BadTcpMessageTypeInvalid",
            Self::BAD_TCP_SECURE_CHANNEL_UNKNOWN => "BadTcpSecureChannelUnknown",
            Self::BAD_TCP_MESSAGE_TOO_LARGE => "BadTcpMessageTooLarge",
            Self::BAD_TCP_INTERNAL_ERROR => "BadTcpInternalError",
            Self::BAD_SECURE_CHANNEL_CLOSED => "BadSecureChannelClosed",
            Self::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN => "BadSecureChannelTokenUnknown",
            Self::BAD_SEQUENCE_NUMBER_INVALID => "BadSequenceNumberInvalid",
            Self::BAD_REQUEST_TOO_LARGE => "BadRequestTooLarge",
            Self::BAD_RESPONSE_TOO_LARGE => "BadResponseTooLarge",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

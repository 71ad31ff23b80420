//! Security policies and message security modes.
//!
//! A policy fixes the algorithms and sizes used on a channel. All supported
//! non-None policies share HMAC-SHA256 signatures, AES-CBC with 16-byte
//! blocks and 32-byte nonces; they differ in the AES key length and in how
//! the asymmetric OpenSecureChannel exchange pads RSA blocks.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::crypto::{self, CryptoError, SessionKeys, AES_BLOCK_SIZE, SHA256_SIGNATURE_SIZE};

// ── Message Security Mode ────────────────────────────────────────────────────

/// How MSG and CLO chunks are protected. Encoded as a u32 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageSecurityMode {
    None = 1,
    Sign = 2,
    SignAndEncrypt = 3,
}

impl MessageSecurityMode {
    pub fn is_signed(self) -> bool {
        matches!(self, Self::Sign | Self::SignAndEncrypt)
    }

    pub fn is_encrypted(self) -> bool {
        self == Self::SignAndEncrypt
    }
}

impl TryFrom<u32> for MessageSecurityMode {
    type Error = PolicyError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::None),
            2 => Ok(Self::Sign),
            3 => Ok(Self::SignAndEncrypt),
            other => Err(PolicyError::UnknownMode(other.to_string())),
        }
    }
}

impl FromStr for MessageSecurityMode {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(Self::None),
            "Sign" => Ok(Self::Sign),
            "SignAndEncrypt" => Ok(Self::SignAndEncrypt),
            other => Err(PolicyError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for MessageSecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        };
        f.write_str(name)
    }
}

// ── Security Policy ──────────────────────────────────────────────────────────

pub const POLICY_URI_NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
pub const POLICY_URI_BASIC256SHA256: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256";
pub const POLICY_URI_AES128_SHA256_RSAOAEP: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep";
pub const POLICY_URI_AES256_SHA256_RSAPSS: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss";

/// Nonce length for every non-None policy.
const NONCE_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityPolicy {
    None,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
    Aes256Sha256RsaPss,
}

impl SecurityPolicy {
    pub fn from_uri(uri: &str) -> Result<Self, PolicyError> {
        match uri {
            POLICY_URI_NONE => Ok(Self::None),
            POLICY_URI_BASIC256SHA256 => Ok(Self::Basic256Sha256),
            POLICY_URI_AES128_SHA256_RSAOAEP => Ok(Self::Aes128Sha256RsaOaep),
            POLICY_URI_AES256_SHA256_RSAPSS => Ok(Self::Aes256Sha256RsaPss),
            other => Err(PolicyError::UnknownUri(other.to_string())),
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::None => POLICY_URI_NONE,
            Self::Basic256Sha256 => POLICY_URI_BASIC256SHA256,
            Self::Aes128Sha256RsaOaep => POLICY_URI_AES128_SHA256_RSAOAEP,
            Self::Aes256Sha256RsaPss => POLICY_URI_AES256_SHA256_RSAPSS,
        }
    }

    pub fn is_none(self) -> bool {
        self == Self::None
    }

    /// Policy None goes only with mode None, and every other policy needs a signing mode.
    pub fn check_mode(self, mode: MessageSecurityMode) -> Result<(), PolicyError> {
        let ok = match self {
            Self::None => mode == MessageSecurityMode::None,
            _ => mode != MessageSecurityMode::None,
        };
        if ok {
            Ok(())
        } else {
            Err(PolicyError::ModeMismatch { policy: self, mode })
        }
    }

    pub fn symmetric_signature_size(self) -> usize {
        if self.is_none() {
            0
        } else {
            SHA256_SIGNATURE_SIZE
        }
    }

    pub fn symmetric_signing_key_length(self) -> usize {
        if self.is_none() {
            0
        } else {
            32
        }
    }

    pub fn symmetric_encrypting_key_length(self) -> usize {
        match self {
            Self::None => 0,
            Self::Aes128Sha256RsaOaep => 16,
            Self::Basic256Sha256 | Self::Aes256Sha256RsaPss => 32,
        }
    }

    /// Symmetric cipher block size; plaintext and ciphertext blocks are the same size.
    pub fn symmetric_block_size(self) -> usize {
        if self.is_none() {
            1
        } else {
            AES_BLOCK_SIZE
        }
    }

    pub fn nonce_length(self) -> usize {
        if self.is_none() {
            0
        } else {
            NONCE_LENGTH
        }
    }

    /// Plaintext bytes that fit one RSA block of a `key_size`-byte key.
    ///
    /// OAEP with SHA-1 costs 42 bytes per block, OAEP with SHA-256 costs 66.
    pub fn asymmetric_plain_block_size(self, key_size: usize) -> usize {
        match self {
            Self::None => key_size,
            Self::Basic256Sha256 | Self::Aes128Sha256RsaOaep => key_size.saturating_sub(42),
            Self::Aes256Sha256RsaPss => key_size.saturating_sub(66),
        }
    }

    /// Derive one direction's keys: `secret` is the peer's nonce, `seed` is ours.
    pub fn derive_keys(self, secret: &[u8], seed: &[u8]) -> Result<SessionKeys, CryptoError> {
        SessionKeys::derive(
            secret,
            seed,
            self.symmetric_signing_key_length(),
            self.symmetric_encrypting_key_length(),
            self.symmetric_block_size(),
        )
    }

    pub fn symmetric_sign(self, keys: &SessionKeys, data: &[u8], signature: &mut [u8]) -> Result<(), CryptoError> {
        crypto::hmac_sha256_sign(keys.signing_key(), data, signature)
    }

    pub fn symmetric_verify(self, keys: &SessionKeys, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        crypto::hmac_sha256_verify(keys.signing_key(), data, signature)
    }

    pub fn symmetric_encrypt(self, keys: &SessionKeys, data: &mut [u8]) -> Result<(), CryptoError> {
        crypto::aes_cbc_encrypt(keys.encrypting_key(), keys.iv(), data)
    }

    pub fn symmetric_decrypt(self, keys: &SessionKeys, data: &mut [u8]) -> Result<(), CryptoError> {
        crypto::aes_cbc_decrypt(keys.encrypting_key(), keys.iv(), data)
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Basic256Sha256 => "Basic256Sha256",
            Self::Aes128Sha256RsaOaep => "Aes128_Sha256_RsaOaep",
            Self::Aes256Sha256RsaPss => "Aes256_Sha256_RsaPss",
        };
        f.write_str(name)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("unsupported security policy: {0}")]
    UnknownUri(String),

    #[error("unknown message security mode: {0}")]
    UnknownMode(String),

    #[error("security policy {policy} cannot be used with mode {mode}")]
    ModeMismatch {
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
    },
}

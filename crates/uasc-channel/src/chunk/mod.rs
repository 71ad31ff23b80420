//! Chunk framing: splitting messages into secured chunks and back.
//!
//! A chunk is protected in one of three ways. Under policy None nothing is
//! added. MSG and CLO chunks use the symmetric keys of a token. OPN chunks
//! under any other policy are signed with the sender's private key and
//! encrypted for the receiver's certificate.

pub mod padding;
pub mod reader;
pub mod writer;

use uasc_core::certificate::CertificateProvider;
use uasc_core::crypto::SessionKeys;
use uasc_core::policy::{MessageSecurityMode, SecurityPolicy};
use uasc_core::StatusCode;

use crate::error::ChannelError;

pub use reader::{ChunkReader, IncomingMessage, ReaderEvent, ReaderLimits, SecurityResolver};
pub use writer::{ChunkWriter, OutgoingMessage, WriterLimits};

/// Keys and certificates that protect one chunk.
#[derive(Clone, Copy)]
pub enum ChunkSecurity<'a> {
    None,
    Symmetric {
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        /// Sending keys when writing, the peer's keys when reading.
        keys: &'a SessionKeys,
    },
    Asymmetric {
        policy: SecurityPolicy,
        certificates: &'a dyn CertificateProvider,
        /// Receiver's certificate when writing, sender's when reading.
        remote_certificate: &'a [u8],
    },
}

/// Sizes that shape a secured chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Framing {
    pub signature_size: usize,
    pub encrypted: bool,
    pub plain_block: usize,
    pub cipher_block: usize,
    /// 1, or 2 when the padding needs an extra size byte.
    pub min_padding: usize,
}

impl Framing {
    const PLAIN: Framing = Framing {
        signature_size: 0,
        encrypted: false,
        plain_block: 1,
        cipher_block: 1,
        min_padding: 0,
    };
}

/// Keys larger than 2048 bits need a second padding size byte.
fn min_padding_for_key(key_size: usize) -> usize {
    if key_size > 256 {
        2
    } else {
        1
    }
}

impl ChunkSecurity<'_> {
    /// Framing when we produce a chunk.
    pub(crate) fn outbound(&self) -> Result<Framing, ChannelError> {
        match *self {
            ChunkSecurity::None => Ok(Framing::PLAIN),
            ChunkSecurity::Symmetric { policy, mode, .. } => Ok(symmetric(policy, mode)),
            ChunkSecurity::Asymmetric {
                policy,
                certificates,
                remote_certificate,
            } => {
                let remote_key = certificates.key_size(remote_certificate).map_err(|e| {
                    ChannelError::encoding(StatusCode::BAD_CERTIFICATE_INVALID, e.to_string())
                })?;
                Ok(Framing {
                    signature_size: certificates.own_key_size(),
                    encrypted: true,
                    plain_block: certificates.plain_block_size(policy, remote_key),
                    cipher_block: remote_key,
                    min_padding: min_padding_for_key(remote_key),
                })
            }
        }
    }

    /// Framing when we consume a chunk.
    pub(crate) fn inbound(&self) -> Result<Framing, ChannelError> {
        match *self {
            ChunkSecurity::None => Ok(Framing::PLAIN),
            ChunkSecurity::Symmetric { policy, mode, .. } => Ok(symmetric(policy, mode)),
            ChunkSecurity::Asymmetric {
                policy,
                certificates,
                remote_certificate,
            } => {
                let sender_key = certificates
                    .key_size(remote_certificate)
                    .map_err(|_| ChannelError::security())?;
                let own_key = certificates.own_key_size();
                Ok(Framing {
                    signature_size: sender_key,
                    encrypted: true,
                    plain_block: certificates.plain_block_size(policy, own_key),
                    cipher_block: own_key,
                    min_padding: min_padding_for_key(own_key),
                })
            }
        }
    }
}

fn symmetric(policy: SecurityPolicy, mode: MessageSecurityMode) -> Framing {
    let block = policy.symmetric_block_size();
    Framing {
        signature_size: policy.symmetric_signature_size(),
        encrypted: mode.is_encrypted(),
        plain_block: block,
        cipher_block: block,
        min_padding: if mode.is_encrypted() { 1 } else { 0 },
    }
}

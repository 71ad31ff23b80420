//! uasc-core — wire format, security policies, cryptographic primitives,
//! sequence numbers, tokens and configuration for OPC UA secure conversation.
//! The channel crate and the daemon depend on this one.

pub mod certificate;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod policy;
pub mod sequence;
pub mod status;
pub mod token;
pub mod wire;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use certificate::CertificateProvider;
pub use clock::{Clock, ManualClock, SystemClock};
pub use policy::{MessageSecurityMode, SecurityPolicy};
pub use sequence::SequenceNumberGenerator;
pub use status::StatusCode;
pub use token::ChannelSecurityToken;
pub use wire::{ChunkType, MessageType};

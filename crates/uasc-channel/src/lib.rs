//! uasc-channel — chunking, chunk security and the secure channel state
//! machine, plus the handle-based [`ChannelManager`] the service layer and
//! the transport talk to.

pub mod channel;
pub mod chunk;
pub mod error;
pub mod manager;

pub use channel::{
    ChannelEvent, ChannelLimits, ChannelOptions, ChannelState, FeedOutcome, Role, SecureChannel,
};
pub use chunk::{ChunkReader, ChunkSecurity, ChunkWriter, ReaderLimits, WriterLimits};
pub use error::{ChannelError, ErrorKind};
pub use manager::{ChannelHandle, ChannelManager, ManagerOptions, Transport};

//! Channel security tokens.

use std::time::{Duration, SystemTime};

/// Shortest token lifetime a server grants.
pub const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(10);

/// Longest token lifetime a server grants.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// An issued token. Keys derived for it are held by the channel.
///
/// A token is honoured for 1.6 times its revised lifetime. The extra 60%
/// covers messages a peer sent just before renewing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSecurityToken {
    pub secure_channel_id: u32,
    pub token_id: u32,
    pub created_at: SystemTime,
    pub revised_lifetime: Duration,
}

impl ChannelSecurityToken {
    pub fn new(
        secure_channel_id: u32,
        token_id: u32,
        created_at: SystemTime,
        revised_lifetime: Duration,
    ) -> Self {
        Self {
            secure_channel_id,
            token_id,
            created_at,
            revised_lifetime,
        }
    }

    /// `created_at + 1.6 × revised_lifetime`.
    pub fn expires_at(&self) -> SystemTime {
        self.created_at + self.revised_lifetime * 8 / 5
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now > self.expires_at()
    }

    /// When a client should start renewing: 75% of the revised lifetime.
    pub fn renew_at(&self) -> SystemTime {
        self.created_at + self.revised_lifetime * 3 / 4
    }

    pub fn should_renew(&self, now: SystemTime) -> bool {
        now >= self.renew_at()
    }
}

/// Clamp a requested lifetime in milliseconds to what a server grants.
pub fn revise_lifetime(requested_ms: u32) -> Duration {
    Duration::from_millis(u64::from(requested_ms)).clamp(MIN_TOKEN_LIFETIME, MAX_TOKEN_LIFETIME)
}

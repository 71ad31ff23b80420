//! Chunk sequence numbers.
//!
//! Every chunk a peer sends carries a number one greater than the previous
//! chunk it sent on the channel, across all messages. Numbers never repeat
//! within a channel, 0 is never used, and after `u32::MAX` the sequence
//! continues at 1.

use thiserror::Error;

/// Sending side: issues numbers. Receiving side: checks them.
///
/// The type is `Copy`, so a writer can work on a snapshot and only commit
/// the advanced state once a whole message has been produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceNumberGenerator {
    /// 0 until the first number is issued or seen.
    last: u32,
}

/// The number that follows `n`.
pub fn successor(n: u32) -> u32 {
    if n == u32::MAX {
        1
    } else {
        n + 1
    }
}

impl SequenceNumberGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A generator whose next number is `successor(last)`.
    pub fn starting_after(last: u32) -> Self {
        Self { last }
    }

    /// Last number issued or accepted; 0 if none.
    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn next(&mut self) -> u32 {
        self.last = successor(self.last);
        self.last
    }

    /// Whether `received` may follow what has been seen so far.
    ///
    /// The first number on a channel is accepted as-is as long as it is non-zero.
    pub fn validate(&self, received: u32) -> bool {
        if received == 0 {
            return false;
        }
        self.last == 0 || received == successor(self.last)
    }

    /// Validate and record a received number.
    pub fn accept(&mut self, received: u32) -> Result<(), SequenceError> {
        if !self.validate(received) {
            return Err(SequenceError {
                expected: successor(self.last),
                received,
            });
        }
        self.last = received;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sequence number {received} received, expected {expected}")]
pub struct SequenceError {
    pub expected: u32,
    pub received: u32,
}

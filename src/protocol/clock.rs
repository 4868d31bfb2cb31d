//! Lamport logical clock.

use crate::protocol::Timestamp;

/// Monotonically advancing Lamport logical counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LamportClock {
    value: Timestamp,
}

impl LamportClock {
    /// Creates a clock starting at zero.
    pub fn new() -> Self {
        LamportClock { value: 0 }
    }

    /// Current clock value, without advancing it.
    #[inline]
    pub fn now(&self) -> Timestamp {
        self.value
    }

    /// Local or send event: advances the clock by one and returns the new
    /// value, which is used to stamp the outgoing message.
    #[inline]
    pub fn tick(&mut self) -> Timestamp {
        self.value += 1;
        self.value
    }

    /// Receive event: merges a remote timestamp, `local = max(local,
    /// remote) + 1`. Must be called before the inbound message is otherwise
    /// processed.
    #[inline]
    pub fn observe(&mut self, remote: Timestamp) -> Timestamp {
        self.value = self.value.max(remote) + 1;
        self.value
    }
}

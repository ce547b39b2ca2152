//! Cumulative byte counters
//!
//! Counters never saturate: whenever the running total would wrap past
//! `u64::MAX`, the wrapped remainder is kept in `bytes` and `overflow_count`
//! is bumped once.

/// Overflow-safe running byte total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCount {
    /// Bytes since the last wrap
    pub bytes: u64,
    /// Number of times the total wrapped past `u64::MAX`
    pub overflow_count: u64,
}

impl ByteCount {
    /// A zeroed counter
    pub const fn new() -> Self {
        Self {
            bytes: 0,
            overflow_count: 0,
        }
    }

    /// Add `n` bytes to the total
    #[inline]
    pub fn add(&mut self, n: u64) {
        let (sum, wrapped) = self.bytes.overflowing_add(n);
        self.bytes = sum;
        if wrapped {
            self.overflow_count = self.overflow_count.wrapping_add(1);
        }
    }

    /// Reset to zero
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Exact total as a 128-bit integer
    pub fn total(&self) -> u128 {
        (self.overflow_count as u128) * (1u128 << 64) + self.bytes as u128
    }
}

/// Sent/received counters for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    /// Bytes accepted by the transport for writing
    pub sent: ByteCount,
    /// Bytes read from the transport
    pub received: ByteCount,
}

impl Traffic {
    /// Reset both directions
    pub fn reset(&mut self) {
        self.sent.reset();
        self.received.reset();
    }
}

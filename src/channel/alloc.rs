//! Receive-buffer sizing and the continue-reading heuristic.
//!
//! A [`RecvBufferPolicy`] is the configured sizing policy; an [`AllocHandle`]
//! is the per-read-loop state that applies it. The handle is reset at the
//! start of every read cycle and decides after each receive whether the
//! cycle should keep reading or yield back to the scheduler.
//!
//! # Adaptive sizing
//!
//! The next buffer size doubles when a receive fills the whole buffer and
//! halves after two consecutive cycles that used less than half of it,
//! always staying within `[minimum, maximum]`.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default smallest receive buffer.
const DEFAULT_MINIMUM: usize = 64;

/// Default first receive buffer.
const DEFAULT_INITIAL: usize = 2048;

/// Default largest receive buffer.
const DEFAULT_MAXIMUM: usize = 64 * 1024;

/// Default cap on receives per read cycle.
const DEFAULT_MAX_MESSAGES_PER_READ: u32 = 16;

// ============================================================================
// RecvBufferPolicy
// ============================================================================

/// Receive-buffer sizing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecvBufferPolicy {
    /// Size of the first buffer allocated by a new read loop.
    pub initial: usize,
    /// Lower bound for adaptive sizing.
    pub minimum: usize,
    /// Upper bound for adaptive sizing.
    pub maximum: usize,
    /// Maximum receives performed in one read cycle before yielding.
    pub max_messages_per_read: u32,
}

impl Default for RecvBufferPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvBufferPolicy {
    /// Creates the default policy.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial: DEFAULT_INITIAL,
            minimum: DEFAULT_MINIMUM,
            maximum: DEFAULT_MAXIMUM,
            max_messages_per_read: DEFAULT_MAX_MESSAGES_PER_READ,
        }
    }

    /// Creates a policy that always allocates `size` bytes.
    #[inline]
    #[must_use]
    pub const fn fixed(size: usize) -> Self {
        Self {
            initial: size,
            minimum: size,
            maximum: size,
            max_messages_per_read: DEFAULT_MAX_MESSAGES_PER_READ,
        }
    }

    /// Sets the receive cap per read cycle.
    #[inline]
    #[must_use]
    pub const fn with_max_messages_per_read(mut self, max: u32) -> Self {
        self.max_messages_per_read = max;
        self
    }

    /// Validates the bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any bound is zero or the bounds are
    /// not ordered `minimum <= initial <= maximum`.
    pub fn validate(&self) -> Result<()> {
        if self.minimum == 0 || self.max_messages_per_read == 0 {
            return Err(Error::config(
                "receive buffer minimum and max_messages_per_read must be non-zero",
            ));
        }
        if self.minimum > self.initial || self.initial > self.maximum {
            return Err(Error::config(format!(
                "receive buffer bounds must satisfy minimum <= initial <= maximum ({} / {} / {})",
                self.minimum, self.initial, self.maximum
            )));
        }
        Ok(())
    }

    /// Creates the per-loop handle applying this policy.
    #[must_use]
    pub fn new_handle(&self) -> AllocHandle {
        AllocHandle {
            policy: *self,
            next_guess: self.initial,
            decrease_now: false,
            messages: 0,
            total_bytes: 0,
            attempted_bytes: 0,
            last_bytes_read: 0,
        }
    }
}

// ============================================================================
// AllocHandle
// ============================================================================

/// Per-read-loop allocation state.
#[derive(Debug, Clone)]
pub struct AllocHandle {
    policy: RecvBufferPolicy,
    next_guess: usize,
    decrease_now: bool,
    messages: u32,
    total_bytes: usize,
    attempted_bytes: usize,
    last_bytes_read: usize,
}

impl AllocHandle {
    /// Resets the per-cycle counters.
    pub fn reset(&mut self) {
        self.messages = 0;
        self.total_bytes = 0;
        self.attempted_bytes = 0;
        self.last_bytes_read = 0;
    }

    /// Returns the size of the next buffer to allocate.
    #[inline]
    #[must_use]
    pub fn guess(&self) -> usize {
        self.next_guess
    }

    /// Records how many bytes the next receive may fill.
    #[inline]
    pub fn attempt(&mut self, bytes: usize) {
        self.attempted_bytes = bytes;
    }

    /// Records the result of one receive.
    pub fn record(&mut self, bytes: usize) {
        self.last_bytes_read = bytes;
        self.total_bytes = self.total_bytes.saturating_add(bytes);
        if bytes > 0 && bytes >= self.attempted_bytes {
            self.next_guess = self.next_guess.saturating_mul(2).min(self.policy.maximum);
            self.decrease_now = false;
        }
    }

    /// Counts one buffer published downstream.
    #[inline]
    pub fn inc_messages(&mut self) {
        self.messages = self.messages.saturating_add(1);
    }

    /// Returns the number of buffers published in this cycle.
    #[inline]
    #[must_use]
    pub fn messages(&self) -> u32 {
        self.messages
    }

    /// Returns the bytes read in this cycle.
    #[inline]
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Returns `true` if the cycle should perform another receive.
    ///
    /// Continues only while the last receive filled its buffer (more data
    /// is likely waiting) and the per-cycle cap is not reached.
    #[must_use]
    pub fn continue_reading(&self) -> bool {
        self.messages < self.policy.max_messages_per_read
            && self.last_bytes_read > 0
            && self.last_bytes_read >= self.attempted_bytes
    }

    /// Adapts the next guess once the cycle ends.
    pub fn read_complete(&mut self) {
        let actual = self.total_bytes;
        if actual <= self.next_guess / 2 {
            if self.decrease_now {
                self.next_guess = (self.next_guess / 2).max(self.policy.minimum);
                self.decrease_now = false;
            } else {
                self.decrease_now = true;
            }
        } else {
            self.decrease_now = false;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

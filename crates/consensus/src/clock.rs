//! Lamport logical clock

use parking_lot::Mutex;

/// Process-wide logical clock.
///
/// Never decreases. `tick` before every send, `observe` right after every
/// receive. Saturates at `u64::MAX` instead of wrapping.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: Mutex<u64>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new value
    pub fn tick(&self) -> u64 {
        let mut value = self.value.lock();
        *value = value.saturating_add(1);
        *value
    }

    /// Merge a received value: `max(local, received) + 1`
    pub fn observe(&self, received: u64) -> u64 {
        let mut value = self.value.lock();
        *value = (*value).max(received).saturating_add(1);
        *value
    }

    /// Read without advancing
    pub fn current(&self) -> u64 {
        *self.value.lock()
    }

    /// Raise the clock to at least `value` (after reloading persisted state)
    pub fn restore(&self, value: u64) -> u64 {
        let mut current = self.value.lock();
        *current = (*current).max(value);
        *current
    }
}

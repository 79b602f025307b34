//! Clock Skew
//!
//! A shared, process-local record of the offset between the local clock and
//! the collector endpoint's clock, derived from a transport response's
//! `Date` header. [`crate::transport::Transmitter`] writes it each time it
//! observes a response; [`crate::pipeline::Pipeline`] reads it to shift
//! event timestamps before they're serialized, so the two stay wired
//! together without either one depending on the other's internals.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Atomically-updated millisecond offset, `server_time - local_time`.
#[derive(Debug, Default)]
pub struct ClockSkew {
    offset_ms: AtomicI64,
}

impl ClockSkew {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Shifts `timestamp` by the currently recorded offset.
    pub fn apply(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.offset_ms();
        if offset == 0 {
            timestamp
        } else {
            timestamp + Duration::milliseconds(offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_offset_leaves_timestamp_unchanged() {
        let skew = ClockSkew::new();
        let now = Utc::now();
        assert_eq!(skew.apply(now), now);
    }

    #[test]
    fn nonzero_offset_shifts_timestamp() {
        let skew = ClockSkew::new();
        skew.set_offset_ms(1_500);
        let now = Utc::now();
        assert_eq!(skew.apply(now), now + Duration::milliseconds(1_500));
    }
}

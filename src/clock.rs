//! # Timestamp Providers
//!
//! Hybrid logical clocks handing out strictly increasing timestamps.
//! Every provider is tagged with the clock authority it represents.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{ClockTag, Timestamp};

/// Source of commit timestamps
pub trait TimestampProvider: Send + Sync {
    /// Generate a timestamp greater than every previously generated one
    fn generate_timestamp(&self) -> Timestamp;

    /// Latest timestamp known to this provider, without generating one
    fn latest_timestamp(&self) -> Timestamp;

    /// Clock authority this provider belongs to
    fn clock_tag(&self) -> Option<ClockTag>;
}

/// Hybrid logical clock over the local wall clock
#[derive(Debug)]
pub struct LocalClock {
    clock_tag: Option<ClockTag>,
    last: AtomicU64,
}

impl LocalClock {
    pub fn new(clock_tag: Option<ClockTag>) -> Self {
        Self {
            clock_tag,
            last: AtomicU64::new(0),
        }
    }

    fn physical_now() -> Timestamp {
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Timestamp::from_parts(millis, 0)
    }
}

impl TimestampProvider for LocalClock {
    fn generate_timestamp(&self) -> Timestamp {
        let physical = Self::physical_now().value();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = physical.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Timestamp(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    fn latest_timestamp(&self) -> Timestamp {
        Timestamp(self.last.load(Ordering::SeqCst)).max(Self::physical_now())
    }

    fn clock_tag(&self) -> Option<ClockTag> {
        self.clock_tag
    }
}

/// Clock advanced only by hand
///
/// Each generated timestamp is one tick after the previous one.
#[derive(Debug)]
pub struct ManualClock {
    clock_tag: Option<ClockTag>,
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(clock_tag: Option<ClockTag>, start: Timestamp) -> Self {
        Self {
            clock_tag,
            now: AtomicU64::new(start.value()),
        }
    }

    /// Move the physical component forward by `millis`
    pub fn advance_ms(&self, millis: u64) {
        let step = Timestamp::from_parts(millis, 0).value();
        self.now.fetch_add(step, Ordering::SeqCst);
    }
}

impl TimestampProvider for ManualClock {
    fn generate_timestamp(&self) -> Timestamp {
        Timestamp(self.now.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn latest_timestamp(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst))
    }

    fn clock_tag(&self) -> Option<ClockTag> {
        self.clock_tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_local_clock_strictly_increases() {
        let clock = LocalClock::new(None);
        let mut prev = clock.generate_timestamp();
        for _ in 0..1000 {
            let next = clock.generate_timestamp();
            assert!(next > prev);
            prev = next;
        }
        assert!(clock.latest_timestamp() >= prev);
    }

    #[test]
    fn test_local_clock_concurrent_uniqueness() {
        let clock = Arc::new(LocalClock::new(Some(ClockTag(7))));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || {
                    (0..250).map(|_| clock.generate_timestamp()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<Timestamp> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(clock.clock_tag(), Some(ClockTag(7)));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(None, Timestamp::from_parts(100, 0));
        let first = clock.generate_timestamp();
        clock.advance_ms(50);
        let second = clock.generate_timestamp();
        assert_eq!(first.millis_until(second), 50);
    }
}

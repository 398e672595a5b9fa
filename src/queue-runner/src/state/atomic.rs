use jiff::Timestamp;
use std::sync::atomic::{AtomicI64, Ordering};

/// Wall-clock timestamp stored as epoch milliseconds so step scheduling
/// state can be read without taking the step lock.
#[derive(Debug)]
pub struct AtomicDateTime {
    millis: AtomicI64,
}

impl Default for AtomicDateTime {
    fn default() -> Self {
        Self::new(Timestamp::now())
    }
}

impl AtomicDateTime {
    #[must_use]
    pub fn new(dt: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(dt.as_millisecond()),
        }
    }

    pub fn load(&self) -> Timestamp {
        Timestamp::from_millisecond(self.millis.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn store(&self, dt: Timestamp) {
        self.millis.store(dt.as_millisecond(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let now = Timestamp::now();
        let atomic = AtomicDateTime::new(now);
        assert_eq!(atomic.load().as_millisecond(), now.as_millisecond());

        let later = now + jiff::SignedDuration::from_secs(90);
        atomic.store(later);
        assert_eq!(atomic.load().as_millisecond(), later.as_millisecond());
    }
}

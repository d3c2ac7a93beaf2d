use std::{thread, time::{Duration, Instant}};

/// A bounded wait for a hardware condition.
///
/// Each [Timeout::run] either sleeps for one polling interval and reports that the caller may
/// check again, or reports that the deadline has passed.
pub struct Timeout {
    instant: Instant,
    duration: Duration,
    interval: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            instant: Instant::now(),
            duration,
            interval: Duration::from_millis(10),
        }
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Sets the sleep between two checks. A zero interval yields instead.
    #[inline]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.instant.elapsed() >= self.duration
    }

    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        if self.expired() {
            return Err(());
        }
        if self.interval.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(self.interval);
        }
        Ok(())
    }

    /// Polls until `done` holds or the deadline passes. Returns whether `done` held.
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) -> bool {
        loop {
            if done() {
                return true;
            }
            if self.run().is_err() {
                return done();
            }
        }
    }
}

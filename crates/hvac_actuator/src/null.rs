//! Null Driver
//!
//! In-memory stand-in for hardware. Records every successful write, can
//! simulate slow hardware with a random delay, and can fail a number of
//! writes up front.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use hvac_types::{Error, Result};

use crate::device::{Command, Driver};

pub struct NullDriver<C> {
    id: String,
    min_delay: Duration,
    max_delay: Duration,
    writes: Mutex<Vec<C>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
}

impl<C: Command> NullDriver<C> {
    /// Create a driver that completes writes immediately
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            writes: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Delay every write by a random interval within `min..=max`
    pub fn with_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max.max(min);
        self
    }

    /// Fail the first `count` writes
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Successful writes, in order
    pub fn writes(&self) -> Vec<C> {
        self.writes.lock().clone()
    }

    /// Last successful write
    pub fn last(&self) -> Option<C> {
        self.writes.lock().last().cloned()
    }

    /// Write attempts including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[async_trait]
impl<C: Command> Driver<C> for NullDriver<C> {
    async fn write(&self, command: &C) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::HardwareIo(format!("{}: simulated failure", self.id)));
        }

        tracing::trace!(driver = %self.id, ?command, "write");
        self.writes.lock().push(command.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_writes() {
        let driver = NullDriver::new("null");

        driver.write(&1).await.unwrap();
        driver.write(&2).await.unwrap();

        assert_eq!(driver.writes(), vec![1, 2]);
        assert_eq!(driver.last(), Some(2));
    }

    #[tokio::test]
    async fn fails_requested_number_of_times() {
        let driver = NullDriver::new("null").failing_first(2);

        assert!(driver.write(&true).await.is_err());
        assert!(driver.write(&true).await.is_err());
        assert!(driver.write(&true).await.is_ok());
        assert_eq!(driver.attempts(), 3);
        assert_eq!(driver.writes(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_stays_in_range() {
        let driver = NullDriver::new("null")
            .with_delay(Duration::from_millis(10), Duration::from_millis(20));

        let start = tokio::time::Instant::now();
        driver.write(&0.5).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed <= Duration::from_millis(21));
    }
}

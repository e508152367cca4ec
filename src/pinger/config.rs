use std::time::Duration;

use crate::error::{Error, Result};

pub(crate) const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(200);
pub(crate) const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe timing: `interval` is the send cadence, `timeout` the per-probe
/// deadline.
#[derive(Clone, Copy, Debug)]
pub struct PingConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PING_INTERVAL,
            timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl PingConfig {
    pub fn new(interval: Duration, timeout: Duration) -> PingConfig {
        Self { interval, timeout }
    }
    pub fn set_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn check(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::InvalidArgument("interval cannot be 0".into()));
        }
        if self.interval > self.timeout {
            return Err(Error::InvalidArgument(
                "interval cannot exceed timeout".into(),
            ));
        }
        Ok(())
    }

    /// Derive a config with the cadence stretched by `interval_count`, never
    /// past the deadline.
    pub(crate) fn with_interval_count(&self, interval_count: u32) -> PingConfig {
        let interval = self
            .interval
            .saturating_mul(interval_count.max(1))
            .min(self.timeout);
        Self {
            interval,
            timeout: self.timeout,
        }
    }
}

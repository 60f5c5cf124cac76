//! Hardware settle delays and polling cadence

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delays observed between device operations
///
/// The settle delays are hardware timing requirements of the EDL programmer,
/// not cosmetic pauses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Wait after the programmer upload
    pub programmer_settle_secs: u64,
    /// Wait after each partition read
    pub read_settle_secs: u64,
    /// Wait after a reset toward system boot
    pub reset_settle_secs: u64,
    /// Interval between enumeration probes while waiting for a mode
    pub poll_interval_ms: u64,
    /// Upper bound for one `adb shell getprop` slot query
    pub adb_query_timeout_secs: u64,
    /// Give up waiting for a mode after this long. `None` waits forever.
    pub mode_wait_timeout_secs: Option<u64>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            programmer_settle_secs: 2,
            read_settle_secs: 5,
            reset_settle_secs: 10,
            poll_interval_ms: 1000,
            adb_query_timeout_secs: 15,
            mode_wait_timeout_secs: None,
        }
    }
}

impl Timings {
    /// No delays at all, for tests driving fake tools
    pub fn immediate() -> Self {
        Self {
            programmer_settle_secs: 0,
            read_settle_secs: 0,
            reset_settle_secs: 0,
            poll_interval_ms: 0,
            adb_query_timeout_secs: 5,
            mode_wait_timeout_secs: None,
        }
    }

    pub fn programmer_settle(&self) -> Duration {
        Duration::from_secs(self.programmer_settle_secs)
    }

    pub fn read_settle(&self) -> Duration {
        Duration::from_secs(self.read_settle_secs)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_secs(self.reset_settle_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn adb_query_timeout(&self) -> Duration {
        Duration::from_secs(self.adb_query_timeout_secs)
    }

    pub fn mode_wait_timeout(&self) -> Option<Duration> {
        self.mode_wait_timeout_secs.map(Duration::from_secs)
    }
}

/// Sleep unless the delay is zero
pub(crate) async fn settle(delay: Duration) {
    if !delay.is_zero() {
        tracing::debug!("Waiting {:?} for device to settle", delay);
        tokio::time::sleep(delay).await;
    }
}

//! Configuration passed to [`Runtime`](crate::Runtime).

use core::time::Duration;

/// Configuration passed to [`Runtime::new`](crate::Runtime::new).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of worker threads dispatching service messages.
    ///
    /// Defaults to 8. The first 32 workers are assigned a mix of batch
    /// weights so that some drain one message at a time (low latency) while
    /// others drain large fractions of a queue (throughput).
    pub workers: usize,

    /// Node id stored in the upper 8 bits of every service handle.
    ///
    /// Defaults to 0, meaning a standalone node.
    pub harbor: u8,

    /// Accumulate per-service CPU time for every dispatched message.
    ///
    /// Defaults to `false`. When enabled, the dispatcher samples the worker
    /// thread's CPU clock around each handler invocation.
    pub profile: bool,

    /// Interval between watchdog scans for handlers that have not returned.
    ///
    /// Defaults to 5 seconds. A handler that spans two consecutive scans is
    /// flagged as a suspected endless loop.
    pub watchdog_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 8,
            harbor: 0,
            profile: false,
            watchdog_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sanity_check() {
        let config = Config::default();

        assert_eq!(config.workers, 8);
        assert_eq!(config.harbor, 0);
        assert!(!config.profile);
        assert_eq!(config.watchdog_interval, Duration::from_secs(5));
    }
}

use std::time::Duration;

use derive_setters::Setters;

/// Tunables for a courier worker.
///
/// Construct with [`Config::new`] and override individual fields with the
/// generated setters.
#[derive(Clone, Debug, Setters)]
pub struct Config {
    /// The cadence at which the worker scans for due tasks.
    ///
    /// Rows becoming due between ticks wait for the next tick, so this bounds
    /// how far past its due time a task typically fires.
    pub polling_interval: Duration,

    /// Size of the worker pool executing claimed tasks.
    pub max_threads: usize,

    /// The most rows a single poll may claim.
    ///
    /// The effective batch is additionally capped by the pool's idle
    /// capacity at the time of the poll.
    pub batch_size: u32,

    /// How long a claimed row may go without a heartbeat before any worker
    /// is allowed to forcibly release it.
    ///
    /// This is the recovery bound after a crash: work resumes at most one
    /// lease timeout plus one polling interval later.
    pub lease_timeout: Duration,

    /// The period between lease heartbeats while a task executes.
    ///
    /// Defaults to a quarter of `lease_timeout`, leaving three missed
    /// heartbeats of slack before the lease is considered stale.
    #[setters(strip_option)]
    pub lease_heartbeat_interval: Option<Duration>,

    /// First retry delay after a failed execution.
    pub failure_backoff_base: Duration,

    /// Upper bound on the retry delay, however many failures accumulate.
    pub failure_backoff_ceiling: Duration,

    /// How long a shutting-down worker waits for in-flight tasks before
    /// abandoning them to lease recovery.
    pub shutdown_grace: Duration,

    /// Upper bound on a single broker publish attempt.
    pub publish_timeout: Duration,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_heartbeat_interval
            .unwrap_or(self.lease_timeout / 4)
    }

    /// The delay before re-entering a row that has failed `failures`
    /// consecutive times (1-based): `min(base * 2^(failures-1), ceiling)`.
    pub fn backoff(&self, failures: i32) -> Duration {
        let exponent = failures.saturating_sub(1).clamp(0, 20) as u32;
        let delay = self
            .failure_backoff_base
            .saturating_mul(1u32 << exponent);

        delay.min(self.failure_backoff_ceiling)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(10),
            max_threads: 10,
            batch_size: 30,
            lease_timeout: Duration::from_secs(240),
            lease_heartbeat_interval: None,
            failure_backoff_base: Duration::from_secs(30),
            failure_backoff_ceiling: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_up_to_ceiling() {
        let config = Config::new();

        assert_eq!(config.backoff(1), Duration::from_secs(30));
        assert_eq!(config.backoff(2), Duration::from_secs(60));
        assert_eq!(config.backoff(3), Duration::from_secs(120));
        assert_eq!(config.backoff(8), Duration::from_secs(3600));
        assert_eq!(config.backoff(1000), Duration::from_secs(3600));
    }

    #[test]
    fn heartbeat_interval_defaults_to_quarter_lease() {
        let config = Config::new().lease_timeout(Duration::from_secs(120));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));

        let config = config.lease_heartbeat_interval(Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
    }
}

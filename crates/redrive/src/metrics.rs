use prometheus::{IntCounter, Opts, Registry};

/// Prometheus counters for the retry subsystem.
pub struct RetryMetrics {
    /// Entries persisted by the decorator.
    pub entries_written: IntCounter,
    /// Replays that completed without error.
    pub replays_succeeded: IntCounter,
    /// Replays that failed, including logic that could not be rebuilt.
    pub replays_failed: IntCounter,
    /// Entries marked acknowledged, by replay or by an external confirmation.
    pub entries_acknowledged: IntCounter,
    /// Expired entries handed to the dead-letter sink.
    pub entries_expired: IntCounter,
    /// Acknowledged entries deleted by pruning.
    pub entries_pruned: IntCounter,
}

impl RetryMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.entries_written.clone()))?;
        registry.register(Box::new(metrics.replays_succeeded.clone()))?;
        registry.register(Box::new(metrics.replays_failed.clone()))?;
        registry.register(Box::new(metrics.entries_acknowledged.clone()))?;
        registry.register(Box::new(metrics.entries_expired.clone()))?;
        registry.register(Box::new(metrics.entries_pruned.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric names")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            entries_written: IntCounter::with_opts(Opts::new(
                "retry_entries_written",
                "Entries persisted for later replay",
            ))?,
            replays_succeeded: IntCounter::with_opts(Opts::new(
                "retry_replays_succeeded",
                "Replay attempts that completed without error",
            ))?,
            replays_failed: IntCounter::with_opts(Opts::new(
                "retry_replays_failed",
                "Replay attempts that failed",
            ))?,
            entries_acknowledged: IntCounter::with_opts(Opts::new(
                "retry_entries_acknowledged",
                "Entries marked acknowledged",
            ))?,
            entries_expired: IntCounter::with_opts(Opts::new(
                "retry_entries_expired",
                "Expired entries handed to the dead-letter sink",
            ))?,
            entries_pruned: IntCounter::with_opts(Opts::new(
                "retry_entries_pruned",
                "Acknowledged entries deleted by pruning",
            ))?,
        })
    }
}

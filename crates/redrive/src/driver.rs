use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DriverConfig;
use crate::coordinator::{ReplayVerdict, RetryCoordinator};
use crate::dead_letter::DeadLetterSink;
use crate::entry::RetryEntry;
use crate::error::RetryError;
use crate::logic::{LogicRegistry, RetryLogic};
use crate::message::RetryMessage;
use crate::metrics::RetryMetrics;
use crate::retry_store::RetryStore;

/// Counts from one [`RetryDriver::run`] cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveReport {
    /// Acknowledged entries deleted.
    pub pruned: u64,
    /// Expired entries handed to the dead-letter sink and deleted.
    pub expired: usize,
    /// Entries replayed, whatever the outcome.
    pub replayed: usize,
    /// Replays that failed.
    pub failed: usize,
    /// Entries acknowledged after a successful replay.
    pub acknowledged: usize,
    /// Entries whose retry count was incremented.
    pub rescheduled: usize,
}

impl DriveReport {
    fn is_idle(&self) -> bool {
        *self == DriveReport::default()
    }
}

/// Replays queued entries each time it is triggered.
pub struct RetryDriver {
    store: Arc<dyn RetryStore>,
    registry: Arc<LogicRegistry>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: DriverConfig,
    metrics: Arc<RetryMetrics>,
}

impl RetryDriver {
    pub fn new(
        store: Arc<dyn RetryStore>,
        registry: Arc<LogicRegistry>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: DriverConfig,
    ) -> Result<Self, RetryError> {
        config.validate()?;
        Ok(Self {
            store,
            registry,
            dead_letters,
            config,
            metrics: Arc::new(RetryMetrics::unregistered()),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<RetryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run one cycle: prune acknowledged entries, sweep expired ones, then
    /// replay every eligible entry.
    ///
    /// Pruning and sweeping are best effort and never fail the cycle. Each
    /// replay is settled independently; the only replay outcome returned as an
    /// error is a failed asynchronous entry without auto-retry, which aborts
    /// the remaining replays. Failing to list eligible entries is also returned.
    ///
    /// Entries are replayed one at a time. A replay that never finishes blocks
    /// the cycle unless [`DriverConfig::replay_timeout`] is set. Two drivers
    /// polling the same store can replay an entry twice: nothing claims rows
    /// between listing and settling them.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<DriveReport, RetryError> {
        let mut report = DriveReport::default();

        if self.config.prune_acknowledged {
            report.pruned = self.prune_acknowledged().await;
        }
        if self.config.prune_expired {
            report.expired = self.sweep_expired().await;
        }

        let entries = self.store.obtain_messages_to_retry().await?;
        for entry in entries {
            let outcome = self.replay(&entry).await;
            report.replayed += 1;

            let succeeded = outcome.is_ok();
            if let Err(e) = &outcome {
                report.failed += 1;
                self.metrics.replays_failed.inc();
                warn!(
                    message_id = %entry.message_id,
                    retries_to_date = entry.retries_to_date,
                    error = %e,
                    "replay failed"
                );
            } else {
                self.metrics.replays_succeeded.inc();
            }

            let propagating = RetryCoordinator::verdict(entry.acknowledgment(), succeeded)
                == ReplayVerdict::Propagate;
            match RetryCoordinator::settle(self.store.as_ref(), &entry, outcome).await {
                Ok(ReplayVerdict::Acknowledge) => {
                    report.acknowledged += 1;
                    self.metrics.entries_acknowledged.inc();
                    debug!(message_id = %entry.message_id, "replay succeeded, entry acknowledged");
                }
                Ok(ReplayVerdict::Reschedule) => {
                    report.rescheduled += 1;
                    debug!(message_id = %entry.message_id, "entry rescheduled");
                }
                Ok(ReplayVerdict::Propagate) => {}
                Err(e) if propagating => {
                    error!(
                        message_id = %entry.message_id,
                        error = %e,
                        "replay failed for asynchronous entry without auto-retry, aborting cycle"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        message_id = %entry.message_id,
                        error = %e,
                        "failed to record replay outcome"
                    );
                }
            }
        }

        if !report.is_idle() {
            info!(
                pruned = report.pruned,
                expired = report.expired,
                replayed = report.replayed,
                failed = report.failed,
                acknowledged = report.acknowledged,
                rescheduled = report.rescheduled,
                "retry cycle complete"
            );
        }
        Ok(report)
    }

    /// Call [`run`](Self::run) every `interval` until `cancel` fires. Cycle
    /// errors are logged and the loop carries on.
    pub async fn run_until_cancelled(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run().await {
                        error!(error = %e, "retry cycle failed");
                    }
                }
            }
        }
    }

    async fn prune_acknowledged(&self) -> u64 {
        match self.store.delete_acknowledged().await {
            Ok(pruned) => {
                self.metrics.entries_pruned.inc_by(pruned);
                pruned
            }
            Err(e) => {
                warn!(error = %e, "failed to prune acknowledged entries");
                0
            }
        }
    }

    async fn sweep_expired(&self) -> usize {
        let entries = match self.store.obtain_expired_messages().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to list expired entries");
                return 0;
            }
        };

        let mut swept = 0;
        for entry in entries {
            match self.expire(&entry).await {
                Ok(()) => {
                    swept += 1;
                    self.metrics.entries_expired.inc();
                }
                Err(e) => warn!(
                    message_id = %entry.message_id,
                    error = %e,
                    "failed to sweep expired entry"
                ),
            }
        }
        swept
    }

    async fn expire(&self, entry: &RetryEntry) -> Result<(), RetryError> {
        self.dead_letters.deliver(&entry.message).await?;
        self.store.delete(&entry.message_id).await?;
        debug!(
            message_id = %entry.message_id,
            retries_to_date = entry.retries_to_date,
            "expired entry dead-lettered"
        );
        Ok(())
    }

    /// Rebuild the entry's logic and run one full lifecycle around a single
    /// application. `stop` and `close` run even when the application fails.
    async fn replay(&self, entry: &RetryEntry) -> Result<(), RetryError> {
        let logic = self.registry.unmarshal(&entry.logic)?;
        let mut message = entry.message.clone();

        logic.init().await?;
        let result = match logic.start().await {
            Ok(()) => {
                let applied = self.apply(logic.as_ref(), &mut message).await;
                if let Err(e) = logic.stop().await {
                    warn!(message_id = %entry.message_id, error = %e, "failed to stop replayed logic");
                }
                applied
            }
            Err(e) => Err(e),
        };
        if let Err(e) = logic.close().await {
            warn!(message_id = %entry.message_id, error = %e, "failed to close replayed logic");
        }
        result
    }

    async fn apply(
        &self,
        logic: &dyn RetryLogic,
        message: &mut RetryMessage,
    ) -> Result<(), RetryError> {
        match self.config.replay_timeout {
            None => logic.apply(message).await,
            Some(limit) => match tokio::time::timeout(limit, logic.apply(message)).await {
                Ok(result) => result,
                Err(elapsed) => Err(RetryError::Replay {
                    reason: format!("replay timed out after {limit:?}"),
                    source: Some(Box::new(elapsed)),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoratorConfig;
    use crate::dead_letter::MemoryDeadLetters;
    use crate::decorator::StoreForRetry;
    use crate::entry::Acknowledgment;
    use crate::logic::MarshalledLogic;
    use crate::message::{RetryMessage, ACKNOWLEDGMENT_KEY, RETRY_INTERVAL_KEY, TOTAL_RETRIES_KEY};
    use crate::storage::memory_retry::MemoryRetryStore;
    use crate::testing::{ReplayLedger, ScriptedLogic};
    use async_trait::async_trait;

    struct Fixture {
        store: Arc<MemoryRetryStore>,
        registry: Arc<LogicRegistry>,
        dead_letters: Arc<MemoryDeadLetters>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryRetryStore::new()),
                registry: Arc::new(LogicRegistry::new().with::<ScriptedLogic>()),
                dead_letters: Arc::new(MemoryDeadLetters::new()),
            }
        }

        fn driver(&self, config: DriverConfig) -> RetryDriver {
            RetryDriver::new(
                self.store.clone(),
                self.registry.clone(),
                self.dead_letters.clone(),
                config,
            )
            .unwrap()
        }

        /// Queue `message` as if `logic` had failed under `ack`.
        async fn queue(&self, logic: ScriptedLogic, ack: Acknowledgment, total: i32) -> String {
            let config = match ack {
                Acknowledgment::Synchronous => DecoratorConfig::default(),
                Acknowledgment::Asynchronous { auto_retry_on_fail } => DecoratorConfig {
                    asynchronous_acknowledgment: true,
                    async_auto_retry_on_fail: auto_retry_on_fail,
                    ..Default::default()
                },
            };
            let message = RetryMessage::new(b"work".to_vec())
                .with_metadata(RETRY_INTERVAL_KEY, "0")
                .with_metadata(TOTAL_RETRIES_KEY, total.to_string());
            let decorator =
                StoreForRetry::new(logic, self.store.clone(), self.registry.clone(), config)
                    .unwrap();
            let entry = decorator.entry_for(&message).unwrap();
            self.store.write(&entry).await.unwrap();
            entry.message_id
        }
    }

    #[tokio::test]
    async fn synchronous_success_acknowledges() {
        let fx = Fixture::new();
        let ledger = ReplayLedger::fresh();
        let id = fx
            .queue(
                ScriptedLogic::succeeding().recorded_in(&ledger),
                Acknowledgment::Synchronous,
                3,
            )
            .await;

        let report = fx.driver(DriverConfig::default()).run().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.acknowledged, 1);
        assert_eq!(
            ledger.events(),
            vec!["init", "start", "apply", "stop", "close"]
        );

        let entry = fx.store.get(&id).await.unwrap().unwrap();
        assert!(entry.acknowledged);
        assert_eq!(entry.retries_to_date, 0);
    }

    #[tokio::test]
    async fn acknowledged_entries_are_pruned_next_cycle() {
        let fx = Fixture::new();
        let id = fx
            .queue(ScriptedLogic::succeeding(), Acknowledgment::Synchronous, 3)
            .await;
        let driver = fx.driver(DriverConfig::default());
        driver.run().await.unwrap();

        let report = driver.run().await.unwrap();
        assert_eq!(report.pruned, 1);
        assert_eq!(report.replayed, 0);
        assert!(fx.store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn synchronous_failure_increments_and_continues() {
        let fx = Fixture::new();
        let failing = fx
            .queue(ScriptedLogic::failing(), Acknowledgment::Synchronous, 3)
            .await;
        let ok = fx
            .queue(ScriptedLogic::succeeding(), Acknowledgment::Synchronous, 3)
            .await;

        let report = fx.driver(DriverConfig::default()).run().await.unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.acknowledged, 1);

        assert_eq!(fx.store.get(&failing).await.unwrap().unwrap().retries_to_date, 1);
        assert!(fx.store.get(&ok).await.unwrap().unwrap().acknowledged);
    }

    #[tokio::test]
    async fn asynchronous_success_waits_for_acknowledgment() {
        let fx = Fixture::new();
        let id = fx
            .queue(
                ScriptedLogic::succeeding(),
                Acknowledgment::Asynchronous {
                    auto_retry_on_fail: true,
                },
                3,
            )
            .await;

        let report = fx.driver(DriverConfig::default()).run().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        let entry = fx.store.get(&id).await.unwrap().unwrap();
        assert!(!entry.acknowledged);
        assert_eq!(entry.retries_to_date, 1);
    }

    #[tokio::test]
    async fn asynchronous_auto_retry_failure_increments() {
        let fx = Fixture::new();
        let id = fx
            .queue(
                ScriptedLogic::failing(),
                Acknowledgment::Asynchronous {
                    auto_retry_on_fail: true,
                },
                3,
            )
            .await;

        fx.driver(DriverConfig::default()).run().await.unwrap();
        assert_eq!(fx.store.get(&id).await.unwrap().unwrap().retries_to_date, 1);
    }

    #[tokio::test]
    async fn asynchronous_without_auto_retry_failure_aborts_cycle() {
        let fx = Fixture::new();
        let id = fx
            .queue(
                ScriptedLogic::failing(),
                Acknowledgment::Asynchronous {
                    auto_retry_on_fail: false,
                },
                3,
            )
            .await;

        let err = fx.driver(DriverConfig::default()).run().await.unwrap_err();
        assert!(matches!(err, RetryError::Replay { .. }));
        let entry = fx.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.retries_to_date, 0);
        assert!(!entry.acknowledged);
    }

    #[tokio::test]
    async fn expired_entries_are_dead_lettered_when_enabled() {
        let fx = Fixture::new();
        let id = fx
            .queue(ScriptedLogic::failing(), Acknowledgment::Synchronous, 1)
            .await;
        let keep = DriverConfig::default();
        let sweep = DriverConfig {
            prune_expired: true,
            ..Default::default()
        };

        fx.driver(keep.clone()).run().await.unwrap();
        // Budget exhausted: no longer replayed, but kept without the sweep.
        let report = fx.driver(keep).run().await.unwrap();
        assert_eq!(report.replayed, 0);
        assert!(fx.store.get(&id).await.unwrap().is_some());

        let report = fx.driver(sweep).run().await.unwrap();
        assert_eq!(report.expired, 1);
        assert!(fx.store.get(&id).await.unwrap().is_none());
        let dead = fx.dead_letters.take();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].payload, b"work".to_vec());
    }

    #[tokio::test]
    async fn unknown_logic_type_counts_as_failure() {
        let fx = Fixture::new();
        let message = RetryMessage::with_id("m-unknown", b"work".to_vec());
        let entry = RetryEntry::new(
            message,
            MarshalledLogic {
                type_name: "gone.Logic".into(),
                body: vec![0xc0],
            },
            None,
            0,
            2,
        );
        fx.store.write(&entry).await.unwrap();

        let report = fx.driver(DriverConfig::default()).run().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            fx.store.get("m-unknown").await.unwrap().unwrap().retries_to_date,
            1
        );
    }

    #[tokio::test]
    async fn init_failure_skips_apply() {
        let fx = Fixture::new();
        let ledger = ReplayLedger::fresh();
        fx.queue(
            ScriptedLogic::succeeding()
                .failing_on_init()
                .recorded_in(&ledger),
            Acknowledgment::Synchronous,
            3,
        )
        .await;

        let report = fx.driver(DriverConfig::default()).run().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(ledger.events(), vec!["init"]);
    }

    #[tokio::test]
    async fn failed_apply_still_stops_and_closes() {
        let fx = Fixture::new();
        let ledger = ReplayLedger::fresh();
        fx.queue(
            ScriptedLogic::failing().recorded_in(&ledger),
            Acknowledgment::Synchronous,
            3,
        )
        .await;

        fx.driver(DriverConfig::default()).run().await.unwrap();
        assert_eq!(
            ledger.events(),
            vec!["init", "start", "apply", "stop", "close"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replay_timeout_counts_as_failure() {
        let fx = Fixture::new();
        let id = fx
            .queue(
                ScriptedLogic::succeeding().delayed(Duration::from_secs(60)),
                Acknowledgment::Synchronous,
                3,
            )
            .await;
        let config = DriverConfig {
            replay_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };

        let report = fx.driver(config).run().await.unwrap();
        assert_eq!(report.failed, 1);
        let entry = fx.store.get(&id).await.unwrap().unwrap();
        assert!(!entry.acknowledged);
        assert_eq!(entry.retries_to_date, 1);
    }

    #[tokio::test]
    async fn queued_entry_records_its_discipline() {
        let fx = Fixture::new();
        let id = fx
            .queue(ScriptedLogic::succeeding(), Acknowledgment::Synchronous, 3)
            .await;
        let entry = fx.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.message.metadata(ACKNOWLEDGMENT_KEY), Some("sync"));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_loop_stops_on_cancel() {
        let fx = Fixture::new();
        let id = fx
            .queue(ScriptedLogic::succeeding(), Acknowledgment::Synchronous, 3)
            .await;
        let driver = Arc::new(fx.driver(DriverConfig {
            prune_acknowledged: false,
            ..Default::default()
        }));
        let cancel = CancellationToken::new();

        let handle = {
            let driver = driver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                driver
                    .run_until_cancelled(Duration::from_millis(100), cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(fx.store.get(&id).await.unwrap().unwrap().acknowledged);
    }

    /// Memory store that fails selected operations.
    struct FlakyStore {
        inner: Arc<MemoryRetryStore>,
        fail_prune: bool,
        fail_update_for: Option<String>,
    }

    impl FlakyStore {
        fn over(inner: Arc<MemoryRetryStore>) -> Self {
            Self {
                inner,
                fail_prune: false,
                fail_update_for: None,
            }
        }

        fn unavailable(operation: &str) -> RetryError {
            RetryError::Store {
                reason: format!("{operation} failed: connection reset"),
                source: None,
            }
        }
    }

    #[async_trait]
    impl RetryStore for FlakyStore {
        async fn write(&self, entry: &RetryEntry) -> Result<(), RetryError> {
            self.inner.write(entry).await
        }

        async fn acknowledge(&self, acknowledge_id: &str) -> Result<bool, RetryError> {
            self.inner.acknowledge(acknowledge_id).await
        }

        async fn update_retry_count(&self, message_id: &str) -> Result<(), RetryError> {
            if self.fail_update_for.as_deref() == Some(message_id) {
                return Err(Self::unavailable("update retry count"));
            }
            self.inner.update_retry_count(message_id).await
        }

        async fn delete(&self, message_id: &str) -> Result<bool, RetryError> {
            self.inner.delete(message_id).await
        }

        async fn delete_acknowledged(&self) -> Result<u64, RetryError> {
            if self.fail_prune {
                return Err(Self::unavailable("delete acknowledged"));
            }
            self.inner.delete_acknowledged().await
        }

        async fn get(&self, message_id: &str) -> Result<Option<RetryEntry>, RetryError> {
            self.inner.get(message_id).await
        }

        async fn obtain_messages_to_retry(&self) -> Result<Vec<RetryEntry>, RetryError> {
            self.inner.obtain_messages_to_retry().await
        }

        async fn obtain_expired_messages(&self) -> Result<Vec<RetryEntry>, RetryError> {
            self.inner.obtain_expired_messages().await
        }
    }

    /// Dead-letter sink refusing one message id.
    struct RefusingSink {
        refuse: String,
        accepted: MemoryDeadLetters,
    }

    #[async_trait]
    impl DeadLetterSink for RefusingSink {
        async fn deliver(&self, message: &RetryMessage) -> Result<(), RetryError> {
            if message.id == self.refuse {
                return Err(RetryError::DeadLetter {
                    reason: format!("queue rejected {}", message.id),
                    source: None,
                });
            }
            self.accepted.deliver(message).await
        }
    }

    #[tokio::test]
    async fn prune_failure_does_not_fail_the_cycle() {
        let fx = Fixture::new();
        let done = fx
            .queue(ScriptedLogic::succeeding(), Acknowledgment::Synchronous, 3)
            .await;
        let pending = fx
            .queue(ScriptedLogic::failing(), Acknowledgment::Synchronous, 3)
            .await;
        fx.driver(DriverConfig::default()).run().await.unwrap();

        let store = FlakyStore {
            fail_prune: true,
            ..FlakyStore::over(fx.store.clone())
        };
        let driver = RetryDriver::new(
            Arc::new(store),
            fx.registry.clone(),
            fx.dead_letters.clone(),
            DriverConfig::default(),
        )
        .unwrap();

        let report = driver.run().await.unwrap();
        assert_eq!(report.pruned, 0);
        assert_eq!(report.replayed, 1);
        assert!(fx.store.get(&done).await.unwrap().unwrap().acknowledged);
        assert_eq!(
            fx.store.get(&pending).await.unwrap().unwrap().retries_to_date,
            2
        );
    }

    #[tokio::test]
    async fn refused_dead_letter_keeps_entry_and_sweeps_the_rest() {
        let fx = Fixture::new();
        let refused = fx
            .queue(ScriptedLogic::failing(), Acknowledgment::Synchronous, 0)
            .await;
        let swept = fx
            .queue(ScriptedLogic::failing(), Acknowledgment::Synchronous, 0)
            .await;
        let sink = Arc::new(RefusingSink {
            refuse: refused.clone(),
            accepted: MemoryDeadLetters::new(),
        });
        let driver = RetryDriver::new(
            fx.store.clone(),
            fx.registry.clone(),
            sink.clone(),
            DriverConfig {
                prune_expired: true,
                ..Default::default()
            },
        )
        .unwrap();

        let report = driver.run().await.unwrap();
        assert_eq!(report.expired, 1);
        assert!(fx.store.get(&refused).await.unwrap().is_some());
        assert!(fx.store.get(&swept).await.unwrap().is_none());
        let delivered: Vec<_> = sink.accepted.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(delivered, vec![swept]);
    }

    #[tokio::test]
    async fn settle_failure_on_one_entry_does_not_stop_the_others() {
        let fx = Fixture::new();
        let stuck = fx
            .queue(ScriptedLogic::failing(), Acknowledgment::Synchronous, 3)
            .await;
        let other = fx
            .queue(ScriptedLogic::failing(), Acknowledgment::Synchronous, 3)
            .await;
        let store = FlakyStore {
            fail_update_for: Some(stuck.clone()),
            ..FlakyStore::over(fx.store.clone())
        };
        let driver = RetryDriver::new(
            Arc::new(store),
            fx.registry.clone(),
            fx.dead_letters.clone(),
            DriverConfig::default(),
        )
        .unwrap();

        let report = driver.run().await.unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.rescheduled, 1);
        assert_eq!(fx.store.get(&stuck).await.unwrap().unwrap().retries_to_date, 0);
        assert_eq!(fx.store.get(&other).await.unwrap().unwrap().retries_to_date, 1);
    }
}

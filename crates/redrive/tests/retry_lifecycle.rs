use std::sync::Arc;

use redrive::acknowledge::AcknowledgeHandler;
use redrive::config::{DecoratorConfig, DriverConfig};
use redrive::dead_letter::MemoryDeadLetters;
use redrive::decorator::{Disposition, StoreForRetry};
use redrive::driver::RetryDriver;
use redrive::logic::LogicRegistry;
use redrive::message::{RetryMessage, ACKNOWLEDGE_ID_KEY, RETRY_INTERVAL_KEY};
use redrive::retry_store::RetryStore;
use redrive::storage::memory_retry::MemoryRetryStore;
use redrive::testing::{ReplayLedger, ScriptedLogic};

struct Harness {
    store: Arc<dyn RetryStore>,
    registry: Arc<LogicRegistry>,
    dead_letters: Arc<MemoryDeadLetters>,
}

impl Harness {
    fn new(store: Arc<dyn RetryStore>) -> Self {
        Self {
            store,
            registry: Arc::new(LogicRegistry::new().with::<ScriptedLogic>()),
            dead_letters: Arc::new(MemoryDeadLetters::new()),
        }
    }

    fn decorator(&self, logic: ScriptedLogic, config: DecoratorConfig) -> StoreForRetry<ScriptedLogic> {
        StoreForRetry::new(logic, self.store.clone(), self.registry.clone(), config).unwrap()
    }

    fn driver(&self) -> RetryDriver {
        RetryDriver::new(
            self.store.clone(),
            self.registry.clone(),
            self.dead_letters.clone(),
            DriverConfig {
                prune_expired: true,
                ..Default::default()
            },
        )
        .unwrap()
    }
}

fn immediate(payload: &str) -> RetryMessage {
    RetryMessage::new(payload.as_bytes().to_vec()).with_metadata(RETRY_INTERVAL_KEY, "0")
}

async fn failed_work_is_replayed_until_it_succeeds(store: Arc<dyn RetryStore>) {
    let harness = Harness::new(store);
    let ledger = ReplayLedger::fresh();
    let decorator = harness.decorator(
        ScriptedLogic::failing_first(2).recorded_in(&ledger),
        DecoratorConfig::default(),
    );

    let mut message = immediate("order-1");
    let disposition = decorator.execute(&mut message).await.unwrap();
    assert!(matches!(disposition, Disposition::Retrying { .. }));
    assert_eq!(ledger.attempts(), 1);

    let driver = harness.driver();
    let report = driver.run().await.unwrap();
    assert_eq!((report.failed, report.rescheduled), (1, 1));

    let report = driver.run().await.unwrap();
    assert_eq!(report.acknowledged, 1);
    assert_eq!(ledger.attempts(), 3);

    let report = driver.run().await.unwrap();
    assert_eq!(report.pruned, 1);
    assert!(harness.store.get(&message.id).await.unwrap().is_none());
    assert!(harness.dead_letters.messages().is_empty());
}

async fn confirmed_work_stops_replaying(store: Arc<dyn RetryStore>) {
    let harness = Harness::new(store);
    let ledger = ReplayLedger::fresh();
    let decorator = harness.decorator(
        ScriptedLogic::succeeding().recorded_in(&ledger),
        DecoratorConfig {
            asynchronous_acknowledgment: true,
            ..Default::default()
        },
    );

    let mut message = immediate("order-2").with_metadata(ACKNOWLEDGE_ID_KEY, "corr-2");
    let disposition = decorator.execute(&mut message).await.unwrap();
    assert_eq!(
        disposition,
        Disposition::AwaitingAcknowledgment {
            acknowledge_id: "corr-2".into()
        }
    );

    // No confirmation yet: the driver resends.
    let driver = harness.driver();
    driver.run().await.unwrap();
    assert_eq!(ledger.attempts(), 2);

    let confirmation = RetryMessage::new(Vec::new()).with_metadata(ACKNOWLEDGE_ID_KEY, "corr-2");
    let handler = AcknowledgeHandler::new(harness.store.clone());
    assert!(handler.handle_message(&confirmation).await.unwrap());

    let report = driver.run().await.unwrap();
    assert_eq!(report.pruned, 1);
    assert_eq!(report.replayed, 0);
    assert_eq!(ledger.attempts(), 2);
}

async fn exhausted_work_is_dead_lettered(store: Arc<dyn RetryStore>) {
    let harness = Harness::new(store);
    let decorator = harness.decorator(
        ScriptedLogic::failing(),
        DecoratorConfig {
            default_total_retries: 2,
            ..Default::default()
        },
    );

    let mut message = immediate("order-3");
    decorator.execute(&mut message).await.unwrap();

    let driver = harness.driver();
    for _ in 0..2 {
        let report = driver.run().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.expired, 0);
    }

    let report = driver.run().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.replayed, 0);

    let dead = harness.dead_letters.take();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, message.id);
    assert_eq!(dead[0].payload, b"order-3".to_vec());
    assert!(harness.store.get(&message.id).await.unwrap().is_none());
}

#[tokio::test]
async fn memory_failed_work_is_replayed_until_it_succeeds() {
    failed_work_is_replayed_until_it_succeeds(Arc::new(MemoryRetryStore::new())).await;
}

#[tokio::test]
async fn memory_confirmed_work_stops_replaying() {
    confirmed_work_stops_replaying(Arc::new(MemoryRetryStore::new())).await;
}

#[tokio::test]
async fn memory_exhausted_work_is_dead_lettered() {
    exhausted_work_is_dead_lettered(Arc::new(MemoryRetryStore::new())).await;
}

#[cfg(feature = "sql")]
mod sql {
    use super::*;
    use redrive::storage::dialect::SqlDialect;
    use redrive::storage::sql_retry::SqlRetryStore;

    async fn store() -> Arc<dyn RetryStore> {
        let store = SqlRetryStore::connect("sqlite::memory:", SqlDialect::sqlite())
            .await
            .unwrap();
        store.ensure_schema().await;
        Arc::new(store)
    }

    #[tokio::test]
    async fn sql_failed_work_is_replayed_until_it_succeeds() {
        failed_work_is_replayed_until_it_succeeds(store().await).await;
    }

    #[tokio::test]
    async fn sql_confirmed_work_stops_replaying() {
        confirmed_work_stops_replaying(store().await).await;
    }

    #[tokio::test]
    async fn sql_exhausted_work_is_dead_lettered() {
        exhausted_work_is_dead_lettered(store().await).await;
    }
}

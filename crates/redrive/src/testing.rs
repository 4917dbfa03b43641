//! Scripted business logic for unit and integration testing.
//!
//! Replayed logic is rebuilt from bytes, so a test cannot hold on to the
//! instance the driver runs. [`ScriptedLogic`] instead reports every lifecycle
//! call to a [`ReplayLedger`] identified by a label that survives marshalling.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::RetryError;
use crate::logic::{Replayable, RetryLogic};
use crate::message::RetryMessage;

fn ledgers() -> &'static DashMap<String, Vec<String>> {
    static LEDGERS: OnceLock<DashMap<String, Vec<String>>> = OnceLock::new();
    LEDGERS.get_or_init(DashMap::new)
}

/// Observable record of what scripted logic did, shared across reconstructions.
///
/// The events live only as long as this handle: dropping it removes them, and
/// logic still pointing at the label afterwards records nothing.
#[derive(Debug)]
pub struct ReplayLedger {
    label: String,
}

impl ReplayLedger {
    /// A ledger with a unique label, so parallel tests never share events.
    pub fn fresh() -> Self {
        let label = uuid::Uuid::new_v4().to_string();
        ledgers().insert(label.clone(), Vec::new());
        Self { label }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Lifecycle events in call order, e.g. `["init", "start", "apply", "stop", "close"]`.
    pub fn events(&self) -> Vec<String> {
        ledgers()
            .get(&self.label)
            .map(|events| events.value().clone())
            .unwrap_or_default()
    }

    /// Number of `apply` calls so far.
    pub fn attempts(&self) -> usize {
        self.events().iter().filter(|e| *e == "apply").count()
    }

    fn record(label: &str, event: &str) -> usize {
        match ledgers().get_mut(label) {
            Some(mut events) => {
                events.push(event.to_string());
                events.iter().filter(|e| *e == event).count()
            }
            None => 1,
        }
    }
}

impl Drop for ReplayLedger {
    fn drop(&mut self) {
        ledgers().remove(&self.label);
    }
}

/// Replayable logic whose outcome is fixed up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedLogic {
    /// Ledger label, if the test observes this logic.
    pub ledger: Option<String>,
    /// Number of leading `apply` attempts that fail. `u32::MAX` fails forever.
    pub fail_first: u32,
    pub fail_on_init: bool,
    /// Metadata key set to `"yes"` on every applied message.
    pub stamp: Option<String>,
    /// Time spent inside `apply` before it returns.
    pub delay_ms: u64,
}

impl ScriptedLogic {
    pub fn succeeding() -> Self {
        Self {
            ledger: None,
            fail_first: 0,
            fail_on_init: false,
            stamp: None,
            delay_ms: 0,
        }
    }

    pub fn failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    /// Fail the first `attempts` applications, then succeed. Counting needs a ledger.
    pub fn failing_first(attempts: u32) -> Self {
        Self {
            fail_first: attempts,
            ..Self::succeeding()
        }
    }

    pub fn recorded_in(mut self, ledger: &ReplayLedger) -> Self {
        self.ledger = Some(ledger.label.clone());
        self
    }

    pub fn stamping(mut self, key: impl Into<String>) -> Self {
        self.stamp = Some(key.into());
        self
    }

    pub fn failing_on_init(mut self) -> Self {
        self.fail_on_init = true;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    fn record(&self, event: &str) -> usize {
        match &self.ledger {
            Some(label) => ReplayLedger::record(label, event),
            None => 1,
        }
    }
}

#[async_trait]
impl RetryLogic for ScriptedLogic {
    async fn init(&self) -> Result<(), RetryError> {
        self.record("init");
        if self.fail_on_init {
            return Err(RetryError::replay("scripted init failure"));
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), RetryError> {
        self.record("start");
        Ok(())
    }

    async fn apply(&self, message: &mut RetryMessage) -> Result<(), RetryError> {
        let attempt = self.record("apply");
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if let Some(key) = &self.stamp {
            message.set_metadata(key.clone(), "yes");
        }
        if attempt as u64 <= u64::from(self.fail_first) {
            return Err(RetryError::replay(format!("scripted failure on attempt {attempt}")));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), RetryError> {
        self.record("stop");
        Ok(())
    }

    async fn close(&self) -> Result<(), RetryError> {
        self.record("close");
        Ok(())
    }
}

impl Replayable for ScriptedLogic {
    const TYPE_NAME: &'static str = "redrive.testing.ScriptedLogic";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_first_recovers() {
        let ledger = ReplayLedger::fresh();
        let logic = ScriptedLogic::failing_first(2).recorded_in(&ledger);
        let mut message = RetryMessage::new(Vec::new());
        assert!(logic.apply(&mut message).await.is_err());
        assert!(logic.apply(&mut message).await.is_err());
        assert!(logic.apply(&mut message).await.is_ok());
        assert_eq!(ledger.attempts(), 3);
    }

    #[tokio::test]
    async fn ledgers_are_isolated() {
        let a = ReplayLedger::fresh();
        let b = ReplayLedger::fresh();
        let mut message = RetryMessage::new(Vec::new());
        ScriptedLogic::succeeding()
            .recorded_in(&a)
            .apply(&mut message)
            .await
            .unwrap();
        assert_eq!(a.attempts(), 1);
        assert_eq!(b.attempts(), 0);
    }

    #[tokio::test]
    async fn dropped_ledger_releases_its_events() {
        let ledger = ReplayLedger::fresh();
        let label = ledger.label().to_string();
        let logic = ScriptedLogic::succeeding().recorded_in(&ledger);
        logic.apply(&mut RetryMessage::new(Vec::new())).await.unwrap();
        assert!(ledgers().contains_key(&label));

        drop(ledger);
        assert!(!ledgers().contains_key(&label));

        // Logic outliving its ledger keeps working without recreating it.
        logic.apply(&mut RetryMessage::new(Vec::new())).await.unwrap();
        assert!(!ledgers().contains_key(&label));
    }
}

//! Business logic that can be persisted alongside a message and replayed later.
//!
//! Logic is stored as a [`MarshalledLogic`]: a type name plus a MessagePack body.
//! Reconstruction goes through a [`LogicRegistry`], a closed set of factories
//! registered at startup. The registry is an explicit dependency handed to the
//! decorator and the driver; there is no process-wide marshaller.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RetryError;
use crate::message::RetryMessage;

/// A unit of business logic applied to a message.
///
/// The lifecycle hooks run around every standalone use of the logic: once for
/// the lifetime of a decorator, and once per replay attempt in the driver.
#[async_trait]
pub trait RetryLogic: Send + Sync {
    async fn init(&self) -> Result<(), RetryError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), RetryError> {
        Ok(())
    }

    /// Apply the logic to a message. Errors are usually [`RetryError::Replay`].
    async fn apply(&self, message: &mut RetryMessage) -> Result<(), RetryError>;

    async fn stop(&self) -> Result<(), RetryError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), RetryError> {
        Ok(())
    }
}

/// Logic that can be marshalled into a retry entry and rebuilt from it.
pub trait Replayable: RetryLogic + Serialize + DeserializeOwned + 'static {
    /// Stable identifier recorded with the marshalled body.
    const TYPE_NAME: &'static str;
}

/// Serialized business logic tagged with its type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarshalledLogic {
    pub type_name: String,
    pub body: Vec<u8>,
}

impl MarshalledLogic {
    pub fn encode<L: Replayable>(logic: &L) -> Result<Self, RetryError> {
        let body = rmp_serde::to_vec_named(logic).map_err(|e| {
            RetryError::marshalling(&format!("failed to marshal {}", L::TYPE_NAME), e)
        })?;
        Ok(Self {
            type_name: L::TYPE_NAME.to_string(),
            body,
        })
    }

    /// Decode into a concrete type, checking the recorded type name first.
    pub fn decode_as<L: Replayable>(&self) -> Result<L, RetryError> {
        if self.type_name != L::TYPE_NAME {
            return Err(RetryError::Marshalling {
                reason: format!(
                    "marshalled logic is {}, not {}",
                    self.type_name,
                    L::TYPE_NAME
                ),
                source: None,
            });
        }
        rmp_serde::from_slice(&self.body).map_err(|e| {
            RetryError::marshalling(&format!("failed to unmarshal {}", L::TYPE_NAME), e)
        })
    }

    /// Bytes stored in the `marshalled_logic` column.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RetryError> {
        rmp_serde::to_vec(self)
            .map_err(|e| RetryError::marshalling("failed to encode marshalled logic", e))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RetryError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| RetryError::marshalling("failed to decode marshalled logic", e))
    }
}

type Factory = fn(&[u8]) -> Result<Box<dyn RetryLogic>, RetryError>;

fn build<L: Replayable>(body: &[u8]) -> Result<Box<dyn RetryLogic>, RetryError> {
    let logic: L = rmp_serde::from_slice(body).map_err(|e| {
        RetryError::marshalling(&format!("failed to unmarshal {}", L::TYPE_NAME), e)
    })?;
    Ok(Box::new(logic))
}

/// Closed mapping from recorded type names to constructors.
#[derive(Default)]
pub struct LogicRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl LogicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replayable logic type. Registering the same type twice is harmless.
    pub fn register<L: Replayable>(&mut self) -> &mut Self {
        self.factories.insert(L::TYPE_NAME, build::<L>);
        self
    }

    pub fn with<L: Replayable>(mut self) -> Self {
        self.register::<L>();
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Marshal logic for persistence. Unregistered types are refused, since
    /// an entry carrying them could never be replayed.
    pub fn marshal<L: Replayable>(&self, logic: &L) -> Result<MarshalledLogic, RetryError> {
        if !self.contains(L::TYPE_NAME) {
            return Err(RetryError::validation(format!(
                "logic type {} is not registered for replay",
                L::TYPE_NAME
            )));
        }
        MarshalledLogic::encode(logic)
    }

    pub fn unmarshal(&self, logic: &MarshalledLogic) -> Result<Box<dyn RetryLogic>, RetryError> {
        let factory =
            self.factories
                .get(logic.type_name.as_str())
                .ok_or_else(|| RetryError::UnknownLogicType {
                    type_name: logic.type_name.clone(),
                })?;
        factory(&logic.body)
    }
}

impl fmt::Debug for LogicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("LogicRegistry").field("types", &names).finish()
    }
}

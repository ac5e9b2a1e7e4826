use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::InstanceError;
use crate::state::{GameState, Inventory};

/// Outcome of running one program against a live instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub reward: f64,
    pub state: GameState,
    pub response: String,
}

/// A live game instance. Not assumed to be reentrant: callers must never
/// have two operations in flight on the same instance.
pub trait GameInstance: Send {
    fn evaluate(&mut self, code: &str) -> Result<Evaluation, InstanceError>;

    /// Serialized entity layout, opaque to the search engine.
    fn export_state(&mut self) -> Result<String, InstanceError>;

    fn import_state(&mut self, entities: &str) -> Result<(), InstanceError>;

    fn get_inventory(&mut self) -> Result<Inventory, InstanceError>;

    fn set_inventory(&mut self, inventory: &Inventory) -> Result<(), InstanceError>;
}

impl<T: GameInstance + ?Sized> GameInstance for Box<T> {
    fn evaluate(&mut self, code: &str) -> Result<Evaluation, InstanceError> {
        (**self).evaluate(code)
    }

    fn export_state(&mut self) -> Result<String, InstanceError> {
        (**self).export_state()
    }

    fn import_state(&mut self, entities: &str) -> Result<(), InstanceError> {
        (**self).import_state(entities)
    }

    fn get_inventory(&mut self) -> Result<Inventory, InstanceError> {
        (**self).get_inventory()
    }

    fn set_inventory(&mut self, inventory: &Inventory) -> Result<(), InstanceError> {
        (**self).set_inventory(inventory)
    }
}

/// Reply envelope produced by the game's scripting layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScriptReply {
    Ok {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Error {
        message: String,
    },
}

/// Validate a raw scripting-layer reply and decode its payload.
///
/// Structured errors become [`InstanceError::Rejected`] tagged with
/// `operation`; anything that does not parse becomes
/// [`InstanceError::Malformed`].
pub fn decode_reply<T: DeserializeOwned>(
    operation: &'static str,
    raw: &str,
) -> Result<T, InstanceError> {
    let reply: ScriptReply = serde_json::from_str(raw.trim())
        .map_err(|err| InstanceError::Malformed(format!("{operation}: {err}")))?;
    match reply {
        ScriptReply::Ok { payload } => serde_json::from_value(payload)
            .map_err(|err| InstanceError::Malformed(format!("{operation} payload: {err}"))),
        ScriptReply::Error { message } => Err(InstanceError::Rejected { operation, message }),
    }
}

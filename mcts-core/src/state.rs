use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::instance::GameInstance;
use crate::program::now_unix_s;

/// Item name to count.
pub type Inventory = BTreeMap<String, i64>;

/// Immutable checkpoint of a game world: entity layout plus inventory.
///
/// `entities` is produced and consumed only by the game instance. This type
/// carries it around and never looks inside.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    entities: String,
    #[serde(default)]
    inventory: Inventory,
    #[serde(default)]
    timestamp: u64,
}

impl GameState {
    pub fn new(entities: impl Into<String>, inventory: Inventory) -> Self {
        Self {
            entities: entities.into(),
            inventory,
            timestamp: now_unix_s(),
        }
    }

    /// Capture the current state of `instance`.
    pub fn from_instance<I: GameInstance + ?Sized>(instance: &mut I) -> Result<Self, StateError> {
        let entities = instance.export_state().map_err(StateError::Export)?;
        let inventory = instance.get_inventory().map_err(StateError::ReadInventory)?;
        Ok(Self::new(entities, inventory))
    }

    /// Restore this state into `instance`. Any rejection is returned as an error.
    pub fn to_instance<I: GameInstance + ?Sized>(&self, instance: &mut I) -> Result<(), StateError> {
        instance
            .import_state(&self.entities)
            .map_err(StateError::Import)?;
        instance
            .set_inventory(&self.inventory)
            .map_err(StateError::WriteInventory)
    }

    pub fn entities(&self) -> &str {
        &self.entities
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Raw form stored in the `state_json` column.
    pub fn to_raw(&self) -> Result<String, StateError> {
        serde_json::to_string(self).map_err(|err| StateError::Encode(err.to_string()))
    }

    pub fn parse(raw: &str) -> Result<Self, StateError> {
        serde_json::from_str(raw).map_err(|err| StateError::Decode(err.to_string()))
    }
}

impl Default for GameState {
    fn default() -> Self {
        Self::new(String::new(), Inventory::new())
    }
}

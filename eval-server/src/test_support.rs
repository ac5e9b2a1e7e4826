use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use factory_mcts_core::{Evaluation, GameInstance, GameState, InstanceError, Inventory};

/// Scripted game instance: fixed reward per program, optional delay, and a
/// shared call log.
#[derive(Clone, Default)]
pub(crate) struct FakeInstance {
    rewards: HashMap<String, f64>,
    delays: HashMap<String, Duration>,
    failing: Vec<String>,
    refuse_import: bool,
    default_reward: f64,
    entities: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeInstance {
    pub(crate) fn with_reward(mut self, code: &str, reward: f64) -> Self {
        self.rewards.insert(code.to_string(), reward);
        self
    }

    pub(crate) fn with_default_reward(mut self, reward: f64) -> Self {
        self.default_reward = reward;
        self
    }

    pub(crate) fn refusing_import(mut self) -> Self {
        self.refuse_import = true;
        self
    }

    pub(crate) fn with_delay(mut self, code: &str, delay: Duration) -> Self {
        self.delays.insert(code.to_string(), delay);
        self
    }

    pub(crate) fn failing_on(mut self, code: &str) -> Self {
        self.failing.push(code.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl GameInstance for FakeInstance {
    fn evaluate(&mut self, code: &str) -> Result<Evaluation, InstanceError> {
        self.log.lock().unwrap().push(format!("evaluate:{code}"));
        if let Some(delay) = self.delays.get(code) {
            std::thread::sleep(*delay);
        }
        if self.failing.iter().any(|c| c == code) {
            return Err(InstanceError::Rejected {
                operation: "evaluate",
                message: "attempt to index a nil value".into(),
            });
        }
        self.entities = format!("after:{code}");
        Ok(Evaluation {
            reward: self.rewards.get(code).copied().unwrap_or(self.default_reward),
            state: GameState::new(self.entities.clone(), Inventory::new()),
            response: format!("ran {code}"),
        })
    }

    fn export_state(&mut self) -> Result<String, InstanceError> {
        Ok(self.entities.clone())
    }

    fn import_state(&mut self, entities: &str) -> Result<(), InstanceError> {
        self.log.lock().unwrap().push(format!("import:{entities}"));
        if self.refuse_import {
            return Err(InstanceError::Rejected {
                operation: "import_state",
                message: "blueprint did not fit".into(),
            });
        }
        self.entities = entities.to_string();
        Ok(())
    }

    fn get_inventory(&mut self) -> Result<Inventory, InstanceError> {
        Ok(Inventory::new())
    }

    fn set_inventory(&mut self, _: &Inventory) -> Result<(), InstanceError> {
        Ok(())
    }
}

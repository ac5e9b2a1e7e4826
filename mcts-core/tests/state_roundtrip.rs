use factory_mcts_core::{Evaluation, GameInstance, GameState, InstanceError, Inventory, StateError};

/// Minimal stand-in for a game server: an entity blob and an inventory.
#[derive(Default)]
struct Sandbox {
    entities: String,
    inventory: Inventory,
    refuse_import: bool,
}

impl GameInstance for Sandbox {
    fn evaluate(&mut self, code: &str) -> Result<Evaluation, InstanceError> {
        self.entities.push_str(code);
        *self.inventory.entry("iron-plate".into()).or_default() += 1;
        Ok(Evaluation {
            reward: 1.0,
            state: GameState::from_instance(self).map_err(|e| InstanceError::Transport(e.to_string()))?,
            response: String::new(),
        })
    }

    fn export_state(&mut self) -> Result<String, InstanceError> {
        Ok(self.entities.clone())
    }

    fn import_state(&mut self, entities: &str) -> Result<(), InstanceError> {
        if self.refuse_import {
            return Err(InstanceError::Rejected {
                operation: "import_state",
                message: "surface is not empty".into(),
            });
        }
        self.entities = entities.to_string();
        Ok(())
    }

    fn get_inventory(&mut self) -> Result<Inventory, InstanceError> {
        Ok(self.inventory.clone())
    }

    fn set_inventory(&mut self, inventory: &Inventory) -> Result<(), InstanceError> {
        self.inventory = inventory.clone();
        Ok(())
    }
}

fn inventory(items: &[(&str, i64)]) -> Inventory {
    items.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn capture_then_restore_reproduces_layout_and_inventory() {
    let mut a = Sandbox {
        entities: "eJyrVkrOz0nVUUpOLCpRsjI0MzXRUcrPS9W1MjQ1NTYyMTQxs6gFAFmJBkk=".into(),
        inventory: inventory(&[("stone-furnace", 3), ("coal", 40)]),
        ..Sandbox::default()
    };
    let captured = GameState::from_instance(&mut a).unwrap();

    // Mutating the source afterwards must not leak into the snapshot.
    a.evaluate("place_entity('burner-inserter')").unwrap();

    let mut b = Sandbox {
        inventory: inventory(&[("wood", 1)]),
        ..Sandbox::default()
    };
    captured.to_instance(&mut b).unwrap();

    assert_eq!(b.get_inventory().unwrap(), *captured.inventory());
    assert_eq!(b.export_state().unwrap(), captured.entities());
    assert_ne!(a.export_state().unwrap(), captured.entities());
}

#[test]
fn rejected_import_fails_loudly() {
    let state = GameState::new("blob", inventory(&[("coal", 1)]));
    let mut target = Sandbox {
        refuse_import: true,
        ..Sandbox::default()
    };
    let err = state.to_instance(&mut target).unwrap_err();
    assert!(matches!(err, StateError::Import(InstanceError::Rejected { .. })));
    assert!(target.inventory.is_empty(), "inventory must not be written after a failed import");
}

#[test]
fn boxed_instances_work_through_the_trait() {
    let mut boxed: Box<dyn GameInstance> = Box::new(Sandbox::default());
    let outcome = boxed.evaluate("craft_item('iron-gear-wheel')").unwrap();
    assert_eq!(outcome.state.inventory().get("iron-plate"), Some(&1));
    let snapshot = GameState::from_instance(&mut boxed).unwrap();
    assert_eq!(snapshot.entities(), "craft_item('iron-gear-wheel')");
}

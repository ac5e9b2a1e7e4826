use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::state::GameState;

pub type ProgramId = i64;

pub const DEFAULT_EXPLORATION_CONSTANT: f64 = 1.41;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Role-tagged message history that produced a program. Append-only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(prompt: impl Into<String>) -> Self {
        let mut conversation = Self::new();
        conversation.push(Message::new(Role::System, prompt));
        conversation
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A node of the program search tree.
///
/// `value` is a running sum: the program's own (possibly baseline-adjusted)
/// reward plus every reward backpropagated from its descendants. Divide by
/// `visits` for the mean.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: Option<ProgramId>,
    pub code: String,
    pub conversation: Conversation,
    pub value: f64,
    pub visits: u64,
    pub parent_id: Option<ProgramId>,
    pub state: Option<GameState>,
    pub raw_reward: Option<f64>,
    pub holdout_value: Option<f64>,
    pub response: Option<String>,
    pub version: i64,
    /// Number of ancestors between this program and its root.
    pub depth: u32,
    pub meta: serde_json::Value,
    pub achievements: serde_json::Value,
    pub created_at_unix_s: u64,
}

impl Program {
    pub fn new(code: impl Into<String>, conversation: Conversation, version: i64) -> Self {
        Self {
            id: None,
            code: code.into(),
            conversation,
            value: 0.0,
            visits: 0,
            parent_id: None,
            state: None,
            raw_reward: None,
            holdout_value: None,
            response: None,
            version,
            depth: 0,
            meta: serde_json::Value::Object(Default::default()),
            achievements: serde_json::Value::Object(Default::default()),
            created_at_unix_s: now_unix_s(),
        }
    }

    /// A fresh, unevaluated child of `parent` in the same version.
    pub fn child_of(parent: &Program, code: impl Into<String>, conversation: Conversation) -> Self {
        let mut child = Self::new(code, conversation, parent.version);
        child.parent_id = parent.id;
        child.depth = parent.depth + 1;
        child
    }

    pub fn is_evaluated(&self) -> bool {
        self.state.is_some()
    }

    pub fn mean_value(&self) -> Option<f64> {
        (self.visits > 0).then(|| self.value / self.visits as f64)
    }

    /// Upper confidence bound for trees. Unvisited programs score `+inf`.
    pub fn get_uct(&self, parent_visits: u64, exploration_constant: f64) -> f64 {
        if self.visits == 0 {
            return f64::INFINITY;
        }
        let visits = self.visits as f64;
        // ln(0) is undefined; a parent that was never visited contributes no exploration bonus.
        let parent_visits = parent_visits.max(1) as f64;
        self.value / visits + exploration_constant * (parent_visits.ln() / visits).sqrt()
    }
}

/// Seconds since the Unix epoch, `0` if the clock is before it.
pub fn now_unix_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visited(value: f64, visits: u64) -> Program {
        let mut program = Program::new("noop", Conversation::new(), 1);
        program.value = value;
        program.visits = visits;
        program
    }

    #[test]
    fn unvisited_program_beats_any_finite_score() {
        let fresh = visited(0.0, 0);
        let strong = visited(1.0e12, 1);
        assert!(fresh.get_uct(10, DEFAULT_EXPLORATION_CONSTANT).is_infinite());
        assert!(
            fresh.get_uct(10, DEFAULT_EXPLORATION_CONSTANT)
                > strong.get_uct(10, DEFAULT_EXPLORATION_CONSTANT)
        );
    }

    #[test]
    fn uct_matches_formula() {
        let program = visited(6.0, 3);
        let expected = 2.0 + 1.41 * ((20f64).ln() / 3.0).sqrt();
        assert!((program.get_uct(20, 1.41) - expected).abs() < 1e-12);
    }

    #[test]
    fn uct_is_monotonic_in_exploration_constant() {
        let program = visited(4.0, 2);
        for parent_visits in [1u64, 2, 5, 100] {
            let mut last = f64::NEG_INFINITY;
            for c in [0.0, 0.5, 1.0, 1.41, 3.0, 10.0] {
                let score = program.get_uct(parent_visits, c);
                assert!(score >= last, "c={c} parent_visits={parent_visits}");
                last = score;
            }
        }
    }

    #[test]
    fn zero_parent_visits_has_no_exploration_bonus() {
        let program = visited(3.0, 3);
        assert_eq!(program.get_uct(0, 1.41), 1.0);
    }

    #[test]
    fn child_inherits_version_and_depth() {
        let mut parent = Program::new("root", Conversation::with_system("sys"), 7);
        parent.id = Some(42);
        parent.depth = 2;
        let child = Program::child_of(&parent, "child", Conversation::new());
        assert_eq!(child.parent_id, Some(42));
        assert_eq!(child.version, 7);
        assert_eq!(child.depth, 3);
        assert!(child.id.is_none());
        assert!(!child.is_evaluated());
    }

    #[test]
    fn conversation_is_append_only_history() {
        let mut conversation = Conversation::with_system("build a drill");
        conversation.push(Message::new(Role::User, "inventory: 5 iron"));
        conversation.push(Message::new(Role::Assistant, "place_entity(...)"));
        let roles: Vec<Role> = conversation.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);

        let json = serde_json::to_string(&conversation).unwrap();
        assert!(json.contains("\"role\":\"assistant\""));
    }
}

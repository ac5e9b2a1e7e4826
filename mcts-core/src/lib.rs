//! Search-tree core for LLM-guided program search against a factory game.
//!
//! Everything here is synchronous and storage-agnostic: programs and their
//! UCT scores, an arena search tree, game-state checkpoints, the boundary to
//! live game instances, and the parent samplers.

pub mod error;
pub mod instance;
pub mod pathfinding;
pub mod program;
pub mod registry;
pub mod sampler;
pub mod state;
pub mod tree;

pub use error::{InstanceError, PathError, SampleError, StateError, TreeError};
pub use instance::{decode_reply, Evaluation, GameInstance, ScriptReply};
pub use program::{
    now_unix_s, Conversation, Message, Program, ProgramId, Role, DEFAULT_EXPLORATION_CONSTANT,
};
pub use registry::Vocabulary;
pub use sampler::{build_sampler, ParentSampler, ProgramSource, SamplerConfig, SamplerKind};
pub use state::{GameState, Inventory};
pub use tree::SearchTree;

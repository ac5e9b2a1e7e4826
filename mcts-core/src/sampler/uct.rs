use std::collections::HashSet;

use super::{eligible, ParentSampler, ProgramSource, SamplerConfig, SamplerKind};
use crate::error::SampleError;
use crate::program::Program;
use crate::tree::SearchTree;

/// Classic MCTS selection: rebuild the eligible tree and descend by UCT.
pub struct UctSampler {
    config: SamplerConfig,
}

impl UctSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self { config }
    }
}

impl ParentSampler for UctSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Uct
    }

    fn sample_parent(
        &self,
        source: &dyn ProgramSource,
        version: i64,
    ) -> Result<Option<Program>, SampleError> {
        let candidates = eligible(source, version, &self.config)?;
        let ids: HashSet<_> = candidates.iter().filter_map(|p| p.id).collect();
        // Programs whose parent fell outside the window become roots.
        let tree = SearchTree::from_programs(candidates.iter().cloned().map(|mut program| {
            if program.parent_id.is_some_and(|parent| !ids.contains(&parent)) {
                program.parent_id = None;
            }
            program
        }));
        let Some(selected) = tree
            .select_uct(self.config.exploration_constant)
            .and_then(|program| program.id)
        else {
            return Ok(None);
        };
        Ok(candidates.into_iter().find(|p| p.id == Some(selected)))
    }
}

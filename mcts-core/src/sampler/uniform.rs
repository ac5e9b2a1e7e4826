use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::Rng;

use super::{eligible, seeded_rng, ParentSampler, ProgramSource, SamplerConfig, SamplerKind};
use crate::error::SampleError;
use crate::program::Program;

/// Every eligible program is equally likely.
pub struct UniformSampler {
    config: SamplerConfig,
    rng: Mutex<StdRng>,
}

impl UniformSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let rng = Mutex::new(seeded_rng(config.seed));
        Self { config, rng }
    }
}

impl ParentSampler for UniformSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Uniform
    }

    fn sample_parent(
        &self,
        source: &dyn ProgramSource,
        version: i64,
    ) -> Result<Option<Program>, SampleError> {
        let mut candidates = eligible(source, version, &self.config)?;
        if candidates.is_empty() {
            return Ok(None);
        }
        let pick = {
            let mut rng = match self.rng.lock() {
                Ok(rng) => rng,
                Err(poisoned) => poisoned.into_inner(),
            };
            rng.gen_range(0..candidates.len())
        };
        Ok(Some(candidates.swap_remove(pick)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    #[test]
    fn reaches_every_candidate() {
        let tree = tree(vec![
            evaluated(1, None, "a", 0.0, 1),
            evaluated(2, Some(1), "b", 0.0, 1),
            evaluated(3, Some(1), "c", 0.0, 1),
        ]);
        let sampler = UniformSampler::new(SamplerConfig {
            seed: Some(7),
            ..SamplerConfig::default()
        });
        let mut seen = [false; 3];
        for _ in 0..200 {
            let id = sampler.sample_parent(&tree, 1).unwrap().unwrap().id.unwrap();
            seen[(id - 1) as usize] = true;
        }
        assert_eq!(seen, [true; 3]);
    }
}

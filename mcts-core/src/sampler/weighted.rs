use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::Rng;

use super::{eligible, seeded_rng, ParentSampler, ProgramSource, SamplerConfig, SamplerKind};
use crate::error::SampleError;
use crate::program::Program;

/// Softmax over mean value, scaled by `temperature`.
///
/// A temperature of zero or below degenerates to picking the best mean
/// (first-seen on ties).
pub struct WeightedRewardSampler {
    config: SamplerConfig,
    rng: Mutex<StdRng>,
}

impl WeightedRewardSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let rng = Mutex::new(seeded_rng(config.seed));
        Self { config, rng }
    }
}

/// Normalised softmax weights. Unvisited programs count as mean zero.
pub(crate) fn softmax_weights(programs: &[Program], temperature: f64) -> Vec<f64> {
    let means: Vec<f64> = programs
        .iter()
        .map(|p| p.mean_value().unwrap_or(0.0))
        .collect();
    let max = means.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = means
        .iter()
        .map(|mean| ((mean - max) / temperature).exp())
        .collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

impl ParentSampler for WeightedRewardSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::WeightedReward
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

        if self.config.temperature <= 0.0 {
            let mut best = 0;
            for (i, program) in candidates.iter().enumerate() {
                let mean = program.mean_value().unwrap_or(0.0);
                if mean > candidates[best].mean_value().unwrap_or(0.0) {
                    best = i;
                }
            }
            return Ok(Some(candidates.swap_remove(best)));
        }

        let weights = softmax_weights(&candidates, self.config.temperature);
        let draw: f64 = {
            let mut rng = match self.rng.lock() {
                Ok(rng) => rng,
                Err(poisoned) => poisoned.into_inner(),
            };
            rng.gen()
        };
        let mut cumulative = 0.0;
        let mut pick = candidates.len() - 1;
        for (i, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if draw < cumulative {
                pick = i;
                break;
            }
        }
        Ok(Some(candidates.swap_remove(pick)))
    }
}

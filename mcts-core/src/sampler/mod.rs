//! Parent selection policies.
//!
//! A sampler looks at the evaluated programs of one search version and
//! returns the one to expand next. Samplers never mutate the tree; they are
//! interchangeable behind [`ParentSampler`] and chosen by [`SamplerKind`].

mod diversity;
mod uct;
mod uniform;
mod weighted;

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SampleError;
use crate::program::{Program, ProgramId, DEFAULT_EXPLORATION_CONSTANT};

pub use diversity::{kmeans, DiversitySampler, NgramEncoder, TraceEncoder};
pub use uct::UctSampler;
pub use uniform::UniformSampler;
pub use weighted::WeightedRewardSampler;

/// Where samplers read programs from.
pub trait ProgramSource {
    /// Evaluated programs of `version`, oldest first.
    fn candidates(&self, version: i64) -> Result<Vec<Program>, String>;

    /// `id` and up to `max_depth` of its ancestors, root-most first.
    fn lineage(&self, id: ProgramId, max_depth: usize) -> Result<Vec<Program>, String>;
}

pub trait ParentSampler: Send + Sync {
    fn kind(&self) -> SamplerKind;

    /// `Ok(None)` when the version has no eligible candidate.
    fn sample_parent(
        &self,
        source: &dyn ProgramSource,
        version: i64,
    ) -> Result<Option<Program>, SampleError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Uniform,
    #[default]
    WeightedReward,
    Uct,
    Diversity,
}

impl SamplerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::WeightedReward => "weighted_reward",
            Self::Uct => "uct",
            Self::Diversity => "diversity",
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uniform" => Ok(Self::Uniform),
            "weighted_reward" | "weighted" => Ok(Self::WeightedReward),
            "uct" => Ok(Self::Uct),
            "diversity" | "kld" => Ok(Self::Diversity),
            other => Err(format!("unknown sampler: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Programs at this depth or deeper are never chosen as parents.
    pub maximum_lookback: u32,
    /// Only the most recent `window_size` candidates are considered.
    pub window_size: Option<usize>,
    pub temperature: f64,
    pub exploration_constant: f64,
    pub clusters: usize,
    pub ngram: usize,
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            maximum_lookback: 20,
            window_size: Some(300),
            temperature: 1.0,
            exploration_constant: DEFAULT_EXPLORATION_CONSTANT,
            clusters: 5,
            ngram: 2,
            seed: None,
        }
    }
}

pub fn build_sampler(kind: SamplerKind, config: &SamplerConfig) -> Box<dyn ParentSampler> {
    match kind {
        SamplerKind::Uniform => Box::new(UniformSampler::new(config.clone())),
        SamplerKind::WeightedReward => Box::new(WeightedRewardSampler::new(config.clone())),
        SamplerKind::Uct => Box::new(UctSampler::new(config.clone())),
        SamplerKind::Diversity => Box::new(DiversitySampler::new(
            config.clone(),
            Box::new(NgramEncoder::new(config.ngram)),
        )),
    }
}

/// Candidates a sampler may pick from, oldest first.
pub(crate) fn eligible(
    source: &dyn ProgramSource,
    version: i64,
    config: &SamplerConfig,
) -> Result<Vec<Program>, SampleError> {
    let mut candidates: Vec<Program> = source
        .candidates(version)
        .map_err(SampleError::Source)?
        .into_iter()
        .filter(|p| p.version == version && p.is_evaluated() && p.depth < config.maximum_lookback)
        .collect();
    if let Some(window) = config.window_size {
        if candidates.len() > window {
            candidates.drain(..candidates.len() - window);
        }
    }
    Ok(candidates)
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> rand::rngs::StdRng {
    use rand::SeedableRng;
    match seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn sampler_kind_parses_aliases() {
        assert_eq!("weighted".parse::<SamplerKind>(), Ok(SamplerKind::WeightedReward));
        assert_eq!("KLD".parse::<SamplerKind>(), Ok(SamplerKind::Diversity));
        assert_eq!(" uct ".parse::<SamplerKind>(), Ok(SamplerKind::Uct));
        assert!("beam".parse::<SamplerKind>().is_err());
        assert_eq!(SamplerKind::WeightedReward.to_string(), "weighted_reward");
    }

    #[test]
    fn eligibility_applies_lookback_and_window() {
        let tree = tree(vec![
            evaluated(1, None, "a", 1.0, 1),
            evaluated(2, Some(1), "b", 1.0, 1),
            evaluated(3, Some(2), "c", 1.0, 1),
            evaluated(4, Some(1), "d", 1.0, 1),
        ]);
        let config = SamplerConfig {
            maximum_lookback: 2,
            window_size: None,
            ..SamplerConfig::default()
        };
        let ids: Vec<_> = eligible(&tree, 1, &config)
            .unwrap()
            .into_iter()
            .filter_map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 4]);

        let config = SamplerConfig {
            window_size: Some(2),
            ..config
        };
        let ids: Vec<_> = eligible(&tree, 1, &config)
            .unwrap()
            .into_iter()
            .filter_map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn every_kind_returns_none_for_an_empty_version() {
        let tree = tree(vec![evaluated(1, None, "a", 1.0, 1)]);
        for kind in [
            SamplerKind::Uniform,
            SamplerKind::WeightedReward,
            SamplerKind::Uct,
            SamplerKind::Diversity,
        ] {
            let sampler = build_sampler(kind, &SamplerConfig::default());
            assert_eq!(sampler.kind(), kind);
            assert!(sampler.sample_parent(&tree, 99).unwrap().is_none(), "{kind}");
        }
    }

    #[test]
    fn source_failure_is_an_error_not_none() {
        struct Broken;
        impl ProgramSource for Broken {
            fn candidates(&self, _: i64) -> Result<Vec<Program>, String> {
                Err("database is locked".into())
            }
            fn lineage(&self, _: ProgramId, _: usize) -> Result<Vec<Program>, String> {
                Ok(Vec::new())
            }
        }
        let sampler = build_sampler(SamplerKind::Uniform, &SamplerConfig::default());
        assert_eq!(
            sampler.sample_parent(&Broken, 1),
            Err(SampleError::Source("database is locked".into()))
        );
    }
}

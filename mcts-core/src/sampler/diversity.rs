use std::collections::BTreeMap;

use rayon::prelude::*;

use super::{eligible, ParentSampler, ProgramSource, SamplerConfig, SamplerKind};
use crate::error::SampleError;
use crate::program::Program;
use crate::registry::Vocabulary;

const KMEANS_MAX_ITERATIONS: usize = 25;

/// Turns program traces into fixed-width vectors for clustering.
///
/// Every vector returned by one call must have the same length.
pub trait TraceEncoder: Send + Sync {
    fn encode(&self, traces: &[&str]) -> Result<Vec<Vec<f64>>, String>;
}

/// Bag of token n-grams, L2-normalised, indexed through a shared [`Vocabulary`].
///
/// Vectors only span the n-grams present in the traces of one call, so their
/// width does not grow with the vocabulary's history.
pub struct NgramEncoder {
    n: usize,
    vocabulary: Vocabulary,
}

impl NgramEncoder {
    pub fn new(n: usize) -> Self {
        Self::with_vocabulary(n, Vocabulary::new())
    }

    pub fn with_vocabulary(n: usize, vocabulary: Vocabulary) -> Self {
        Self {
            n: n.max(1),
            vocabulary,
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    fn ngrams(&self, trace: &str) -> Vec<String> {
        let tokens: Vec<&str> = trace
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.len() < self.n {
            return if tokens.is_empty() {
                Vec::new()
            } else {
                vec![tokens.join(" ")]
            };
        }
        tokens.windows(self.n).map(|w| w.join(" ")).collect()
    }
}

impl TraceEncoder for NgramEncoder {
    fn encode(&self, traces: &[&str]) -> Result<Vec<Vec<f64>>, String> {
        let grams: Vec<Vec<String>> = traces.par_iter().map(|t| self.ngrams(t)).collect();

        // Registration stays sequential so ids follow trace order.
        let ids: Vec<Vec<usize>> = grams
            .iter()
            .map(|g| g.iter().map(|gram| self.vocabulary.intern(gram)).collect())
            .collect();

        // Columns follow vocabulary order, restricted to this batch.
        let mut columns: BTreeMap<usize, usize> =
            ids.iter().flatten().map(|&id| (id, 0)).collect();
        for (column, slot) in columns.values_mut().enumerate() {
            *slot = column;
        }
        let dims = columns.len();

        Ok(ids
            .par_iter()
            .map(|ids| {
                let mut vector = vec![0.0; dims];
                for id in ids {
                    if let Some(&column) = columns.get(id) {
                        vector[column] += 1.0;
                    }
                }
                let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
                if norm > 0.0 {
                    vector.iter_mut().for_each(|x| *x /= norm);
                }
                vector
            })
            .collect())
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let distance = squared_distance(point, centroid);
        if distance < best_distance {
            best = i;
            best_distance = distance;
        }
    }
    best
}

/// Deterministic k-means: farthest-point seeding from the first point, then
/// Lloyd iterations until assignments settle. Returns a cluster per point.
pub fn kmeans(points: &[Vec<f64>], k: usize) -> Vec<usize> {
    if points.is_empty() {
        return Vec::new();
    }
    let k = k.clamp(1, points.len());

    let mut centroids = vec![points[0].clone()];
    while centroids.len() < k {
        let mut far = 0;
        let mut far_distance = -1.0;
        for (i, point) in points.iter().enumerate() {
            let distance = squared_distance(point, &centroids[nearest(point, &centroids)]);
            if distance > far_distance {
                far = i;
                far_distance = distance;
            }
        }
        centroids.push(points[far].clone());
    }

    let mut assignment: Vec<usize> = points.iter().map(|p| nearest(p, &centroids)).collect();
    for _ in 0..KMEANS_MAX_ITERATIONS {
        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f64>> = points
                .iter()
                .zip(&assignment)
                .filter(|(_, a)| **a == c)
                .map(|(p, _)| p)
                .collect();
            // An empty cluster keeps its previous centroid.
            if members.is_empty() {
                continue;
            }
            for (d, slot) in centroid.iter_mut().enumerate() {
                *slot = members.iter().map(|m| m[d]).sum::<f64>() / members.len() as f64;
            }
        }
        let next: Vec<usize> = points.iter().map(|p| nearest(p, &centroids)).collect();
        if next == assignment {
            break;
        }
        assignment = next;
    }
    assignment
}

/// Clusters recent traces and expands the least-visited cluster, so the
/// search does not collapse onto a single strategy.
pub struct DiversitySampler {
    config: SamplerConfig,
    encoder: Box<dyn TraceEncoder>,
}

impl DiversitySampler {
    pub fn new(config: SamplerConfig, encoder: Box<dyn TraceEncoder>) -> Self {
        Self { config, encoder }
    }
}

impl ParentSampler for DiversitySampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Diversity
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

        let traces: Vec<&str> = candidates.iter().map(|p| p.code.as_str()).collect();
        let vectors = self.encoder.encode(&traces).map_err(SampleError::Encoder)?;
        if vectors.len() != candidates.len() {
            return Err(SampleError::Encoder(format!(
                "encoder returned {} vectors for {} traces",
                vectors.len(),
                candidates.len()
            )));
        }
        let assignment = kmeans(&vectors, self.config.clusters);

        let clusters = assignment.iter().copied().max().unwrap_or(0) + 1;
        let mut visits = vec![0u64; clusters];
        let mut sizes = vec![0usize; clusters];
        for (program, &cluster) in candidates.iter().zip(&assignment) {
            visits[cluster] += program.visits;
            sizes[cluster] += 1;
        }
        let mut target = None;
        let mut target_load = f64::INFINITY;
        for cluster in 0..clusters {
            if sizes[cluster] == 0 {
                continue;
            }
            let load = visits[cluster] as f64 / sizes[cluster] as f64;
            if load < target_load {
                target = Some(cluster);
                target_load = load;
            }
        }
        let Some(target) = target else {
            return Ok(None);
        };

        let mut best: Option<(usize, f64)> = None;
        for (i, (program, &cluster)) in candidates.iter().zip(&assignment).enumerate() {
            if cluster != target {
                continue;
            }
            let mean = program.mean_value().unwrap_or(0.0);
            if best.map_or(true, |(_, top)| mean > top) {
                best = Some((i, mean));
            }
        }
        Ok(best.map(|(i, _)| candidates.swap_remove(i)))
    }
}

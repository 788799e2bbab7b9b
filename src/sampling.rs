//! Next-token selection: greedy, temperature, top-k and top-p.

use ndarray::ArrayView1;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::args::TextGenerationArgs;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingParams {
    pub greedy: bool,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { greedy: false, temperature: 1.0, top_k: 0, top_p: 0.0 }
    }
}

impl From<&TextGenerationArgs> for SamplingParams {
    fn from(args: &TextGenerationArgs) -> Self {
        Self {
            greedy: args.greedy,
            temperature: args.temperature,
            top_k: args.top_k,
            top_p: args.top_p,
        }
    }
}

/// Set filtered logits to -inf.
///
/// `top_k > 0` keeps every logit at least as large as the k-th largest.
/// `top_p > 0` keeps the smallest prefix of the descending order whose
/// cumulative probability exceeds `top_p`; the most likely token always
/// survives.
pub fn top_k_logits(logits: &mut [f32], top_k: usize, top_p: f32) {
    if top_k > 0 && top_k < logits.len() {
        let mut sorted = logits.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let threshold = sorted[top_k - 1];
        for l in logits.iter_mut() {
            if *l < threshold {
                *l = f32::NEG_INFINITY;
            }
        }
    }

    if top_p > 0.0 {
        let mut order: Vec<usize> = (0..logits.len()).collect();
        order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
        let probs = softmax(&order.iter().map(|&i| logits[i]).collect::<Vec<_>>());

        let mut cumulative = 0.0;
        let mut remove = Vec::new();
        for (rank, (&idx, p)) in order.iter().zip(&probs).enumerate() {
            // shifted right by one: a token is dropped once the mass before
            // it already exceeds top_p
            if rank > 0 && cumulative > top_p {
                remove.push(idx);
            }
            cumulative += p;
        }
        for idx in remove {
            logits[idx] = f32::NEG_INFINITY;
        }
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Seeded sampler. Only ids below `vocab_limit` are ever produced, so the
/// dummy rows of a padded vocabulary cannot be sampled.
pub struct Sampler {
    params: SamplingParams,
    vocab_limit: usize,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: SamplingParams, vocab_limit: usize, seed: u64) -> Self {
        Self { params, vocab_limit, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    pub fn sample(&mut self, logits: ArrayView1<'_, f32>) -> usize {
        let limit = self.vocab_limit.min(logits.len());
        let mut logits: Vec<f32> = logits.iter().take(limit).cloned().collect();

        if self.params.greedy {
            return argmax(&logits);
        }

        for l in logits.iter_mut() {
            *l /= self.params.temperature;
        }
        top_k_logits(&mut logits, self.params.top_k, self.params.top_p);
        let probs = softmax(&logits);
        match WeightedIndex::new(&probs) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(e) => {
                tracing::warn!("degenerate distribution ({e}), falling back to argmax");
                argmax(&logits)
            }
        }
    }
}

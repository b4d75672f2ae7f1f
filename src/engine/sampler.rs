//! Token sampling.
//!
//! Each request carries its own seeded RNG so identical submissions
//! decode identically regardless of what else is in the batch.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SamplingParams;
use crate::error::{Error, Result};

/// Per-request sampler: greedy at temperature zero, otherwise
/// temperature-scaled sampling with optional top-k and top-p filtering.
#[derive(Debug)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample the next token from a `[vocab]` logits tensor.
    pub fn sample(&mut self, logits: &Tensor, params: &SamplingParams) -> Result<u32> {
        let logits: Vec<f32> = logits.to_vec1()?;
        if logits.is_empty() {
            return Err(Error::Runner("empty logits".to_string()));
        }
        if params.temperature == 0.0 {
            return Ok(argmax(&logits));
        }

        let scaled: Vec<f32> = logits.iter().map(|&l| l / params.temperature).collect();
        let mut probs = softmax(&scaled);
        if params.top_k > 0 {
            apply_top_k(&mut probs, params.top_k);
        }
        if params.top_p < 1.0 {
            apply_top_p(&mut probs, params.top_p);
        }

        let total: f32 = probs.iter().sum();
        if total <= 0.0 {
            return Ok(argmax(&logits));
        }
        let mut threshold = self.rng.gen::<f32>() * total;
        for (token, &p) in probs.iter().enumerate() {
            threshold -= p;
            if threshold <= 0.0 {
                return Ok(token as u32);
            }
        }
        Ok((probs.len() - 1) as u32)
    }
}

fn argmax(values: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best as u32
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// Zero out everything outside the k most probable tokens.
fn apply_top_k(probs: &mut [f32], k: usize) {
    if k >= probs.len() {
        return;
    }
    let mut indexed: Vec<usize> = (0..probs.len()).collect();
    indexed.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));
    for &i in &indexed[k..] {
        probs[i] = 0.0;
    }
}

/// Zero out the tail of the distribution past cumulative mass `p`.
fn apply_top_p(probs: &mut [f32], p: f32) {
    let mut indexed: Vec<usize> = (0..probs.len()).collect();
    indexed.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));
    let mut cumulative = 0.0;
    let mut cutoff = indexed.len();
    for (rank, &i) in indexed.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= p {
            cutoff = rank + 1;
            break;
        }
    }
    for &i in &indexed[cutoff..] {
        probs[i] = 0.0;
    }
}

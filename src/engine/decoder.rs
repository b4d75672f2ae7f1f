//! Decoding: logits to next tokens, beam search, and stop detection.
//!
//! Beam search keeps a cumulative log-probability score per beam. Each
//! step every beam proposes its top candidates; candidates are ranked by
//! (score desc, parent beam asc, token asc) so decoding is deterministic,
//! and the surviving beams re-base their token history and block tables
//! on their parents through cache forks.

use candle_core::Tensor;
use candle_nn::ops::log_softmax;

use crate::config::SamplingParams;
use crate::core::cache::CacheManager;
use crate::core::request::Request;
use crate::core::sequence::{FinishReason, Sequence, SequenceId};
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};

/// The decoder's verdict for one request after one step.
#[derive(Debug, Clone)]
pub struct StepDecision {
    /// The token each beam produced this step, in beam rank order.
    pub step_tokens: Vec<u32>,
    pub finish: Option<FinishReason>,
}

/// Per-request decoding state, alive from admission to terminal state.
#[derive(Debug)]
pub struct DecodeState {
    params: SamplingParams,
    max_output_len: usize,
    max_seq_len: usize,
    sampler: Sampler,
    /// Cumulative log-probability per beam; empty before the first token.
    scores: Vec<f32>,
}

impl DecodeState {
    pub fn new(request: &Request, max_seq_len: usize) -> Self {
        Self {
            params: request.sampling.clone(),
            max_output_len: request.max_output_len,
            max_seq_len,
            sampler: Sampler::new(request.sampling.seed),
            scores: Vec::new(),
        }
    }

    pub fn beam_scores(&self) -> &[f32] {
        &self.scores
    }

    /// Consume one step's per-beam logits, append the chosen token to
    /// every beam, and report termination. `logits` is aligned with
    /// `sequences`; forked beams draw fresh ids from `next_seq_id`.
    pub fn decode_step(
        &mut self,
        sequences: &mut Vec<Sequence>,
        cache: &mut CacheManager,
        logits: &[Tensor],
        next_seq_id: &mut SequenceId,
    ) -> Result<StepDecision> {
        if logits.len() != sequences.len() {
            return Err(Error::Runner(format!(
                "expected logits for {} beams, got {}",
                sequences.len(),
                logits.len()
            )));
        }

        let step_tokens = if self.params.beam_width == 1 {
            let token = self.sampler.sample(&logits[0], &self.params)?;
            sequences[0].append_token(token);
            vec![token]
        } else if self.scores.is_empty() {
            self.expand_beams(sequences, cache, &logits[0], next_seq_id)?
        } else {
            self.rerank_beams(sequences, cache, logits, next_seq_id)?
        };

        Ok(StepDecision {
            finish: self.check_finish(sequences),
            step_tokens,
        })
    }

    /// First generation step of a beam request: split the single context
    /// sequence into `beam_width` beams, one per top-scoring first token.
    /// A vocabulary smaller than the requested width caps the beam count
    /// at the number of distinct first tokens.
    fn expand_beams(
        &mut self,
        sequences: &mut Vec<Sequence>,
        cache: &mut CacheManager,
        logits: &Tensor,
        next_seq_id: &mut SequenceId,
    ) -> Result<Vec<u32>> {
        let log_probs = to_log_probs(logits)?;
        let width = self.params.beam_width.min(log_probs.len());
        let candidates = top_candidates(&log_probs, 0.0, 0, width);

        // Fork before the parent's history diverges
        for _ in 1..width {
            let mut child = Sequence::fork_from(&sequences[0], *next_seq_id);
            *next_seq_id += 1;
            *child.block_table_mut() = cache.fork(&sequences[0]);
            sequences.push(child);
        }

        let mut step_tokens = Vec::with_capacity(width);
        self.scores.clear();
        for (beam, candidate) in candidates.iter().enumerate() {
            sequences[beam].append_token(candidate.token);
            step_tokens.push(candidate.token);
            self.scores.push(candidate.score);
        }
        Ok(step_tokens)
    }

    /// Standard beam search step: rank all (parent, token) continuations
    /// and rebuild the beam set from the winners. The beam count stays at
    /// whatever expansion established.
    fn rerank_beams(
        &mut self,
        sequences: &mut Vec<Sequence>,
        cache: &mut CacheManager,
        logits: &[Tensor],
        next_seq_id: &mut SequenceId,
    ) -> Result<Vec<u32>> {
        let width = sequences.len();
        let mut candidates = Vec::with_capacity(width * width);
        for (parent, beam_logits) in logits.iter().enumerate() {
            let log_probs = to_log_probs(beam_logits)?;
            candidates.extend(top_candidates(&log_probs, self.scores[parent], parent, width));
        }
        candidates.sort_by(Candidate::ranking);
        candidates.truncate(width);

        let mut new_sequences = Vec::with_capacity(width);
        let mut step_tokens = Vec::with_capacity(width);
        self.scores.clear();
        for candidate in &candidates {
            let parent = &sequences[candidate.parent];
            let mut child = Sequence::fork_from(parent, *next_seq_id);
            *next_seq_id += 1;
            *child.block_table_mut() = cache.fork(parent);
            child.append_token(candidate.token);
            step_tokens.push(candidate.token);
            self.scores.push(candidate.score);
            new_sequences.push(child);
        }
        for old in sequences.iter_mut() {
            cache.release(old);
        }
        *sequences = new_sequences;
        Ok(step_tokens)
    }

    fn check_finish(&self, sequences: &[Sequence]) -> Option<FinishReason> {
        if !self.params.stop_token_ids.is_empty() {
            let all_stopped = sequences.iter().all(|s| {
                s.output_token_ids()
                    .last()
                    .map(|t| self.params.stop_token_ids.contains(t))
                    .unwrap_or(false)
            });
            if all_stopped {
                return Some(FinishReason::StopToken);
            }
        }
        if sequences[0].output_len() >= self.max_output_len {
            return Some(FinishReason::MaxOutputLength);
        }
        if sequences.iter().any(|s| s.total_len() >= self.max_seq_len) {
            return Some(FinishReason::LengthBudget);
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    parent: usize,
    token: u32,
}

impl Candidate {
    /// (score desc, parent asc, token asc); deterministic for fixed input.
    fn ranking(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.parent.cmp(&b.parent))
            .then(a.token.cmp(&b.token))
    }
}

fn to_log_probs(logits: &Tensor) -> Result<Vec<f32>> {
    Ok(log_softmax(logits, 0)?.to_vec1()?)
}

/// A beam's `width` best continuations given its cumulative score.
fn top_candidates(log_probs: &[f32], base_score: f32, parent: usize, width: usize) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = log_probs
        .iter()
        .enumerate()
        .map(|(token, &lp)| Candidate {
            score: base_score + lp,
            parent,
            token: token as u32,
        })
        .collect();
    candidates.sort_by(Candidate::ranking);
    candidates.truncate(width);
    candidates
}

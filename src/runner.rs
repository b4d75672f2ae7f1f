//! Model runner boundary.
//!
//! The executor consumes the compute layer through a single trait: given
//! a batch descriptor (per slot: phase, token range, physical block
//! references, pending block copies) the runner produces next-step logits
//! and any requested named auxiliary tensors. Kernels, weights, and
//! devices live entirely behind this seam.

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::core::block::BlockId;
use crate::core::cache::BlockCopy;
use crate::core::request::RequestId;
use crate::core::sequence::SequenceId;
use crate::error::Result;

/// Execution phase of a batch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Processing prompt (or recomputed history) tokens; the final
    /// position's logits produce the next token.
    Context,
    /// Steady-state decoding, one new token per beam.
    Generation,
}

/// One sequence's binding to the current model invocation.
#[derive(Debug, Clone)]
pub struct SlotDescriptor {
    pub request_id: RequestId,
    pub seq_id: SequenceId,
    pub phase: Phase,
    /// Token ids fed to the model this step.
    pub token_ids: Vec<u32>,
    /// Position of `token_ids[0]` in the sequence.
    pub start_pos: usize,
    /// Physical cache slot for each fed token position.
    pub slot_mapping: Vec<usize>,
    /// All physical blocks backing the sequence, in logical order.
    pub block_ids: Vec<BlockId>,
    /// Auxiliary tensors the runner must produce for this slot.
    pub output_names: Vec<String>,
}

/// A full model invocation: the slots to run plus any physical block
/// copies that must land before attention reads the cache.
#[derive(Debug, Clone, Default)]
pub struct BatchDescriptor {
    pub slots: Vec<SlotDescriptor>,
    pub block_copies: Vec<BlockCopy>,
}

/// Per-slot model output for one step.
#[derive(Debug, Clone)]
pub struct SlotOutput {
    /// Next-token logits, shape `[vocab]`.
    pub logits: Tensor,
    /// Requested auxiliary tensors, shape `[fed_tokens, width]` each.
    pub additional: HashMap<String, Tensor>,
}

/// Per-slot success or failure text. Slot failures are isolated to their
/// request; a failed `run` call is fatal for the executor.
pub type SlotResult = std::result::Result<SlotOutput, String>;

/// Outputs of one model invocation, aligned with the descriptor's slots.
#[derive(Debug, Default)]
pub struct StepOutputs {
    pub slots: Vec<SlotResult>,
}

/// The compute capability the executor consumes.
pub trait ModelRunner: Send {
    fn run(&mut self, batch: &BatchDescriptor) -> Result<StepOutputs>;
}

/// A runner that returns the same fixed logits vector for every position,
/// with auxiliary outputs equal to the top-K logits in descending order.
///
/// Deterministic by construction, so results are independent of batch
/// size, concurrency, and beam width. Used by tests and demos.
#[derive(Debug, Clone)]
pub struct ConstantRunner {
    logits: Vec<f32>,
    aux_width: usize,
    device: Device,
}

impl ConstantRunner {
    pub fn new(logits: Vec<f32>, aux_width: usize) -> Self {
        Self {
            logits,
            aux_width,
            device: Device::Cpu,
        }
    }

    /// Fixed logits where token id `i` scores `vocab - i`, so greedy
    /// decoding always picks token 0 and top-K is `[vocab, vocab-1, ..]`.
    pub fn descending(vocab_size: usize, aux_width: usize) -> Self {
        let logits = (0..vocab_size).map(|i| (vocab_size - i) as f32).collect();
        Self::new(logits, aux_width)
    }

    pub fn vocab_size(&self) -> usize {
        self.logits.len()
    }

    /// The top-K logit values this runner reports, descending.
    pub fn top_k_values(&self) -> Vec<f32> {
        let mut sorted = self.logits.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        sorted.truncate(self.aux_width);
        sorted
    }

    fn slot_output(&self, slot: &SlotDescriptor) -> Result<SlotOutput> {
        let logits = Tensor::from_vec(self.logits.clone(), self.logits.len(), &self.device)?;
        let top_k = self.top_k_values();
        let rows = slot.token_ids.len();
        let mut additional = HashMap::new();
        for name in &slot.output_names {
            let mut data = Vec::with_capacity(rows * self.aux_width);
            for _ in 0..rows {
                data.extend_from_slice(&top_k);
            }
            let tensor = Tensor::from_vec(data, (rows, self.aux_width), &self.device)?;
            additional.insert(name.clone(), tensor);
        }
        Ok(SlotOutput { logits, additional })
    }
}

impl ModelRunner for ConstantRunner {
    fn run(&mut self, batch: &BatchDescriptor) -> Result<StepOutputs> {
        // No physical storage behind this runner, so block copies are
        // accepted and ignored.
        let mut slots = Vec::with_capacity(batch.slots.len());
        for slot in &batch.slots {
            slots.push(self.slot_output(slot).map_err(|e| e.to_string()));
        }
        Ok(StepOutputs { slots })
    }
}

//! Sequence tracking.
//!
//! A sequence is one beam's evolving token history for a request. It
//! owns the logical-to-physical block mapping for its KV cache and a
//! small status machine driven by the scheduler.

use crate::core::block::BlockTable;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting for admission; never scheduled yet.
    Queued,
    /// Part of the active batch (context or generation phase).
    Running,
    /// Evicted for memory; cache must be recomputed on resume.
    Paused,
    /// Reached a terminal state.
    Finished,
}

impl SequenceStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Finished => "Finished",
        }
    }
}

/// Reason a request reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A configured stop token was produced.
    StopToken,
    /// The request's maximum output length was reached.
    MaxOutputLength,
    /// The executor's sequence-length budget was exhausted.
    LengthBudget,
    /// Canceled by the caller.
    Cancelled,
    /// No progress within the configured idle window.
    TimedOut,
    /// The compute step failed for this request.
    Error,
}

/// One beam's token history and cache mapping.
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
    block_table: BlockTable,
    /// Token positions whose KV is present in cache. Trails `total_len`
    /// by the tokens not yet fed to the model; reset to zero on eviction.
    cached_tokens: usize,
    status: SequenceStatus,
}

impl Sequence {
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<u32>, tokens_per_block: usize) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            block_table: BlockTable::new(tokens_per_block),
            cached_tokens: 0,
            status: SequenceStatus::Queued,
        }
    }

    /// A new sequence sharing another beam's history, used when beam
    /// search forks lineage. The block table is attached separately by
    /// the cache manager.
    pub fn fork_from(parent: &Sequence, seq_id: SequenceId) -> Self {
        Self {
            seq_id,
            prompt_token_ids: parent.prompt_token_ids.clone(),
            output_token_ids: parent.output_token_ids.clone(),
            block_table: BlockTable::new(parent.block_table.tokens_per_block()),
            cached_tokens: parent.cached_tokens,
            status: parent.status,
        }
    }

    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// All token ids, prompt then output.
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    // ========== Length queries ==========

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Token positions in cache.
    pub fn cached_tokens(&self) -> usize {
        self.cached_tokens
    }

    /// Tokens that must be fed to the model this step: everything past
    /// the cached range. One token in steady-state generation, the whole
    /// history after admission or eviction.
    pub fn uncached_token_ids(&self) -> Vec<u32> {
        let all = self.all_token_ids();
        all[self.cached_tokens..].to_vec()
    }

    pub fn num_uncached_tokens(&self) -> usize {
        self.total_len() - self.cached_tokens
    }

    // ========== Token operations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    /// Replace the output history (beam lineage reassignment).
    pub fn set_output(&mut self, output_token_ids: Vec<u32>) {
        self.output_token_ids = output_token_ids;
    }

    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Record that `num_tokens` more positions now have KV in cache.
    pub fn mark_cached(&mut self, num_tokens: usize) {
        self.cached_tokens = (self.cached_tokens + num_tokens).min(self.total_len());
    }

    /// Forget the cached range entirely (eviction).
    pub fn reset_cache_progress(&mut self) {
        self.cached_tokens = 0;
    }

    // ========== State transitions ==========

    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Queued | SequenceStatus::Paused => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    pub fn set_paused(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Paused;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Paused",
            }),
        }
    }

    pub fn set_finished(&mut self) {
        self.status = SequenceStatus::Finished;
    }
}

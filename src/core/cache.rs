//! Sequence cache manager.
//!
//! Maps logical token positions to physical blocks on top of the
//! [`BlockPool`], and decides prefix sharing. Two sequences may reference
//! the same block only while their token contents up to that block
//! boundary are identical; writing into a partially filled shared block
//! forces a private copy first (copy-on-write). Physical copies are the
//! runner's job: the manager queues `(src, dst)` copy ops that the
//! scheduler ships with the next batch descriptor.

use tracing::debug;

use crate::core::block::{chain_block_hashes, BlockId, BlockTable};
use crate::core::pool::BlockPool;
use crate::core::sequence::Sequence;
use crate::error::{Error, Result};

/// A physical block copy the runner must perform before its next step.
pub type BlockCopy = (BlockId, BlockId);

/// Per-sequence block accounting over a shared [`BlockPool`].
#[derive(Debug)]
pub struct CacheManager {
    pool: BlockPool,
    tokens_per_block: usize,
    enable_prefix_sharing: bool,
    pending_copies: Vec<BlockCopy>,
}

impl CacheManager {
    pub fn new(num_blocks: usize, tokens_per_block: usize, enable_prefix_sharing: bool) -> Self {
        Self {
            pool: BlockPool::new(num_blocks),
            tokens_per_block,
            enable_prefix_sharing,
            pending_copies: Vec::new(),
        }
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn num_free_blocks(&self) -> usize {
        self.pool.num_free()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.pool.num_used()
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Blocks a sequence needs to reserve `new_tokens` more positions,
    /// including a copy-on-write split of a shared partial tail.
    pub fn blocks_needed(&self, seq: &Sequence, new_tokens: usize) -> usize {
        let mut needed = seq.block_table().blocks_needed(new_tokens);
        if new_tokens > 0 && self.tail_needs_split(seq) {
            needed += 1;
        }
        needed
    }

    pub fn can_acquire(&self, seq: &Sequence, new_tokens: usize) -> bool {
        self.pool.can_allocate(self.blocks_needed(seq, new_tokens))
    }

    /// Reserve `new_tokens` more positions for a sequence, extending its
    /// block chain. Fails without side effects if the pool cannot cover
    /// the full demand.
    pub fn acquire(&mut self, seq: &mut Sequence, new_tokens: usize) -> Result<()> {
        if new_tokens == 0 {
            return Ok(());
        }
        if !self.can_acquire(seq, new_tokens) {
            return Err(Error::OutOfBlocks);
        }
        if self.tail_needs_split(seq) {
            self.split_tail(seq)?;
        }
        let needed = seq.block_table().blocks_needed(new_tokens);
        if needed > 0 {
            let block_ids = self.pool.allocate_many(needed)?;
            seq.block_table_mut().append_blocks(&block_ids);
        }
        seq.block_table_mut().advance(new_tokens);
        Ok(())
    }

    /// Reserve blocks for a freshly admitted sequence's prompt, reusing
    /// registered full-block prefixes from other sequences when enabled.
    ///
    /// Returns the number of prompt tokens covered by shared blocks.
    pub fn acquire_prompt(&mut self, seq: &mut Sequence) -> Result<usize> {
        debug_assert!(seq.block_table().is_empty());
        let prompt_len = seq.prompt_len();

        let mut shared: Vec<BlockId> = Vec::new();
        if self.enable_prefix_sharing {
            for hash in chain_block_hashes(seq.prompt_token_ids(), self.tokens_per_block) {
                match self.pool.lookup_prefix(hash) {
                    Some(block_id) => shared.push(block_id),
                    None => break,
                }
            }
        }

        let total_blocks = seq.block_table().blocks_needed(prompt_len);
        let to_allocate = total_blocks - shared.len();
        if !self.pool.can_allocate(to_allocate) {
            // Roll back the references taken during lookup
            self.pool.free_many(&shared);
            return Err(Error::OutOfBlocks);
        }

        let shared_tokens = shared.len() * self.tokens_per_block;
        if !shared.is_empty() {
            debug!(
                seq_id = seq.seq_id(),
                shared_blocks = shared.len(),
                "reusing prefix blocks"
            );
        }
        seq.block_table_mut().append_blocks(&shared);
        let fresh = self.pool.allocate_many(to_allocate)?;
        seq.block_table_mut().append_blocks(&fresh);
        seq.block_table_mut().advance(prompt_len);
        Ok(shared_tokens)
    }

    /// Register a sequence's full prompt blocks for prefix sharing. Called
    /// after the context step completes, when their contents exist.
    pub fn register_prompt(&mut self, seq: &Sequence) {
        if !self.enable_prefix_sharing {
            return;
        }
        let hashes = chain_block_hashes(seq.prompt_token_ids(), self.tokens_per_block);
        for (logical_idx, hash) in hashes.into_iter().enumerate() {
            if self.pool.is_prefix_registered(hash) {
                continue;
            }
            if let Ok(block_id) = seq.block_table().get_block_id(logical_idx) {
                self.pool.register_prefix(block_id, hash);
            }
        }
    }

    /// Share every block of a parent sequence with a forked beam.
    ///
    /// The child's first divergent append will trigger a copy-on-write
    /// split of the shared partial tail.
    pub fn fork(&mut self, parent: &Sequence) -> BlockTable {
        let table = parent.block_table().clone();
        for &block_id in table.block_ids() {
            self.pool.increment_ref(block_id);
        }
        table
    }

    /// Release all of a sequence's block references. Zero-refcount blocks
    /// return to the pool.
    pub fn release(&mut self, seq: &mut Sequence) {
        let block_ids = seq.block_table_mut().release();
        self.pool.free_many(&block_ids);
    }

    /// Evict a paused sequence: drop its blocks but keep its logical
    /// token state so it can resume (by recomputation) later.
    pub fn evict(&mut self, seq: &mut Sequence) {
        debug!(seq_id = seq.seq_id(), blocks = seq.block_table().num_blocks(), "evicting");
        self.release(seq);
        seq.reset_cache_progress();
    }

    /// Drain the copy ops queued since the last batch.
    pub fn take_pending_copies(&mut self) -> Vec<BlockCopy> {
        std::mem::take(&mut self.pending_copies)
    }

    fn tail_needs_split(&self, seq: &Sequence) -> bool {
        let table = seq.block_table();
        if !table.has_partial_tail() {
            return false;
        }
        table
            .last_block_id()
            .and_then(|id| self.pool.ref_count(id))
            .map(|rc| rc > 1)
            .unwrap_or(false)
    }

    /// Copy-on-write: give the sequence a private copy of its shared
    /// partial tail block before anything is written into it.
    fn split_tail(&mut self, seq: &mut Sequence) -> Result<()> {
        let logical_idx = seq.block_table().num_blocks() - 1;
        let old_id = seq.block_table().get_block_id(logical_idx)?;
        let new_id = self.pool.allocate()?;
        self.pending_copies.push((old_id, new_id));
        seq.block_table_mut().replace_block(logical_idx, new_id);
        self.pool.free(old_id);
        debug!(seq_id = seq.seq_id(), src = old_id, dst = new_id, "copy-on-write split");
        Ok(())
    }
}

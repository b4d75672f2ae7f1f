//! Block abstractions for the paged KV cache.
//!
//! Cache storage is divided into fixed-size blocks, similar to how
//! operating systems manage virtual memory with pages. Blocks are
//! reference-counted so identical token prefixes can share storage.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Identifier of a physical cache block.
pub type BlockId = usize;

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// The hash includes the parent block's hash so that blocks holding the
/// same tokens after different prefixes get different hashes. Used to
/// identify shareable prefixes.
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }
    for &token in token_ids {
        token.hash(&mut hasher);
    }
    hasher.finish()
}

/// Chained hashes for every *full* block of a token sequence.
///
/// Partial trailing blocks are never hashed: sharing happens at
/// full-block granularity only.
pub fn chain_block_hashes(token_ids: &[u32], tokens_per_block: usize) -> Vec<u64> {
    let mut hashes = Vec::with_capacity(token_ids.len() / tokens_per_block);
    let mut parent = None;
    for chunk in token_ids.chunks_exact(tokens_per_block) {
        let hash = hash_token_block(chunk, parent);
        hashes.push(hash);
        parent = Some(hash);
    }
    hashes
}

/// Number of blocks needed to cover `num_tokens` token positions.
pub fn blocks_for_tokens(num_tokens: usize, tokens_per_block: usize) -> usize {
    num_tokens.div_ceil(tokens_per_block)
}

/// Bookkeeping for one physical cache block.
///
/// Ownership of a block is its reference count: a block shared between
/// sequences with identical prefixes has one reference per sharer.
#[derive(Debug, Clone)]
pub struct Block {
    block_id: BlockId,
    ref_count: usize,
    prefix_hash: Option<u64>,
}

impl Block {
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            ref_count: 1,
            prefix_hash: None,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Chain hash of the tokens stored in this block, if registered for
    /// prefix sharing.
    pub fn prefix_hash(&self) -> Option<u64> {
        self.prefix_hash
    }

    pub fn set_prefix_hash(&mut self, hash: u64) {
        self.prefix_hash = Some(hash);
    }

    /// Increment the reference count (when sharing with another sequence).
    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement the reference count, returning the new count.
    pub fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

/// Maps a sequence's logical token positions to physical blocks.
///
/// Token at position `p` lives in logical block `p / tokens_per_block`,
/// slot `p % tokens_per_block`, physical block `block_ids[p / tokens_per_block]`.
///
/// The table also tracks how many token positions have been reserved
/// (`num_tokens`), so the trailing block may be partially filled.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    block_ids: Vec<BlockId>,
    num_tokens: usize,
    tokens_per_block: usize,
}

impl BlockTable {
    pub fn new(tokens_per_block: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            num_tokens: 0,
            tokens_per_block,
        }
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    /// Token positions currently reserved in this table.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Physical block for a logical block index.
    pub fn get_block_id(&self, logical_idx: usize) -> Result<BlockId> {
        self.block_ids
            .get(logical_idx)
            .copied()
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Physical block holding the last reserved token position.
    pub fn last_block_id(&self) -> Option<BlockId> {
        self.block_ids.last().copied()
    }

    /// Whether the trailing block is only partially filled.
    pub fn has_partial_tail(&self) -> bool {
        self.num_tokens % self.tokens_per_block != 0 && !self.block_ids.is_empty()
    }

    /// How many new blocks are needed to reserve `new_tokens` more positions.
    pub fn blocks_needed(&self, new_tokens: usize) -> usize {
        if new_tokens == 0 {
            return 0;
        }
        let total_after = self.num_tokens + new_tokens;
        blocks_for_tokens(total_after, self.tokens_per_block).saturating_sub(self.block_ids.len())
    }

    /// Append newly allocated physical blocks.
    pub fn append_blocks(&mut self, block_ids: &[BlockId]) {
        self.block_ids.extend_from_slice(block_ids);
    }

    /// Reserve `n` more token positions. The caller must have appended
    /// enough blocks first.
    pub fn advance(&mut self, n: usize) {
        self.num_tokens += n;
        debug_assert!(
            self.num_tokens <= self.block_ids.len() * self.tokens_per_block,
            "advanced past allocated blocks"
        );
    }

    /// Replace the physical block at a logical index (copy-on-write split).
    pub fn replace_block(&mut self, logical_idx: usize, block_id: BlockId) {
        self.block_ids[logical_idx] = block_id;
    }

    /// All physical block IDs in logical order.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Physical slot indices for token positions `[start_pos, start_pos + n)`.
    ///
    /// Global slot = `block_id * tokens_per_block + slot_within_block`.
    pub fn slot_mapping(&self, start_pos: usize, n: usize) -> Vec<usize> {
        (start_pos..start_pos + n)
            .map(|pos| {
                let logical = pos / self.tokens_per_block;
                let offset = pos % self.tokens_per_block;
                self.block_ids[logical] * self.tokens_per_block + offset
            })
            .collect()
    }

    /// Drop all blocks, returning their IDs for freeing.
    pub fn release(&mut self) -> Vec<BlockId> {
        self.num_tokens = 0;
        std::mem::take(&mut self.block_ids)
    }
}

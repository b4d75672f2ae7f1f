//! Fixed-size pool of KV cache blocks.
//!
//! The pool maintains a free list for O(1) allocation, per-block
//! reference counts for prefix sharing, and a hash index that maps
//! chained prefix hashes to reusable blocks.

use std::collections::{HashMap, VecDeque};

use crate::core::block::{Block, BlockId};
use crate::error::{Error, Result};

/// Tracks free/used blocks and reference counts for the whole cache.
#[derive(Debug)]
pub struct BlockPool {
    /// Live blocks indexed by block id.
    blocks: HashMap<BlockId, Block>,
    /// Free block IDs (LIFO for cache locality).
    free_list: VecDeque<BlockId>,
    /// Chained prefix hash -> block id, for prefix sharing.
    prefix_index: HashMap<u64, BlockId>,
    /// Total number of blocks.
    num_blocks: usize,
}

impl BlockPool {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: HashMap::with_capacity(num_blocks),
            free_list: (0..num_blocks).collect(),
            prefix_index: HashMap::new(),
            num_blocks,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_used(&self) -> usize {
        self.blocks.len()
    }

    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Allocate a single block with reference count 1.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let block_id = self.free_list.pop_front().ok_or(Error::OutOfBlocks)?;
        self.blocks.insert(block_id, Block::new(block_id));
        Ok(block_id)
    }

    /// Allocate several blocks, or fail without allocating any.
    pub fn allocate_many(&mut self, num_blocks: usize) -> Result<Vec<BlockId>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::OutOfBlocks);
        }
        let mut block_ids = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            block_ids.push(self.allocate()?);
        }
        Ok(block_ids)
    }

    /// Drop one reference to a block; the block returns to the free list
    /// when its reference count reaches zero.
    ///
    /// Returns `true` if the block was actually freed.
    pub fn free(&mut self, block_id: BlockId) -> bool {
        if let Some(block) = self.blocks.get_mut(&block_id) {
            if block.decrement_ref() == 0 {
                if let Some(hash) = block.prefix_hash() {
                    self.prefix_index.remove(&hash);
                }
                self.blocks.remove(&block_id);
                self.free_list.push_back(block_id);
                return true;
            }
        }
        false
    }

    /// Drop one reference from each listed block.
    ///
    /// Returns the number of blocks that reached zero references.
    pub fn free_many(&mut self, block_ids: &[BlockId]) -> usize {
        block_ids.iter().filter(|&&id| self.free(id)).count()
    }

    /// Current reference count of a block, if live.
    pub fn ref_count(&self, block_id: BlockId) -> Option<usize> {
        self.blocks.get(&block_id).map(|b| b.ref_count())
    }

    /// Add a reference (when sharing a block with another sequence).
    pub fn increment_ref(&mut self, block_id: BlockId) -> Option<usize> {
        self.blocks.get_mut(&block_id).map(|block| {
            block.increment_ref();
            block.ref_count()
        })
    }

    // ========== Prefix sharing ==========

    /// Look up a block by chained prefix hash. On a hit, the block's
    /// reference count is incremented and the caller owns one reference.
    pub fn lookup_prefix(&mut self, prefix_hash: u64) -> Option<BlockId> {
        if let Some(&block_id) = self.prefix_index.get(&prefix_hash) {
            if self.blocks.contains_key(&block_id) {
                self.increment_ref(block_id);
                return Some(block_id);
            }
            // Stale entry left behind by an out-of-band free
            self.prefix_index.remove(&prefix_hash);
        }
        None
    }

    /// Register a block under a chained prefix hash so later sequences
    /// with the same prefix can share it.
    pub fn register_prefix(&mut self, block_id: BlockId, prefix_hash: u64) {
        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.set_prefix_hash(prefix_hash);
            self.prefix_index.insert(prefix_hash, block_id);
        }
    }

    pub fn is_prefix_registered(&self, prefix_hash: u64) -> bool {
        self.prefix_index.contains_key(&prefix_hash)
    }

    pub fn num_registered_prefixes(&self) -> usize {
        self.prefix_index.len()
    }
}

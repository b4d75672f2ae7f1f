//! Core data structures: blocks, the block pool, the cache manager,
//! sequences, and requests.

pub mod block;
pub mod cache;
pub mod pool;
pub mod request;
pub mod sequence;

pub use block::{
    blocks_for_tokens, chain_block_hashes, hash_token_block, Block, BlockId, BlockTable,
};
pub use cache::{BlockCopy, CacheManager};
pub use pool::BlockPool;
pub use request::{Request, RequestId};
pub use sequence::{FinishReason, Sequence, SequenceId, SequenceStatus};

//! Error types for inflight.

use thiserror::Error;

/// Result type alias for inflight operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for inflight.
#[derive(Error, Debug)]
pub enum Error {
    /// Prompt does not fit into a single batch; rejected at submit.
    #[error("prompt of {prompt_len} tokens exceeds the batch token budget of {max_batch_tokens}")]
    OversizedInput {
        prompt_len: usize,
        max_batch_tokens: usize,
    },

    /// Malformed request body (empty prompt, zero output budget);
    /// rejected at submit.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed sampling parameters; rejected at submit.
    #[error("invalid sampling parameters: {0}")]
    InvalidSamplingParams(String),

    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// Request not found in the executor.
    #[error("request {0} not found")]
    RequestNotFound(u64),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Logical block index past the end of a block table.
    #[error("block index {logical_idx} out of bounds ({num_blocks} blocks)")]
    BlockIndexOutOfBounds {
        logical_idx: usize,
        num_blocks: usize,
    },

    /// The model runner reported a failure for a batch slot.
    #[error("model runner failure: {0}")]
    Runner(String),

    /// The model runner failed in a way that ends the executor's ability
    /// to serve. Not locally recoverable.
    #[error("fatal engine failure: {0}")]
    Fatal(String),

    /// The executor worker has stopped; no further requests are accepted.
    #[error("executor is shut down")]
    ExecutorShutdown,

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

//! inflight: a continuous-batching inference executor.
//!
//! Serves many concurrent text-generation requests against a shared
//! autoregressive model, re-forming the execution batch every iteration
//! as requests arrive, progress, and finish. Ships a paged KV cache
//! manager with prefix sharing and copy-on-write, greedy / stochastic /
//! beam-search decoding, and streaming or final-only response delivery
//! with optional auxiliary tensor capture.
//!
//! The compute layer is consumed through the [`runner::ModelRunner`]
//! trait; everything else (kernels, weights, transport) lives outside
//! this crate.
//!
//! ```no_run
//! use inflight::{ConstantRunner, Executor, ExecutorConfig, Request};
//! use std::time::Duration;
//!
//! let runner = ConstantRunner::descending(64, 4);
//! let executor = Executor::new(ExecutorConfig::default(), Box::new(runner))?;
//! let id = executor.submit(Request::new(vec![1, 2, 3, 4], 8))?;
//! let responses = executor.await_responses(Some(Duration::from_secs(1)));
//! # let _ = (id, responses);
//! # Ok::<(), inflight::Error>(())
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod runner;
pub mod scheduler;

pub use crate::config::{
    AdditionalOutputSpec, ExecutorConfig, OutputConfig, SamplingParams, SchedulerConfig,
};
pub use crate::core::{CacheManager, FinishReason, Request, RequestId, Sequence, SequenceStatus};
pub use crate::engine::{AdditionalOutput, Executor, Response};
pub use crate::error::{Error, Result};
pub use crate::runner::{
    BatchDescriptor, ConstantRunner, ModelRunner, Phase, SlotDescriptor, SlotOutput, StepOutputs,
};
pub use crate::scheduler::{ScheduledBatch, Scheduler};

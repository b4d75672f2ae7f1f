//! Continuous batching: iteration-level batch formation and the
//! pause/resume policy under memory pressure.

pub mod batch;

pub use batch::{BatchSlot, RequestEntry, ScheduledBatch, Scheduler};

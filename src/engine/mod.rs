//! The decode/response pipeline and the executor front door.

pub mod decoder;
pub mod executor;
pub mod response;
pub mod sampler;

pub use decoder::{DecodeState, StepDecision};
pub use executor::Executor;
pub use response::{AdditionalOutput, Response, ResponseAssembler};
pub use sampler::Sampler;

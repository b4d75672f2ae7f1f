//! Request types.
//!
//! A request is the immutable caller-side input: prompt tokens, output
//! limits, delivery mode, sampling and capture configuration.

use crate::config::{AdditionalOutputSpec, ExecutorConfig, OutputConfig, SamplingParams};
use crate::error::{Error, Result};

/// Unique, executor-assigned request identifier.
pub type RequestId = u64;

/// A text-generation request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Prompt token ids.
    pub prompt_token_ids: Vec<u32>,
    /// Maximum number of tokens to generate per beam.
    pub max_output_len: usize,
    /// Emit one response per decoding step instead of a single terminal
    /// response.
    pub streaming: bool,
    /// Sampling configuration.
    pub sampling: SamplingParams,
    /// Auxiliary tensor capture configuration.
    pub output: OutputConfig,
    /// Scheduling priority (higher = more important).
    pub priority: i32,
}

impl Request {
    pub fn new(prompt_token_ids: Vec<u32>, max_output_len: usize) -> Self {
        Self {
            prompt_token_ids,
            max_output_len,
            streaming: false,
            sampling: SamplingParams::default(),
            output: OutputConfig::default(),
            priority: 0,
        }
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn beam_width(mut self, beam_width: usize) -> Self {
        self.sampling.beam_width = beam_width;
        self
    }

    pub fn sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Capture a generation-phase auxiliary tensor.
    pub fn capture(mut self, name: impl Into<String>) -> Self {
        self.output
            .additional_outputs
            .push(AdditionalOutputSpec::new(name));
        self
    }

    /// Capture an auxiliary tensor in both context and generation phases.
    pub fn capture_with_context(mut self, name: impl Into<String>) -> Self {
        self.output
            .additional_outputs
            .push(AdditionalOutputSpec::with_context(name));
        self
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Admission checks, run synchronously at submit.
    pub fn validate(&self, config: &ExecutorConfig) -> Result<()> {
        if self.prompt_token_ids.is_empty() {
            return Err(Error::InvalidRequest("empty prompt".to_string()));
        }
        if self.max_output_len == 0 {
            return Err(Error::InvalidRequest(
                "max_output_len must be at least 1".to_string(),
            ));
        }
        self.sampling.validate(config.max_beam_width)?;
        if self.prompt_len() > config.max_batch_tokens {
            return Err(Error::OversizedInput {
                prompt_len: self.prompt_len(),
                max_batch_tokens: config.max_batch_tokens,
            });
        }
        if self.prompt_len() >= config.max_seq_len {
            return Err(Error::OversizedInput {
                prompt_len: self.prompt_len(),
                max_batch_tokens: config.max_seq_len,
            });
        }
        Ok(())
    }

    /// The auxiliary outputs to capture for this request: per-request
    /// specs plus globally configured ones, deduplicated by name with the
    /// per-request spec winning.
    pub fn resolved_outputs(&self, config: &ExecutorConfig) -> Vec<AdditionalOutputSpec> {
        let mut specs = self.output.additional_outputs.clone();
        for global in &config.additional_outputs {
            if !specs.iter().any(|s| s.name == global.name) {
                specs.push(global.clone());
            }
        }
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = Request::new(vec![1, 2, 3], 8)
            .streaming(true)
            .beam_width(2)
            .priority(5)
            .capture("topKLogits");

        assert_eq!(request.prompt_len(), 3);
        assert!(request.streaming);
        assert_eq!(request.sampling.beam_width, 2);
        assert_eq!(request.priority, 5);
        assert_eq!(request.output.additional_outputs.len(), 1);
        assert!(!request.output.additional_outputs[0].gather_context);
    }

    #[test]
    fn test_oversized_prompt_rejected() {
        let config = ExecutorConfig {
            max_batch_tokens: 8,
            ..ExecutorConfig::default()
        };
        let request = Request::new((0..9).collect(), 4);
        assert!(matches!(
            request.validate(&config),
            Err(Error::OversizedInput { prompt_len: 9, .. })
        ));

        let fits = Request::new((0..8).collect(), 4);
        assert!(fits.validate(&config).is_ok());
    }

    #[test]
    fn test_malformed_request_rejected() {
        let config = ExecutorConfig::default();

        let empty = Request::new(vec![], 4);
        assert!(matches!(
            empty.validate(&config),
            Err(Error::InvalidRequest(_))
        ));

        let no_budget = Request::new(vec![1, 2], 0);
        assert!(matches!(
            no_budget.validate(&config),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_resolved_outputs_merges_globals() {
        let config = ExecutorConfig {
            additional_outputs: vec![
                AdditionalOutputSpec::new("topKLogits"),
                AdditionalOutputSpec::new("entropy"),
            ],
            ..ExecutorConfig::default()
        };
        let request = Request::new(vec![1], 4).capture_with_context("topKLogits");

        let resolved = request.resolved_outputs(&config);
        assert_eq!(resolved.len(), 2);
        // Per-request spec wins for topKLogits
        assert!(resolved[0].gather_context);
        assert_eq!(resolved[1].name, "entropy");
    }
}

//! Configuration types for inflight.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default tokens per KV cache block.
pub const DEFAULT_TOKENS_PER_BLOCK: usize = 16;

/// A named auxiliary tensor to capture alongside token generation.
///
/// Generation-phase capture is always performed for a requested output;
/// setting `gather_context` additionally captures the context (prompt)
/// phase, reported under the name `context_<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalOutputSpec {
    /// Name of the auxiliary tensor as produced by the model runner.
    pub name: String,
    /// Also capture the context phase for this output.
    pub gather_context: bool,
}

impl AdditionalOutputSpec {
    /// Capture the generation phase only.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gather_context: false,
        }
    }

    /// Capture both the context and generation phases.
    pub fn with_context(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gather_context: true,
        }
    }
}

/// Per-request output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Auxiliary tensors to capture for this request, in addition to any
    /// configured globally on the executor.
    pub additional_outputs: Vec<AdditionalOutputSpec>,
}

/// Per-request sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of parallel candidate sequences. 1 disables beam search.
    pub beam_width: usize,
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Seed for the per-request RNG; fixed seeds give deterministic output.
    pub seed: u64,
    /// Token ids that terminate generation when produced. Under beam
    /// search the request finishes once every beam's latest token is a
    /// stop token; a single stopped beam stays in the candidate set.
    pub stop_token_ids: Vec<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            beam_width: 1,
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            seed: 0,
            stop_token_ids: Vec::new(),
        }
    }
}

impl SamplingParams {
    /// Validate against executor limits. Called synchronously at submit.
    pub fn validate(&self, max_beam_width: usize) -> Result<()> {
        if self.beam_width == 0 {
            return Err(Error::InvalidSamplingParams(
                "beam width must be at least 1".to_string(),
            ));
        }
        if self.beam_width > max_beam_width {
            return Err(Error::InvalidSamplingParams(format!(
                "beam width {} exceeds maximum {max_beam_width}",
                self.beam_width
            )));
        }
        if self.temperature < 0.0 {
            return Err(Error::InvalidSamplingParams(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::InvalidSamplingParams(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Scheduler policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Share full prompt blocks between sequences with identical prefixes.
    pub enable_prefix_sharing: bool,
    /// Pause (evict) running requests under memory pressure instead of
    /// stalling admission.
    pub enable_pausing: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enable_prefix_sharing: true,
            enable_pausing: true,
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum sequences per batch.
    pub max_batch_seqs: usize,
    /// Maximum tokens per batch. Prompts longer than this are rejected
    /// at submit.
    pub max_batch_tokens: usize,
    /// Maximum beam width a request may ask for.
    pub max_beam_width: usize,
    /// Tokens per KV cache block.
    pub tokens_per_block: usize,
    /// Total KV cache budget in tokens across all sequences.
    pub cache_token_budget: usize,
    /// Maximum total sequence length (prompt + output) per sequence.
    pub max_seq_len: usize,
    /// A request with no progress for this long is failed with a terminal
    /// error response.
    pub max_idle: Duration,
    /// Auxiliary tensors captured for every request.
    pub additional_outputs: Vec<AdditionalOutputSpec>,
    /// Scheduler policy knobs.
    pub scheduler: SchedulerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_batch_seqs: 256,
            max_batch_tokens: 4096,
            max_beam_width: 4,
            tokens_per_block: DEFAULT_TOKENS_PER_BLOCK,
            cache_token_budget: 16384,
            max_seq_len: 8192,
            max_idle: Duration::from_secs(180),
            additional_outputs: Vec::new(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Number of KV cache blocks implied by the token budget.
    pub fn num_blocks(&self) -> usize {
        self.cache_token_budget / self.tokens_per_block
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.tokens_per_block == 0 {
            return Err(Error::Config("tokens_per_block must be positive".to_string()));
        }
        if self.max_batch_seqs == 0 || self.max_batch_tokens == 0 {
            return Err(Error::Config("batch limits must be positive".to_string()));
        }
        if self.num_blocks() == 0 {
            return Err(Error::Config(format!(
                "cache budget of {} tokens holds no {}-token block",
                self.cache_token_budget, self.tokens_per_block
            )));
        }
        if self.max_beam_width == 0 {
            return Err(Error::Config("max_beam_width must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_blocks(), 16384 / 16);
    }

    #[test]
    fn config_json_round_trip() {
        let mut config = ExecutorConfig::default();
        config.additional_outputs = vec![AdditionalOutputSpec::with_context("topKLogits")];
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ExecutorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_batch_tokens, config.max_batch_tokens);
        assert_eq!(parsed.additional_outputs, config.additional_outputs);
    }

    #[test]
    fn config_loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.json");
        let config = ExecutorConfig {
            max_batch_seqs: 4,
            ..ExecutorConfig::default()
        };
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = ExecutorConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.max_batch_seqs, 4);
    }

    #[test]
    fn sampling_params_validation() {
        let params = SamplingParams::default();
        assert!(params.validate(4).is_ok());

        let wide = SamplingParams {
            beam_width: 8,
            ..SamplingParams::default()
        };
        assert!(wide.validate(4).is_err());

        let zero = SamplingParams {
            beam_width: 0,
            ..SamplingParams::default()
        };
        assert!(zero.validate(4).is_err());
    }

    #[test]
    fn zero_budget_rejected() {
        let config = ExecutorConfig {
            cache_token_budget: 8,
            tokens_per_block: 16,
            ..ExecutorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

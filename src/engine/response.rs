//! Response assembly.
//!
//! Streaming and final-only delivery are one event stream per request
//! with a batching policy flag: streaming emits a response per decoding
//! step, final-only folds everything into the terminal response. Capture
//! buffers for auxiliary tensors accumulate here; the context-phase
//! buffer attaches to the first response at or after context completion,
//! the generation-phase buffer to the terminal response.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::config::AdditionalOutputSpec;
use crate::core::request::{Request, RequestId};
use crate::core::sequence::{FinishReason, Sequence};
use crate::error::Result;

/// A named auxiliary tensor captured for one phase of a request.
#[derive(Debug, Clone)]
pub struct AdditionalOutput {
    /// The requested name; context-phase captures are reported under
    /// `context_<name>`.
    pub name: String,
    /// `[steps_in_phase, width]`.
    pub output: Tensor,
}

/// One delivery event for a request.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    /// Tokens per beam: this step's increment when streaming, the full
    /// output in a final-only terminal response.
    pub tokens: Vec<Vec<u32>>,
    pub additional_outputs: Vec<AdditionalOutput>,
    pub finish_reason: Option<FinishReason>,
    pub error: Option<String>,
    pub is_final: bool,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Total tokens across all beams in this response.
    pub fn num_tokens(&self) -> usize {
        self.tokens.iter().map(Vec::len).sum()
    }
}

#[derive(Debug)]
struct AssemblyState {
    streaming: bool,
    specs: Vec<AdditionalOutputSpec>,
    /// One `[prompt_len, width]` tensor per context-captured name.
    context_chunks: HashMap<String, Tensor>,
    /// Per-step `[1, width]` rows per generation-captured name.
    generation_chunks: HashMap<String, Vec<Tensor>>,
    context_delivered: bool,
}

/// Turns decoder output and capture chunks into [`Response`]s.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    states: HashMap<RequestId, AssemblyState>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request_id: RequestId, request: &Request, specs: Vec<AdditionalOutputSpec>) {
        self.states.insert(
            request_id,
            AssemblyState {
                streaming: request.streaming,
                specs,
                context_chunks: HashMap::new(),
                generation_chunks: HashMap::new(),
                context_delivered: false,
            },
        );
    }

    pub fn is_registered(&self, request_id: RequestId) -> bool {
        self.states.contains_key(&request_id)
    }

    /// Record the context step's auxiliary tensors (`[prompt_len, width]`
    /// per name) for the specs that asked for context capture.
    pub fn record_context(&mut self, request_id: RequestId, aux: &HashMap<String, Tensor>) {
        let Some(state) = self.states.get_mut(&request_id) else {
            return;
        };
        for spec in &state.specs {
            if !spec.gather_context {
                continue;
            }
            if let Some(tensor) = aux.get(&spec.name) {
                state.context_chunks.insert(spec.name.clone(), tensor.clone());
            }
        }
    }

    /// Record a generation step's auxiliary tensors. Only the final row
    /// is captured, so recompute steps feeding many positions still
    /// contribute exactly one entry.
    pub fn record_generation(&mut self, request_id: RequestId, aux: &HashMap<String, Tensor>) -> Result<()> {
        let Some(state) = self.states.get_mut(&request_id) else {
            return Ok(());
        };
        for spec in &state.specs {
            if let Some(tensor) = aux.get(&spec.name) {
                let rows = tensor.dim(0)?;
                let last = tensor.narrow(0, rows - 1, 1)?;
                state
                    .generation_chunks
                    .entry(spec.name.clone())
                    .or_default()
                    .push(last);
            }
        }
        Ok(())
    }

    /// Assemble the response (if any) for one completed decode step.
    pub fn on_step(
        &mut self,
        request_id: RequestId,
        step_tokens: &[u32],
        sequences: &[Sequence],
        finish: Option<FinishReason>,
    ) -> Result<Option<Response>> {
        let Some(state) = self.states.get_mut(&request_id) else {
            return Ok(None);
        };

        if finish.is_none() && !state.streaming {
            return Ok(None);
        }

        let mut additional_outputs = Vec::new();
        if !state.context_delivered {
            state.context_delivered = true;
            additional_outputs.extend(take_context_outputs(state));
        }

        let tokens = if state.streaming {
            step_tokens.iter().map(|&t| vec![t]).collect()
        } else {
            sequences.iter().map(|s| s.output_token_ids().to_vec()).collect()
        };

        let is_final = finish.is_some();
        if is_final {
            additional_outputs.extend(take_generation_outputs(state)?);
            self.states.remove(&request_id);
        }

        Ok(Some(Response {
            request_id,
            tokens,
            additional_outputs,
            finish_reason: finish,
            error: None,
            is_final,
        }))
    }

    /// Terminal response outside the normal decode path: cancellation,
    /// idle timeout, or a per-slot runner failure.
    pub fn terminal(&mut self, request_id: RequestId, reason: FinishReason, error: Option<String>) -> Response {
        self.states.remove(&request_id);
        Response {
            request_id,
            tokens: Vec::new(),
            additional_outputs: Vec::new(),
            finish_reason: Some(reason),
            error,
            is_final: true,
        }
    }

    pub fn remove(&mut self, request_id: RequestId) {
        self.states.remove(&request_id);
    }
}

fn take_context_outputs(state: &mut AssemblyState) -> Vec<AdditionalOutput> {
    let mut outputs = Vec::new();
    for spec in &state.specs {
        if let Some(tensor) = state.context_chunks.remove(&spec.name) {
            outputs.push(AdditionalOutput {
                name: format!("context_{}", spec.name),
                output: tensor,
            });
        }
    }
    outputs
}

fn take_generation_outputs(state: &mut AssemblyState) -> Result<Vec<AdditionalOutput>> {
    let mut outputs = Vec::new();
    for spec in &state.specs {
        if let Some(chunks) = state.generation_chunks.remove(&spec.name) {
            if chunks.is_empty() {
                continue;
            }
            outputs.push(AdditionalOutput {
                name: spec.name.clone(),
                output: Tensor::cat(&chunks, 0)?,
            });
        }
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn aux(name: &str, rows: usize, width: usize) -> HashMap<String, Tensor> {
        let data: Vec<f32> = (0..rows * width).map(|i| i as f32).collect();
        let tensor = Tensor::from_vec(data, (rows, width), &Device::Cpu).unwrap();
        HashMap::from([(name.to_string(), tensor)])
    }

    fn seq_with_output(output: &[u32]) -> Sequence {
        let mut seq = Sequence::new(1, vec![1, 2, 3], 16);
        for &t in output {
            seq.append_token(t);
        }
        seq
    }

    #[test]
    fn test_non_streaming_emits_only_terminal() {
        let mut assembler = ResponseAssembler::new();
        let request = Request::new(vec![1, 2, 3], 2);
        assembler.register(7, &request, vec![]);

        let seqs = [seq_with_output(&[9])];
        let none = assembler.on_step(7, &[9], &seqs, None).unwrap();
        assert!(none.is_none());

        let seqs = [seq_with_output(&[9, 8])];
        let resp = assembler
            .on_step(7, &[8], &seqs, Some(FinishReason::MaxOutputLength))
            .unwrap()
            .unwrap();
        assert!(resp.is_final);
        assert_eq!(resp.tokens, vec![vec![9, 8]]);
        assert_eq!(resp.finish_reason, Some(FinishReason::MaxOutputLength));
        assert!(!assembler.is_registered(7));
    }

    #[test]
    fn test_streaming_emits_per_step_increments() {
        let mut assembler = ResponseAssembler::new();
        let request = Request::new(vec![1, 2, 3], 2).streaming(true);
        assembler.register(7, &request, vec![]);

        let seqs = [seq_with_output(&[9])];
        let first = assembler.on_step(7, &[9], &seqs, None).unwrap().unwrap();
        assert!(!first.is_final);
        assert_eq!(first.tokens, vec![vec![9]]);

        let seqs = [seq_with_output(&[9, 8])];
        let last = assembler
            .on_step(7, &[8], &seqs, Some(FinishReason::MaxOutputLength))
            .unwrap()
            .unwrap();
        assert!(last.is_final);
        assert_eq!(last.tokens, vec![vec![8]]);
        assert_eq!(first.num_tokens() + last.num_tokens(), 2);
    }

    #[test]
    fn test_generation_capture_accumulates_one_row_per_step() {
        let mut assembler = ResponseAssembler::new();
        let request = Request::new(vec![1, 2, 3], 3);
        assembler.register(7, &request, vec![AdditionalOutputSpec::new("topKLogits")]);

        // Two generation steps after the context step
        assembler.record_generation(7, &aux("topKLogits", 1, 4)).unwrap();
        // A recompute step feeds 5 positions but contributes one row
        assembler.record_generation(7, &aux("topKLogits", 5, 4)).unwrap();

        let seqs = [seq_with_output(&[9, 8, 7])];
        let resp = assembler
            .on_step(7, &[7], &seqs, Some(FinishReason::MaxOutputLength))
            .unwrap()
            .unwrap();
        assert_eq!(resp.additional_outputs.len(), 1);
        assert_eq!(resp.additional_outputs[0].name, "topKLogits");
        assert_eq!(resp.additional_outputs[0].output.dims(), &[2, 4]);
    }

    #[test]
    fn test_context_capture_reported_with_prefix_and_generation_kept() {
        let mut assembler = ResponseAssembler::new();
        let request = Request::new(vec![1, 2, 3], 2).streaming(true);
        assembler.register(
            7,
            &request,
            vec![AdditionalOutputSpec::with_context("topKLogits")],
        );

        assembler.record_context(7, &aux("topKLogits", 3, 4));
        let seqs = [seq_with_output(&[9])];
        let first = assembler.on_step(7, &[9], &seqs, None).unwrap().unwrap();
        // Context tensor rides the first response, named context_<name>
        assert_eq!(first.additional_outputs.len(), 1);
        assert_eq!(first.additional_outputs[0].name, "context_topKLogits");
        assert_eq!(first.additional_outputs[0].output.dims(), &[3, 4]);

        assembler.record_generation(7, &aux("topKLogits", 1, 4)).unwrap();
        let seqs = [seq_with_output(&[9, 8])];
        let last = assembler
            .on_step(7, &[8], &seqs, Some(FinishReason::MaxOutputLength))
            .unwrap()
            .unwrap();
        // Context capture does not suppress the generation capture
        assert_eq!(last.additional_outputs.len(), 1);
        assert_eq!(last.additional_outputs[0].name, "topKLogits");
        assert_eq!(last.additional_outputs[0].output.dims(), &[1, 4]);
    }

    #[test]
    fn test_context_not_gathered_without_flag() {
        let mut assembler = ResponseAssembler::new();
        let request = Request::new(vec![1, 2, 3], 2);
        assembler.register(7, &request, vec![AdditionalOutputSpec::new("topKLogits")]);

        assembler.record_context(7, &aux("topKLogits", 3, 4));
        let seqs = [seq_with_output(&[9, 8])];
        let resp = assembler
            .on_step(7, &[8], &seqs, Some(FinishReason::MaxOutputLength))
            .unwrap()
            .unwrap();
        assert!(resp
            .additional_outputs
            .iter()
            .all(|o| !o.name.starts_with("context_")));
    }

    #[test]
    fn test_terminal_error_response() {
        let mut assembler = ResponseAssembler::new();
        let request = Request::new(vec![1], 2);
        assembler.register(7, &request, vec![]);

        let resp = assembler.terminal(7, FinishReason::Cancelled, None);
        assert!(resp.is_final);
        assert!(resp.is_ok());
        assert_eq!(resp.finish_reason, Some(FinishReason::Cancelled));
        assert!(!assembler.is_registered(7));
    }
}

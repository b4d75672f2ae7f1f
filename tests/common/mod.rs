#![allow(dead_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use candle_core::{Device, Tensor};
use inflight::{
    BatchDescriptor, Executor, ModelRunner, Request, RequestId, Response, StepOutputs,
};

/// Poll the executor until every listed request has produced its final
/// response, returning all responses grouped by request.
pub fn collect_until_final(
    executor: &Executor,
    request_ids: &[RequestId],
    timeout: Duration,
) -> HashMap<RequestId, Vec<Response>> {
    let deadline = Instant::now() + timeout;
    let mut collected: HashMap<RequestId, Vec<Response>> = HashMap::new();
    let mut finished = 0;
    while finished < request_ids.len() {
        assert!(
            Instant::now() < deadline,
            "requests did not finish within {timeout:?}"
        );
        let batch = executor.await_responses(Some(Duration::from_millis(100)));
        for (request_id, responses) in batch {
            finished += responses.iter().filter(|r| r.is_final).count();
            collected.entry(request_id).or_default().extend(responses);
        }
    }
    collected
}

pub fn submit_all(executor: &Executor, requests: Vec<Request>) -> Vec<RequestId> {
    requests
        .into_iter()
        .map(|r| executor.submit(r).unwrap())
        .collect()
}

/// A runner whose next token is always `last fed token + 1 (mod vocab)`,
/// expressed as one-hot logits. Each request's output is a pure function
/// of its own prompt, which makes cross-request leakage observable.
pub struct EchoRunner {
    vocab_size: usize,
}

impl EchoRunner {
    pub fn new(vocab_size: usize) -> Self {
        Self { vocab_size }
    }

    /// The greedy output this runner produces for a prompt.
    pub fn expected_output(&self, prompt: &[u32], max_output_len: usize) -> Vec<u32> {
        let mut last = *prompt.last().unwrap();
        (0..max_output_len)
            .map(|_| {
                last = (last + 1) % self.vocab_size as u32;
                last
            })
            .collect()
    }
}

impl ModelRunner for EchoRunner {
    fn run(&mut self, batch: &BatchDescriptor) -> inflight::Result<StepOutputs> {
        let mut slots = Vec::with_capacity(batch.slots.len());
        for slot in &batch.slots {
            let next = (slot.token_ids.last().unwrap() + 1) as usize % self.vocab_size;
            let mut logits = vec![0.0f32; self.vocab_size];
            logits[next] = 1.0;
            let tensor = Tensor::from_vec(logits, self.vocab_size, &Device::Cpu)
                .map_err(|e| e.to_string());
            slots.push(tensor.map(|logits| inflight::runner::SlotOutput {
                logits,
                additional: HashMap::new(),
            }));
        }
        Ok(StepOutputs { slots })
    }
}

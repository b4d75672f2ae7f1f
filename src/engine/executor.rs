//! The executor front door.
//!
//! Callers submit requests, poll for responses, and cancel from any
//! thread. A dedicated worker thread owns the scheduler, cache manager,
//! decoders, and runner, and drives the iteration loop: drain commands,
//! form a batch, run the model, decode, assemble, publish. All batch and
//! cache bookkeeping is single-threaded inside that loop; the only
//! shared state is the command channel in and the response map out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use candle_core::Tensor;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::core::request::{Request, RequestId};
use crate::core::sequence::{FinishReason, SequenceId};
use crate::core::CacheManager;
use crate::engine::decoder::DecodeState;
use crate::engine::response::{Response, ResponseAssembler};
use crate::error::{Error, Result};
use crate::runner::{BatchDescriptor, ModelRunner, Phase, SlotDescriptor, SlotOutput};
use crate::scheduler::{ScheduledBatch, Scheduler};

enum Command {
    Submit { request_id: RequestId, request: Request },
    Cancel(RequestId),
    Shutdown,
}

struct Shared {
    ready: Mutex<HashMap<RequestId, Vec<Response>>>,
    available: Condvar,
    worker_live: AtomicBool,
}

/// Public entry point: submit / await_responses / cancel over a worker
/// thread that owns all scheduling state.
pub struct Executor {
    config: ExecutorConfig,
    commands: Sender<Command>,
    shared: Arc<Shared>,
    next_request_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, runner: Box<dyn ModelRunner>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            ready: Mutex::new(HashMap::new()),
            available: Condvar::new(),
            worker_live: AtomicBool::new(true),
        });
        let (commands, command_rx) = mpsc::channel();

        let worker_shared = Arc::clone(&shared);
        let worker_config = config.clone();
        let worker = thread::Builder::new()
            .name("inflight-worker".to_string())
            .spawn(move || {
                let mut worker = Worker::new(worker_config, runner, worker_shared, command_rx);
                worker.run();
            })?;

        info!(
            num_blocks = config.num_blocks(),
            tokens_per_block = config.tokens_per_block,
            "executor started"
        );
        Ok(Self {
            config,
            commands,
            shared,
            next_request_id: AtomicU64::new(1),
            worker: Some(worker),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Enqueue a request. Admission checks run synchronously; a valid
    /// request always gets a fresh id and will eventually be scheduled.
    pub fn submit(&self, request: Request) -> Result<RequestId> {
        if !self.shared.worker_live.load(Ordering::Acquire) {
            return Err(Error::ExecutorShutdown);
        }
        request.validate(&self.config)?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(Command::Submit { request_id, request })
            .map_err(|_| Error::ExecutorShutdown)?;
        Ok(request_id)
    }

    /// Collect whatever responses have become available, blocking up to
    /// `timeout`. `None` means a best-effort single poll.
    pub fn await_responses(&self, timeout: Option<Duration>) -> HashMap<RequestId, Vec<Response>> {
        let mut ready = self.shared.ready.lock().unwrap();
        if let Some(limit) = timeout {
            let deadline = Instant::now() + limit;
            while ready.is_empty() && self.shared.worker_live.load(Ordering::Acquire) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .shared
                    .available
                    .wait_timeout(ready, deadline - now)
                    .unwrap();
                ready = guard;
            }
        }
        std::mem::take(&mut *ready)
    }

    /// Cancel a live request. It stops producing responses after one
    /// final response with a cancelled status, and its blocks return to
    /// the pool.
    pub fn cancel(&self, request_id: RequestId) -> Result<()> {
        self.commands
            .send(Command::Cancel(request_id))
            .map_err(|_| Error::ExecutorShutdown)
    }

    /// Stop the worker thread. Live requests are dropped without further
    /// responses.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.worker_live.store(false, Ordering::Release);
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The iteration loop and everything it owns.
struct Worker {
    config: ExecutorConfig,
    runner: Box<dyn ModelRunner>,
    scheduler: Scheduler,
    cache: CacheManager,
    decoders: HashMap<RequestId, DecodeState>,
    assembler: ResponseAssembler,
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    next_seq_id: SequenceId,
}

impl Worker {
    fn new(
        config: ExecutorConfig,
        runner: Box<dyn ModelRunner>,
        shared: Arc<Shared>,
        commands: Receiver<Command>,
    ) -> Self {
        let cache = CacheManager::new(
            config.num_blocks(),
            config.tokens_per_block,
            config.scheduler.enable_prefix_sharing,
        );
        let scheduler = Scheduler::new(config.clone());
        Self {
            config,
            runner,
            scheduler,
            cache,
            decoders: HashMap::new(),
            assembler: ResponseAssembler::new(),
            shared,
            commands,
            next_seq_id: 1,
        }
    }

    fn run(&mut self) {
        loop {
            if !self.drain_commands() {
                break;
            }
            self.fail_idle_requests();

            let batch = match self.scheduler.schedule(&mut self.cache) {
                Ok(batch) => batch,
                Err(e) => {
                    self.fail_all(&e.to_string());
                    break;
                }
            };
            if batch.is_empty() {
                if !self.park() {
                    break;
                }
                continue;
            }

            match self.step(batch) {
                Ok(responses) => self.publish(responses),
                Err(e) => {
                    error!(error = %e, "fatal step failure, stopping worker");
                    self.fail_all(&e.to_string());
                    break;
                }
            }
        }
        self.shared.worker_live.store(false, Ordering::Release);
        self.shared.available.notify_all();
        info!("worker stopped");
    }

    /// Process all pending commands. Returns `false` on shutdown.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if !self.handle_command(command) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Nothing to run: block for the next command, with a short timeout
    /// while live-but-deferred requests are waiting on the cache.
    fn park(&mut self) -> bool {
        if self.scheduler.has_live_requests() {
            match self.commands.recv_timeout(Duration::from_millis(5)) {
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => true,
                Err(RecvTimeoutError::Disconnected) => false,
            }
        } else {
            match self.commands.recv() {
                Ok(command) => self.handle_command(command),
                Err(_) => false,
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Submit { request_id, request } => {
                let specs = request.resolved_outputs(&self.config);
                self.assembler.register(request_id, &request, specs);
                self.decoders
                    .insert(request_id, DecodeState::new(&request, self.config.max_seq_len));
                self.scheduler.add(request_id, request, self.next_seq_id);
                self.next_seq_id += 1;
                true
            }
            Command::Cancel(request_id) => {
                if self.scheduler.contains(request_id) {
                    if let Err(e) = self.scheduler.remove(request_id, &mut self.cache) {
                        warn!(request_id, error = %e, "cancel failed");
                    }
                    self.decoders.remove(&request_id);
                    let response = self.assembler.terminal(request_id, FinishReason::Cancelled, None);
                    info!(request_id, "request cancelled");
                    self.publish(vec![response]);
                } else {
                    debug!(request_id, "cancel for unknown or finished request");
                }
                true
            }
            Command::Shutdown => false,
        }
    }

    /// Fail requests that made no progress within the idle window.
    fn fail_idle_requests(&mut self) {
        let idle = self.scheduler.idle_request_ids(self.config.max_idle);
        if idle.is_empty() {
            return;
        }
        let mut responses = Vec::new();
        for request_id in idle {
            warn!(request_id, "request timed out without progress");
            let _ = self.scheduler.remove(request_id, &mut self.cache);
            self.decoders.remove(&request_id);
            responses.push(self.assembler.terminal(
                request_id,
                FinishReason::TimedOut,
                Some(format!("no progress within {:?}", self.config.max_idle)),
            ));
        }
        self.publish(responses);
    }

    /// Run one scheduled batch end to end.
    fn step(&mut self, batch: ScheduledBatch) -> Result<Vec<Response>> {
        let descriptor = self.build_descriptor(&batch);
        let outputs = self.runner.run(&descriptor)?;
        if outputs.slots.len() != descriptor.slots.len() {
            return Err(Error::Fatal(format!(
                "runner returned {} slot outputs for {} slots",
                outputs.slots.len(),
                descriptor.slots.len()
            )));
        }

        let mut responses = Vec::new();
        for group in group_by_request(&batch, outputs.slots) {
            if let Some(response) = self.process_request_step(group)? {
                responses.push(response);
            }
        }
        Ok(responses)
    }

    fn build_descriptor(&self, batch: &ScheduledBatch) -> BatchDescriptor {
        let mut slots = Vec::with_capacity(batch.slots.len());
        for slot in &batch.slots {
            let entry = self.scheduler.entry(slot.request_id).unwrap();
            let seq = &entry.sequences[slot.seq_index];
            let token_ids = seq.uncached_token_ids();
            let start_pos = seq.cached_tokens();
            let output_names = entry
                .request
                .resolved_outputs(&self.config)
                .into_iter()
                .map(|s| s.name)
                .collect();
            slots.push(SlotDescriptor {
                request_id: slot.request_id,
                seq_id: seq.seq_id(),
                phase: slot.phase,
                slot_mapping: seq.block_table().slot_mapping(start_pos, token_ids.len()),
                block_ids: seq.block_table().block_ids().to_vec(),
                start_pos,
                token_ids,
                output_names,
            });
        }
        BatchDescriptor {
            slots,
            block_copies: batch.block_copies.clone(),
        }
    }

    /// Post-process one request's slots: cache bookkeeping, captures,
    /// decode, and response assembly. Slot failures terminate only this
    /// request.
    fn process_request_step(&mut self, group: RequestGroup) -> Result<Option<Response>> {
        let request_id = group.request_id;

        let failure = group
            .slots
            .iter()
            .find_map(|(_, _, result)| result.as_ref().err().cloned());
        if let Some(message) = failure {
            warn!(request_id, error = %message, "slot failed, terminating request");
            let _ = self.scheduler.remove(request_id, &mut self.cache);
            self.decoders.remove(&request_id);
            return Ok(Some(self.assembler.terminal(
                request_id,
                FinishReason::Error,
                Some(message),
            )));
        }

        let Some(entry) = self.scheduler.entry_mut(request_id) else {
            // Cancelled between scheduling and completion
            return Ok(None);
        };
        let was_context = !entry.context_done;

        let mut logits: Vec<Tensor> = Vec::with_capacity(group.slots.len());
        for (seq_index, _, result) in &group.slots {
            let output = result.as_ref().unwrap();
            let seq = &mut entry.sequences[*seq_index];
            let fed = seq.num_uncached_tokens();
            seq.mark_cached(fed);
            logits.push(output.logits.clone());
        }

        // Beam 0's auxiliary tensors feed the capture buffers
        if let Some((_, phase, result)) = group.slots.first() {
            let aux = &result.as_ref().unwrap().additional;
            if *phase == Phase::Context && was_context {
                self.assembler.record_context(request_id, aux);
            } else {
                self.assembler.record_generation(request_id, aux)?;
            }
            // Prompt blocks become shareable once their contents exist
            if *phase == Phase::Context {
                self.cache.register_prompt(&entry.sequences[0]);
            }
        }

        let decoder = self.decoders.get_mut(&request_id).unwrap();
        let decision = decoder.decode_step(
            &mut entry.sequences,
            &mut self.cache,
            &logits,
            &mut self.next_seq_id,
        )?;
        entry.context_done = true;
        entry.last_progress = Instant::now();

        let entry = self.scheduler.entry(request_id).unwrap();
        let response = self.assembler.on_step(
            request_id,
            &decision.step_tokens,
            &entry.sequences,
            decision.finish,
        )?;

        if let Some(reason) = decision.finish {
            debug!(request_id, reason = ?reason, "request finished");
            self.scheduler.remove(request_id, &mut self.cache)?;
            self.decoders.remove(&request_id);
        }
        Ok(response)
    }

    /// A fatal failure ends the executor's ability to serve: every live
    /// request gets a terminal error response.
    fn fail_all(&mut self, message: &str) {
        let mut responses = Vec::new();
        for request_id in self.scheduler.live_request_ids() {
            let _ = self.scheduler.remove(request_id, &mut self.cache);
            self.decoders.remove(&request_id);
            responses.push(self.assembler.terminal(
                request_id,
                FinishReason::Error,
                Some(message.to_string()),
            ));
        }
        self.publish(responses);
    }

    fn publish(&self, responses: Vec<Response>) {
        if responses.is_empty() {
            return;
        }
        let mut ready = self.shared.ready.lock().unwrap();
        for response in responses {
            ready.entry(response.request_id).or_default().push(response);
        }
        drop(ready);
        self.shared.available.notify_all();
    }
}

/// One request's slots for the step just run, in beam order.
struct RequestGroup {
    request_id: RequestId,
    slots: Vec<(usize, Phase, std::result::Result<SlotOutput, String>)>,
}

/// Slots of the same request are scheduled contiguously; regroup the
/// flat output list per request.
fn group_by_request(
    batch: &ScheduledBatch,
    outputs: Vec<std::result::Result<SlotOutput, String>>,
) -> Vec<RequestGroup> {
    let mut groups: Vec<RequestGroup> = Vec::new();
    for (slot, output) in batch.slots.iter().zip(outputs) {
        match groups.last_mut() {
            Some(group) if group.request_id == slot.request_id => {
                group.slots.push((slot.seq_index, slot.phase, output));
            }
            _ => groups.push(RequestGroup {
                request_id: slot.request_id,
                slots: vec![(slot.seq_index, slot.phase, output)],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ConstantRunner;

    fn small_config() -> ExecutorConfig {
        ExecutorConfig {
            max_batch_seqs: 8,
            max_batch_tokens: 256,
            tokens_per_block: 4,
            cache_token_budget: 256,
            ..ExecutorConfig::default()
        }
    }

    fn collect_final(executor: &Executor, request_id: RequestId) -> Vec<Response> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut collected = Vec::new();
        while Instant::now() < deadline {
            let mut batch = executor.await_responses(Some(Duration::from_millis(100)));
            if let Some(responses) = batch.remove(&request_id) {
                let done = responses.iter().any(|r| r.is_final);
                collected.extend(responses);
                if done {
                    return collected;
                }
            }
        }
        panic!("request {request_id} never finished");
    }

    #[test]
    fn test_single_request_round_trip() {
        let runner = ConstantRunner::descending(64, 4);
        let executor = Executor::new(small_config(), Box::new(runner)).unwrap();

        let id = executor.submit(Request::new(vec![1, 2, 3, 4], 4)).unwrap();
        let responses = collect_final(&executor, id);

        assert_eq!(responses.len(), 1);
        let resp = &responses[0];
        assert!(resp.is_ok());
        assert_eq!(resp.finish_reason, Some(FinishReason::MaxOutputLength));
        assert_eq!(resp.tokens.len(), 1);
        // Greedy over descending logits always picks token 0
        assert_eq!(resp.tokens[0], vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_submit_rejects_oversized_prompt() {
        let runner = ConstantRunner::descending(64, 4);
        let executor = Executor::new(small_config(), Box::new(runner)).unwrap();

        let oversized = Request::new((0..1000).collect(), 4);
        assert!(matches!(
            executor.submit(oversized),
            Err(Error::OversizedInput { .. })
        ));
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let runner = ConstantRunner::descending(64, 4);
        let mut executor = Executor::new(small_config(), Box::new(runner)).unwrap();
        executor.shutdown();
        assert!(matches!(
            executor.submit(Request::new(vec![1], 1)),
            Err(Error::ExecutorShutdown)
        ));
    }

    #[test]
    fn test_await_with_no_timeout_is_single_poll() {
        let runner = ConstantRunner::descending(64, 4);
        let executor = Executor::new(small_config(), Box::new(runner)).unwrap();
        let responses = executor.await_responses(None);
        assert!(responses.is_empty());
    }
}

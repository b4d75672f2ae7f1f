//! Per-iteration batch formation.
//!
//! Each iteration the scheduler re-forms the execution batch from the
//! live requests: already-running requests continue first (bounding their
//! tail latency), paused requests resume next, and queued requests are
//! admitted last, in priority-then-arrival order. When the cache budget
//! blocks progress, the lowest-priority running request is paused and its
//! blocks evicted; when eviction cannot help, admission is deferred to a
//! later iteration, never failed.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::ExecutorConfig;
use crate::core::cache::{BlockCopy, CacheManager};
use crate::core::request::{Request, RequestId};
use crate::core::sequence::{Sequence, SequenceId, SequenceStatus};
use crate::error::{Error, Result};
use crate::runner::Phase;

/// One sequence's assignment in the batch being formed.
#[derive(Debug, Clone, Copy)]
pub struct BatchSlot {
    pub request_id: RequestId,
    /// Index into the owning request's beam sequences.
    pub seq_index: usize,
    pub phase: Phase,
}

/// The scheduler's output for one iteration.
#[derive(Debug, Default)]
pub struct ScheduledBatch {
    pub slots: Vec<BatchSlot>,
    /// Physical copies the runner must perform before this batch.
    pub block_copies: Vec<BlockCopy>,
}

impl ScheduledBatch {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Live scheduler-side state for one request.
#[derive(Debug)]
pub struct RequestEntry {
    pub request_id: RequestId,
    pub request: Request,
    /// One sequence during the context phase, `beam_width` afterwards.
    pub sequences: Vec<Sequence>,
    /// Admission order tie-breaker.
    pub arrival_seq: u64,
    /// Last time this request made progress (or was admitted).
    pub last_progress: Instant,
    /// Whether the prompt has been processed and the first token produced.
    pub context_done: bool,
}

impl RequestEntry {
    pub fn status(&self) -> SequenceStatus {
        self.sequences[0].status()
    }

    pub fn priority(&self) -> i32 {
        self.request.priority
    }

    /// Tokens the model must consume to step every beam of this request.
    fn fed_tokens(&self) -> usize {
        self.sequences.iter().map(|s| s.num_uncached_tokens()).sum()
    }
}

/// Continuous-batching scheduler over live request entries.
#[derive(Debug)]
pub struct Scheduler {
    config: ExecutorConfig,
    entries: HashMap<RequestId, RequestEntry>,
    queued: VecDeque<RequestId>,
    running: Vec<RequestId>,
    paused: Vec<RequestId>,
    arrival_counter: u64,
}

impl Scheduler {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            queued: VecDeque::new(),
            running: Vec::new(),
            paused: Vec::new(),
            arrival_counter: 0,
        }
    }

    /// Enqueue a validated request for admission.
    pub fn add(&mut self, request_id: RequestId, request: Request, seq_id: SequenceId) {
        let sequence = Sequence::new(
            seq_id,
            request.prompt_token_ids.clone(),
            self.config.tokens_per_block,
        );
        let entry = RequestEntry {
            request_id,
            request,
            sequences: vec![sequence],
            arrival_seq: self.arrival_counter,
            last_progress: Instant::now(),
            context_done: false,
        };
        self.arrival_counter += 1;
        self.entries.insert(request_id, entry);
        self.queued.push_back(request_id);
        debug!(request_id, "request queued");
    }

    pub fn entry(&self, request_id: RequestId) -> Option<&RequestEntry> {
        self.entries.get(&request_id)
    }

    pub fn entry_mut(&mut self, request_id: RequestId) -> Option<&mut RequestEntry> {
        self.entries.get_mut(&request_id)
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub fn has_live_requests(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn live_request_ids(&self) -> Vec<RequestId> {
        self.entries.keys().copied().collect()
    }

    pub fn num_queued(&self) -> usize {
        self.queued.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_paused(&self) -> usize {
        self.paused.len()
    }

    /// Requests with no progress for longer than `max_idle`.
    pub fn idle_request_ids(&self, max_idle: Duration) -> Vec<RequestId> {
        let now = Instant::now();
        self.entries
            .values()
            .filter(|e| now.duration_since(e.last_progress) > max_idle)
            .map(|e| e.request_id)
            .collect()
    }

    /// Remove a request from the scheduler, releasing every block its
    /// beams hold. Used for completion, cancellation, errors, and idle
    /// timeouts.
    pub fn remove(&mut self, request_id: RequestId, cache: &mut CacheManager) -> Result<RequestEntry> {
        let mut entry = self
            .entries
            .remove(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        for seq in &mut entry.sequences {
            cache.release(seq);
            seq.set_finished();
        }
        self.queued.retain(|&id| id != request_id);
        self.running.retain(|&id| id != request_id);
        self.paused.retain(|&id| id != request_id);
        debug!(request_id, "request removed");
        Ok(entry)
    }

    /// Form the next batch. Mutates sequence status and cache state for
    /// every scheduling decision taken.
    pub fn schedule(&mut self, cache: &mut CacheManager) -> Result<ScheduledBatch> {
        let mut batch = BatchFormation::new(&self.config);

        self.continue_running(cache, &mut batch)?;
        self.resume_paused(cache, &mut batch)?;
        self.admit_queued(cache, &mut batch)?;

        Ok(ScheduledBatch {
            slots: batch.slots,
            block_copies: cache.take_pending_copies(),
        })
    }

    /// Keep already-running requests going before anything else.
    fn continue_running(&mut self, cache: &mut CacheManager, batch: &mut BatchFormation) -> Result<()> {
        for request_id in self.by_priority(&self.running) {
            // May have been paused as a victim earlier in this pass
            if !self.running.contains(&request_id) {
                continue;
            }
            let entry = &self.entries[&request_id];
            let num_seqs = entry.sequences.len();
            let fed = entry.fed_tokens();
            let priority = entry.priority();
            if !batch.fits(num_seqs, fed) {
                continue;
            }

            while !self.can_continue(request_id, cache) {
                // Victims must not outrank the request being continued
                match self.pick_victim(Some(request_id), Some(priority.saturating_add(1))) {
                    Some(victim) => self.pause(victim, cache, batch)?,
                    None => break,
                }
            }
            if !self.can_continue(request_id, cache) {
                // Deferred; cached state is retained and retried later
                continue;
            }

            let entry = self.entries.get_mut(&request_id).unwrap();
            for (seq_index, seq) in entry.sequences.iter_mut().enumerate() {
                let delta = seq.total_len() - seq.block_table().num_tokens();
                cache.acquire(seq, delta)?;
                batch.push(request_id, seq_index, phase_of(seq));
            }
            batch.consume(num_seqs, fed);
        }
        Ok(())
    }

    /// Resume paused requests by recomputing their cache, before any new
    /// admission. No eviction is performed to make room for a resume.
    fn resume_paused(&mut self, cache: &mut CacheManager, batch: &mut BatchFormation) -> Result<()> {
        for request_id in self.by_priority(&self.paused) {
            let entry = &self.entries[&request_id];
            let num_seqs = entry.sequences.len();
            let fed = entry.fed_tokens();
            if !batch.fits(num_seqs, fed) {
                continue;
            }
            let needed: usize = entry
                .sequences
                .iter()
                .map(|s| cache.blocks_needed(s, s.total_len()))
                .sum();
            if !cache.pool().can_allocate(needed) {
                continue;
            }

            let entry = self.entries.get_mut(&request_id).unwrap();
            for (seq_index, seq) in entry.sequences.iter_mut().enumerate() {
                cache.acquire(seq, seq.total_len())?;
                seq.set_running()?;
                batch.push(request_id, seq_index, Phase::Context);
            }
            self.paused.retain(|&id| id != request_id);
            self.running.push(request_id);
            batch.consume(num_seqs, fed);
            info!(request_id, "request resumed");
        }
        Ok(())
    }

    /// Admit queued requests in priority-then-arrival order. A request
    /// that cannot be admitted defers everything behind it, preserving
    /// order.
    fn admit_queued(&mut self, cache: &mut CacheManager, batch: &mut BatchFormation) -> Result<()> {
        for request_id in self.by_priority(&self.queued) {
            let entry = &self.entries[&request_id];
            let prompt_len = entry.request.prompt_len();
            let priority = entry.priority();
            if !batch.fits(1, prompt_len) {
                break;
            }

            loop {
                let entry = self.entries.get_mut(&request_id).unwrap();
                match cache.acquire_prompt(&mut entry.sequences[0]) {
                    Ok(shared_tokens) => {
                        entry.sequences[0].set_running()?;
                        self.queued.retain(|&id| id != request_id);
                        self.running.push(request_id);
                        batch.push(request_id, 0, Phase::Context);
                        batch.consume(1, prompt_len);
                        debug!(request_id, prompt_len, shared_tokens, "request admitted");
                        break;
                    }
                    Err(Error::OutOfBlocks) => {
                        // Evict only strictly lower-priority running work
                        match self.pick_victim(None, Some(priority)) {
                            Some(victim) => self.pause(victim, cache, batch)?,
                            None => return Ok(()),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn can_continue(&self, request_id: RequestId, cache: &CacheManager) -> bool {
        let entry = &self.entries[&request_id];
        let needed: usize = entry
            .sequences
            .iter()
            .map(|s| cache.blocks_needed(s, s.total_len() - s.block_table().num_tokens()))
            .sum();
        cache.pool().can_allocate(needed)
    }

    /// Candidate ids sorted by (priority desc, arrival asc).
    fn by_priority<'a, I>(&self, ids: I) -> Vec<RequestId>
    where
        I: IntoIterator<Item = &'a RequestId>,
    {
        let mut sorted: Vec<RequestId> = ids.into_iter().copied().collect();
        sorted.sort_by_key(|id| {
            let e = &self.entries[id];
            (std::cmp::Reverse(e.priority()), e.arrival_seq)
        });
        sorted
    }

    /// Pick the eviction victim: the lowest-priority, most-recently
    /// admitted running request, optionally excluding one id and capping
    /// the victim's priority.
    fn pick_victim(&self, exclude: Option<RequestId>, below_priority: Option<i32>) -> Option<RequestId> {
        if !self.config.scheduler.enable_pausing {
            return None;
        }
        self.running
            .iter()
            .copied()
            .filter(|&id| Some(id) != exclude)
            .filter(|&id| match below_priority {
                Some(p) => self.entries[&id].priority() < p,
                None => true,
            })
            .min_by_key(|&id| {
                let e = &self.entries[&id];
                (e.priority(), std::cmp::Reverse(e.arrival_seq))
            })
    }

    /// Pause a running request: evict its blocks, retain logical state,
    /// and withdraw any slots it already holds in the batch being formed.
    fn pause(&mut self, request_id: RequestId, cache: &mut CacheManager, batch: &mut BatchFormation) -> Result<()> {
        let entry = self.entries.get_mut(&request_id).unwrap();
        let withdrawn_seqs = batch.withdraw(request_id);
        if withdrawn_seqs > 0 {
            let fed = entry.fed_tokens();
            batch.refund(entry.sequences.len(), fed);
        }
        for seq in &mut entry.sequences {
            cache.evict(seq);
            seq.set_paused()?;
        }
        self.running.retain(|&id| id != request_id);
        self.paused.push(request_id);
        info!(request_id, "request paused for memory");
        Ok(())
    }
}

fn phase_of(seq: &Sequence) -> Phase {
    if seq.cached_tokens() == 0 {
        Phase::Context
    } else {
        Phase::Generation
    }
}

/// Budget tracking for the batch under construction.
struct BatchFormation {
    slots: Vec<BatchSlot>,
    seqs_used: usize,
    tokens_used: usize,
    max_seqs: usize,
    max_tokens: usize,
}

impl BatchFormation {
    fn new(config: &ExecutorConfig) -> Self {
        Self {
            slots: Vec::new(),
            seqs_used: 0,
            tokens_used: 0,
            max_seqs: config.max_batch_seqs,
            max_tokens: config.max_batch_tokens,
        }
    }

    fn fits(&self, num_seqs: usize, num_tokens: usize) -> bool {
        self.seqs_used + num_seqs <= self.max_seqs && self.tokens_used + num_tokens <= self.max_tokens
    }

    fn consume(&mut self, num_seqs: usize, num_tokens: usize) {
        self.seqs_used += num_seqs;
        self.tokens_used += num_tokens;
    }

    fn refund(&mut self, num_seqs: usize, num_tokens: usize) {
        self.seqs_used -= num_seqs.min(self.seqs_used);
        self.tokens_used -= num_tokens.min(self.tokens_used);
    }

    fn push(&mut self, request_id: RequestId, seq_index: usize, phase: Phase) {
        self.slots.push(BatchSlot {
            request_id,
            seq_index,
            phase,
        });
    }

    /// Remove a request's slots from the batch under construction.
    /// Returns how many were withdrawn.
    fn withdraw(&mut self, request_id: RequestId) -> usize {
        let before = self.slots.len();
        self.slots.retain(|s| s.request_id != request_id);
        before - self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cache_tokens: usize) -> ExecutorConfig {
        ExecutorConfig {
            max_batch_seqs: 8,
            max_batch_tokens: 64,
            tokens_per_block: 4,
            cache_token_budget: cache_tokens,
            ..ExecutorConfig::default()
        }
    }

    fn setup(cache_tokens: usize) -> (Scheduler, CacheManager) {
        let cfg = config(cache_tokens);
        let cache = CacheManager::new(cfg.num_blocks(), cfg.tokens_per_block, true);
        (Scheduler::new(cfg), cache)
    }

    /// Simulate the post-step bookkeeping the executor performs.
    fn complete_step(scheduler: &mut Scheduler, request_id: RequestId, token: u32) {
        let entry = scheduler.entry_mut(request_id).unwrap();
        for seq in &mut entry.sequences {
            let fed = seq.num_uncached_tokens();
            seq.mark_cached(fed);
            seq.append_token(token);
        }
        entry.context_done = true;
        entry.last_progress = Instant::now();
    }

    #[test]
    fn test_admits_in_arrival_order() {
        let (mut scheduler, mut cache) = setup(64);
        scheduler.add(1, Request::new(vec![1, 2, 3, 4], 4), 1);
        scheduler.add(2, Request::new(vec![5, 6, 7, 8], 4), 2);

        let batch = scheduler.schedule(&mut cache).unwrap();
        assert_eq!(batch.slots.len(), 2);
        assert_eq!(batch.slots[0].request_id, 1);
        assert_eq!(batch.slots[1].request_id, 2);
        assert!(matches!(batch.slots[0].phase, Phase::Context));
        assert_eq!(scheduler.num_running(), 2);
        assert_eq!(scheduler.num_queued(), 0);
    }

    #[test]
    fn test_higher_priority_admitted_first() {
        let (mut scheduler, mut cache) = setup(64);
        scheduler.add(1, Request::new(vec![1, 2], 4), 1);
        scheduler.add(2, Request::new(vec![3, 4], 4).priority(5), 2);

        let batch = scheduler.schedule(&mut cache).unwrap();
        assert_eq!(batch.slots[0].request_id, 2);
        assert_eq!(batch.slots[1].request_id, 1);
    }

    #[test]
    fn test_running_continues_before_admission() {
        let (mut scheduler, mut cache) = setup(64);
        scheduler.add(1, Request::new(vec![1, 2, 3, 4], 4), 1);
        scheduler.schedule(&mut cache).unwrap();
        complete_step(&mut scheduler, 1, 100);

        scheduler.add(2, Request::new(vec![5, 6, 7, 8], 4), 2);
        let batch = scheduler.schedule(&mut cache).unwrap();

        assert_eq!(batch.slots.len(), 2);
        assert_eq!(batch.slots[0].request_id, 1);
        assert!(matches!(batch.slots[0].phase, Phase::Generation));
        assert_eq!(batch.slots[1].request_id, 2);
        assert!(matches!(batch.slots[1].phase, Phase::Context));
    }

    #[test]
    fn test_admission_deferred_when_cache_full() {
        // 4 blocks of 4 tokens; first prompt takes all of them
        let (mut scheduler, mut cache) = setup(16);
        scheduler.add(1, Request::new((0..16).collect(), 4), 1);
        scheduler.schedule(&mut cache).unwrap();

        // Same priority: never evicted to admit, so request 2 defers
        scheduler.add(2, Request::new((20..24).collect(), 4), 2);
        complete_step(&mut scheduler, 1, 100);
        let batch = scheduler.schedule(&mut cache).unwrap();
        assert_eq!(scheduler.num_queued(), 1);
        // Request 1 itself cannot get its next block either; deferred too
        assert!(batch.is_empty());

        // Finishing request 1 frees the pool and request 2 admits
        scheduler.remove(1, &mut cache).unwrap();
        let batch = scheduler.schedule(&mut cache).unwrap();
        assert_eq!(batch.slots.len(), 1);
        assert_eq!(batch.slots[0].request_id, 2);
    }

    #[test]
    fn test_high_priority_admission_pauses_low_priority() {
        let (mut scheduler, mut cache) = setup(16);
        scheduler.add(1, Request::new((0..16).collect(), 4), 1);
        scheduler.schedule(&mut cache).unwrap();
        complete_step(&mut scheduler, 1, 100);

        scheduler.add(2, Request::new((20..24).collect(), 4).priority(10), 2);
        let batch = scheduler.schedule(&mut cache).unwrap();

        assert_eq!(scheduler.num_paused(), 1);
        assert_eq!(scheduler.num_running(), 1);
        assert_eq!(batch.slots.len(), 1);
        assert_eq!(batch.slots[0].request_id, 2);
        let paused = scheduler.entry(1).unwrap();
        assert_eq!(paused.status(), SequenceStatus::Paused);
        assert!(paused.sequences[0].block_table().is_empty());
    }

    #[test]
    fn test_continuation_evicts_newest_equal_priority_peer() {
        // 2 blocks of 4 tokens; both prompts fill the pool exactly
        let (mut scheduler, mut cache) = setup(8);
        scheduler.add(1, Request::new((0..4).collect(), 4), 1);
        scheduler.add(2, Request::new((10..14).collect(), 4), 2);
        scheduler.schedule(&mut cache).unwrap();
        complete_step(&mut scheduler, 1, 100);
        complete_step(&mut scheduler, 2, 100);

        // Both need a fresh block to continue; the older request wins and
        // the newest equal-priority peer is paused.
        let batch = scheduler.schedule(&mut cache).unwrap();
        assert_eq!(batch.slots.len(), 1);
        assert_eq!(batch.slots[0].request_id, 1);
        assert!(matches!(batch.slots[0].phase, Phase::Generation));
        assert_eq!(scheduler.entry(2).unwrap().status(), SequenceStatus::Paused);
    }

    #[test]
    fn test_continuation_never_evicts_higher_priority() {
        let (mut scheduler, mut cache) = setup(8);
        scheduler.add(1, Request::new((0..4).collect(), 4), 1);
        scheduler.add(2, Request::new((10..14).collect(), 4).priority(5), 2);
        scheduler.schedule(&mut cache).unwrap();
        complete_step(&mut scheduler, 1, 100);
        complete_step(&mut scheduler, 2, 100);

        // The priority-5 request continues first and evicts its peer
        let batch = scheduler.schedule(&mut cache).unwrap();
        assert_eq!(batch.slots.len(), 1);
        assert_eq!(batch.slots[0].request_id, 2);
        assert_eq!(scheduler.entry(1).unwrap().status(), SequenceStatus::Paused);
    }

    #[test]
    fn test_paused_resumes_by_recompute_before_new_admission() {
        let (mut scheduler, mut cache) = setup(16);
        scheduler.add(1, Request::new((0..8).collect(), 4), 1);
        scheduler.schedule(&mut cache).unwrap();
        complete_step(&mut scheduler, 1, 100);

        scheduler.add(2, Request::new((20..32).collect(), 4).priority(10), 2);
        scheduler.schedule(&mut cache).unwrap();
        assert_eq!(scheduler.entry(1).unwrap().status(), SequenceStatus::Paused);
        complete_step(&mut scheduler, 2, 100);

        // Free the pool; the paused request should come back as a context
        // slot recomputing its full history, ahead of a new queued request
        scheduler.remove(2, &mut cache).unwrap();
        scheduler.add(3, Request::new((40..44).collect(), 4), 3);
        let batch = scheduler.schedule(&mut cache).unwrap();

        assert_eq!(batch.slots[0].request_id, 1);
        assert!(matches!(batch.slots[0].phase, Phase::Context));
        let entry = scheduler.entry(1).unwrap();
        // Recompute feeds the full history: 8 prompt + 1 generated
        assert_eq!(entry.sequences[0].num_uncached_tokens(), 9);
        assert_eq!(entry.sequences[0].block_table().num_tokens(), 9);
    }

    #[test]
    fn test_pausing_disabled_defers_instead() {
        let cfg = ExecutorConfig {
            tokens_per_block: 4,
            cache_token_budget: 16,
            scheduler: crate::config::SchedulerConfig {
                enable_pausing: false,
                enable_prefix_sharing: true,
            },
            ..ExecutorConfig::default()
        };
        let mut cache = CacheManager::new(cfg.num_blocks(), cfg.tokens_per_block, true);
        let mut scheduler = Scheduler::new(cfg);

        scheduler.add(1, Request::new((0..16).collect(), 4), 1);
        scheduler.schedule(&mut cache).unwrap();
        scheduler.add(2, Request::new((20..24).collect(), 4).priority(10), 2);
        scheduler.schedule(&mut cache).unwrap();

        assert_eq!(scheduler.num_paused(), 0);
        assert_eq!(scheduler.num_queued(), 1);
    }

    #[test]
    fn test_remove_releases_blocks() {
        let (mut scheduler, mut cache) = setup(16);
        scheduler.add(1, Request::new((0..16).collect(), 4), 1);
        scheduler.schedule(&mut cache).unwrap();
        assert_eq!(cache.num_free_blocks(), 0);

        scheduler.remove(1, &mut cache).unwrap();
        assert_eq!(cache.num_free_blocks(), 4);
        assert!(!scheduler.has_live_requests());
        assert!(matches!(
            scheduler.remove(1, &mut cache),
            Err(Error::RequestNotFound(1))
        ));
    }

    #[test]
    fn test_token_budget_limits_admission() {
        let cfg = ExecutorConfig {
            max_batch_tokens: 10,
            tokens_per_block: 4,
            cache_token_budget: 64,
            ..ExecutorConfig::default()
        };
        let mut cache = CacheManager::new(cfg.num_blocks(), cfg.tokens_per_block, true);
        let mut scheduler = Scheduler::new(cfg);

        scheduler.add(1, Request::new((0..8).collect(), 4), 1);
        scheduler.add(2, Request::new((0..8).collect(), 4), 2);
        let batch = scheduler.schedule(&mut cache).unwrap();

        // Only the first prompt fits the 10-token batch budget
        assert_eq!(batch.slots.len(), 1);
        assert_eq!(scheduler.num_queued(), 1);
    }

    #[test]
    fn test_idle_requests_reported() {
        let (mut scheduler, _cache) = setup(64);
        scheduler.add(1, Request::new(vec![1], 4), 1);
        assert!(scheduler.idle_request_ids(Duration::from_secs(60)).is_empty());
        assert_eq!(scheduler.idle_request_ids(Duration::ZERO).len(), 1);
    }
}

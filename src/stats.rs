use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Instant,
};

use chrono::Utc;
use crossbeam::queue::ArrayQueue;

use crate::{
    evaluator::models::EvalReason,
    models::{AccessLogEntry, ApiCallStats, ErrorStats, StatsSnapshot, TimingStats},
};

/// Which error tally an API failure lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Auth,
    Config,
    Other,
}

#[derive(Debug, Default)]
struct Timings {
    total_ms: f64,
    count: u64,
    min_ms: f64,
    max_ms: f64,
}

struct StatsInner {
    total_evaluations: u64,
    blocked_evaluations: u64,
    coercion_errors: u64,
    invalid_inputs: u64,
    segment_matches: u64,
    rollout_evaluations: u64,
    api_calls: ApiCallStats,
    errors: ErrorStats,
    timings: Timings,
    unique_users: HashMap<String, Instant>,
    unique_flags: HashMap<String, Instant>,
    last_sync: Option<chrono::DateTime<Utc>>,
    last_log_upload: Option<chrono::DateTime<Utc>>,
}

/// Records access events and aggregate counters under bounded memory.
///
/// `record` is enqueue-only; the background flush loop drains the queue and
/// uploads batches. Counters are eventually consistent across threads, the
/// queue is bounded and displaces its oldest entry when full — analytics
/// loss is acceptable, evaluation correctness is not.
pub struct StatsTracker {
    max_unique_users: usize,
    max_unique_flags: usize,
    inner: Mutex<StatsInner>,
    queue: ArrayQueue<AccessLogEntry>,
    dropped_entries: AtomicU64,
}

impl StatsTracker {
    pub const DEFAULT_MAX_UNIQUE_USERS: usize = 10_000;
    pub const DEFAULT_MAX_UNIQUE_FLAGS: usize = 1_000;
    pub const DEFAULT_MAX_PENDING_LOGS: usize = 10_000;

    pub fn new(max_unique_users: usize, max_unique_flags: usize, max_pending_logs: usize) -> Self {
        Self {
            max_unique_users: max_unique_users.max(1),
            max_unique_flags: max_unique_flags.max(1),
            inner: Mutex::new(StatsInner {
                total_evaluations: 0,
                blocked_evaluations: 0,
                coercion_errors: 0,
                invalid_inputs: 0,
                segment_matches: 0,
                rollout_evaluations: 0,
                api_calls: ApiCallStats::default(),
                errors: ErrorStats::default(),
                timings: Timings::default(),
                unique_users: HashMap::new(),
                unique_flags: HashMap::new(),
                last_sync: None,
                last_log_upload: None,
            }),
            queue: ArrayQueue::new(max_pending_logs.max(1)),
            dropped_entries: AtomicU64::new(0),
        }
    }

    /// Queues an access log entry and folds it into the counters. Never
    /// blocks the evaluation path; a full queue drops its oldest entry.
    pub fn record(&self, entry: AccessLogEntry) {
        {
            let mut inner = self.inner.lock().expect("stats lock should not be poisoned");
            inner.total_evaluations += 1;
            match entry.reason {
                EvalReason::RateLimited => inner.blocked_evaluations += 1,
                EvalReason::InvalidInput => inner.invalid_inputs += 1,
                _ => {}
            }
            if entry.segment_matched {
                inner.segment_matches += 1;
            }
            if entry.rollout_bucket.is_some() {
                inner.rollout_evaluations += 1;
            }
            if entry.evaluation_time_ms > 0.0 {
                let t = &mut inner.timings;
                if t.count == 0 || entry.evaluation_time_ms < t.min_ms {
                    t.min_ms = entry.evaluation_time_ms;
                }
                if entry.evaluation_time_ms > t.max_ms {
                    t.max_ms = entry.evaluation_time_ms;
                }
                t.total_ms += entry.evaluation_time_ms;
                t.count += 1;
            }
            let now = Instant::now();
            Self::track_bounded(&mut inner.unique_users, &entry.user_id, now, self.max_unique_users);
            Self::track_bounded(&mut inner.unique_flags, &entry.flag_key, now, self.max_unique_flags);
        }

        if self.queue.force_push(entry).is_some() {
            self.dropped_entries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_coercion_error(&self) {
        let mut inner = self.inner.lock().expect("stats lock should not be poisoned");
        inner.coercion_errors += 1;
    }

    /// Counts an evaluation call rejected before it reached the evaluator
    /// (empty or oversized user id / flag key). No access entry is queued
    /// for these, the inputs cannot be trusted.
    pub fn record_invalid_input(&self) {
        let mut inner = self.inner.lock().expect("stats lock should not be poisoned");
        inner.invalid_inputs += 1;
    }

    pub fn record_api_success(&self) {
        let mut inner = self.inner.lock().expect("stats lock should not be poisoned");
        inner.api_calls.successful += 1;
        inner.api_calls.total += 1;
    }

    pub fn record_api_failure(&self, kind: ErrorKind) {
        let mut inner = self.inner.lock().expect("stats lock should not be poisoned");
        inner.api_calls.failed += 1;
        inner.api_calls.total += 1;
        match kind {
            ErrorKind::Network => inner.errors.network_errors += 1,
            ErrorKind::Auth => inner.errors.auth_errors += 1,
            ErrorKind::Config => inner.errors.config_errors += 1,
            ErrorKind::Other => inner.errors.other_errors += 1,
        }
    }

    pub fn mark_sync(&self) {
        let mut inner = self.inner.lock().expect("stats lock should not be poisoned");
        inner.last_sync = Some(Utc::now());
    }

    pub fn mark_log_upload(&self) {
        let mut inner = self.inner.lock().expect("stats lock should not be poisoned");
        inner.last_log_upload = Some(Utc::now());
    }

    /// Pops at most `max` queued entries for an upload batch.
    pub fn drain_logs(&self, max: usize) -> Vec<AccessLogEntry> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        while batch.len() < max {
            match self.queue.pop() {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        batch
    }

    /// Puts entries back after a failed upload. Anything the queue cannot
    /// hold counts as dropped.
    pub fn requeue_logs(&self, batch: Vec<AccessLogEntry>) {
        for entry in batch {
            if self.queue.force_push(entry).is_some() {
                self.dropped_entries.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn pending_logs(&self) -> usize {
        self.queue.len()
    }

    /// Point-in-time copy of every counter; never a live reference.
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().expect("stats lock should not be poisoned");
        let timings = TimingStats {
            count: inner.timings.count,
            total_ms: inner.timings.total_ms,
            min_ms: if inner.timings.count == 0 { 0.0 } else { inner.timings.min_ms },
            max_ms: inner.timings.max_ms,
            avg_ms: if inner.timings.count == 0 {
                0.0
            } else {
                inner.timings.total_ms / inner.timings.count as f64
            },
        };
        StatsSnapshot {
            total_evaluations: inner.total_evaluations,
            blocked_evaluations: inner.blocked_evaluations,
            coercion_errors: inner.coercion_errors,
            invalid_inputs: inner.invalid_inputs,
            segment_matches: inner.segment_matches,
            rollout_evaluations: inner.rollout_evaluations,
            unique_users_count: inner.unique_users.len(),
            unique_flags_count: inner.unique_flags.len(),
            api_calls: inner.api_calls.clone(),
            errors: inner.errors.clone(),
            evaluation_times: timings,
            pending_log_entries: self.queue.len(),
            dropped_log_entries: self.dropped_entries.load(Ordering::Relaxed),
            last_sync: inner.last_sync,
            last_log_upload: inner.last_log_upload,
        }
    }

    fn track_bounded(map: &mut HashMap<String, Instant>, key: &str, now: Instant, cap: usize) {
        if let Some(seen) = map.get_mut(key) {
            *seen = now;
            return;
        }
        if map.len() >= cap {
            let oldest = map
                .iter()
                .min_by_key(|(_, seen)| **seen)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                map.remove(&k);
            }
        }
        map.insert(key.to_string(), now);
    }
}

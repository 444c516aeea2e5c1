//! Time- and interval-based deferred reducer invocation (spec §4.8),
//! grounded on `ReducerScheduler`/`ScheduledReducerCall`/`ScheduleStatus`
//! in `examples/original_source/src/spacetimedb_sdk/scheduling.py`, with
//! the string-uuid schedule id replaced by the crate's usual monotonic
//! integer handle (`ids::IdAllocator`'s pattern) since there is no uuid
//! dependency in this crate's stack.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use crate::error::{Result, ScheduleError};
use crate::time::{Duration, ScheduleAt, Timestamp};

/// Opaque handle for one scheduled entry, minted by [`Scheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleMetrics {
    pub total_executions: u64,
    pub total_duration: Duration,
    pub success_count: u64,
    pub failure_count: u64,
}

impl ScheduleMetrics {
    pub fn average_duration(&self) -> Duration {
        if self.total_executions == 0 {
            return Duration::zero();
        }
        Duration::from_micros(self.total_duration.as_micros() / self.total_executions as i64)
    }
}

/// One scheduled reducer invocation, spec §4.8's entry shape.
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub id: ScheduleId,
    pub reducer_name: String,
    pub args: Bytes,
    pub schedule: ScheduleAt,
    pub state: ScheduleState,
    pub execution_count: u64,
    pub last_execution: Option<Timestamp>,
    pub next_execution: Timestamp,
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,
    pub metrics: ScheduleMetrics,
}

/// What [`Scheduler::run_ready`] abstracts over to actually invoke a
/// reducer; the connection runtime implements this against a live
/// request tracker. A mock implementation is used in tests.
#[async_trait]
pub trait ReducerInvoker: Send + Sync {
    async fn call_reducer(&self, reducer_name: &str, args: &Bytes) -> Result<()>;
}

/// One schedule's outcome from a single [`Scheduler::run_ready`] tick.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub id: ScheduleId,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

struct SchedulerState {
    entries: HashMap<ScheduleId, ScheduledEntry>,
    queue: BTreeSet<(i64, ScheduleId)>,
}

/// Owns the scheduled-entry registry and the next-execution priority
/// queue, spec §4.8.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    next_id: AtomicU64,
    max_concurrent_executions: usize,
}

impl Scheduler {
    pub fn new(max_concurrent_executions: usize) -> Self {
        Self {
            state: Mutex::new(SchedulerState { entries: HashMap::new(), queue: BTreeSet::new() }),
            next_id: AtomicU64::new(1),
            max_concurrent_executions,
        }
    }

    /// Registers a new entry, computing its first `next_execution` from
    /// `schedule` relative to `now`.
    pub fn schedule(
        &self,
        reducer_name: impl Into<String>,
        args: Bytes,
        schedule: ScheduleAt,
        metadata: HashMap<String, String>,
        now: Timestamp,
    ) -> ScheduleId {
        let id = ScheduleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let next_execution = schedule.next_from(now);
        let entry = ScheduledEntry {
            id,
            reducer_name: reducer_name.into(),
            args,
            schedule,
            state: ScheduleState::Pending,
            execution_count: 0,
            last_execution: None,
            next_execution,
            error: None,
            metadata,
            metrics: ScheduleMetrics::default(),
        };
        let mut state = self.state.lock().unwrap();
        state.queue.insert((next_execution.as_micros(), id));
        state.entries.insert(id, entry);
        id
    }

    /// Removes `id` from the queue and marks it cancelled; a no-op on an
    /// unknown id (spec §8's "at-most-once" ethos applied to cancellation).
    pub fn cancel(&self, id: ScheduleId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.get_mut(&id).ok_or(ScheduleError::NotFound)?;
        let key = (entry.next_execution.as_micros(), id);
        entry.state = ScheduleState::Cancelled;
        state.queue.remove(&key);
        Ok(())
    }

    /// Replaces `id`'s schedule and re-enqueues it at the newly computed
    /// `next_execution`, spec §4.8's "Reschedule replaces the schedule".
    pub fn reschedule(&self, id: ScheduleId, schedule: ScheduleAt, now: Timestamp) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.get_mut(&id).ok_or(ScheduleError::NotFound)?;
        let old_key = (entry.next_execution.as_micros(), id);
        state.queue.remove(&old_key);
        entry.schedule = schedule;
        entry.next_execution = schedule.next_from(now);
        entry.state = ScheduleState::Pending;
        state.queue.insert((entry.next_execution.as_micros(), id));
        Ok(())
    }

    pub fn get(&self, id: ScheduleId) -> Option<ScheduledEntry> {
        self.state.lock().unwrap().entries.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops every entry whose `next_execution <= now`, invokes each via
    /// `invoker` with at most `max_concurrent_executions` in flight, and
    /// updates state/metrics. `Every` entries are recomputed and
    /// re-enqueued; `At` entries complete once and are not requeued.
    pub async fn run_ready(&self, now: Timestamp, invoker: &dyn ReducerInvoker) -> Vec<ScheduleOutcome> {
        let due: Vec<ScheduleId> = {
            let mut state = self.state.lock().unwrap();
            let mut due = Vec::new();
            while let Some(&(ts, id)) = state.queue.iter().next() {
                if ts > now.as_micros() {
                    break;
                }
                state.queue.remove(&(ts, id));
                if let Some(entry) = state.entries.get_mut(&id) {
                    if entry.state == ScheduleState::Cancelled {
                        continue;
                    }
                    entry.state = ScheduleState::Executing;
                    due.push(id);
                }
            }
            due
        };

        let max_concurrent = self.max_concurrent_executions.max(1);
        let outcomes: Vec<ScheduleOutcome> = stream::iter(due.into_iter().map(|id| async move {
            let (reducer_name, args) = {
                let state = self.state.lock().unwrap();
                let entry = state.entries.get(&id).expect("entry exists for a just-popped id");
                (entry.reducer_name.clone(), entry.args.clone())
            };
            let start = now;
            let result = invoker.call_reducer(&reducer_name, &args).await;
            let duration = Timestamp::now().checked_sub_timestamp(start);
            (id, result, duration)
        }))
        .buffer_unordered(max_concurrent)
        .map(|(id, result, duration)| {
            let mut state = self.state.lock().unwrap();
            let entry = state.entries.get_mut(&id).expect("entry exists for a just-popped id");
            entry.execution_count += 1;
            entry.last_execution = Some(now);
            entry.metrics.total_executions += 1;
            entry.metrics.total_duration = entry.metrics.total_duration + duration;
            let (success, error) = match &result {
                Ok(()) => {
                    entry.metrics.success_count += 1;
                    (true, None)
                }
                Err(e) => {
                    entry.metrics.failure_count += 1;
                    (false, Some(e.to_string()))
                }
            };
            entry.error = error.clone();
            match (&entry.schedule, success) {
                (ScheduleAt::Every(interval), _) => {
                    entry.next_execution = now.checked_add(*interval);
                    entry.state = ScheduleState::Pending;
                    state.queue.insert((entry.next_execution.as_micros(), id));
                }
                (ScheduleAt::At(_), true) => entry.state = ScheduleState::Completed,
                (ScheduleAt::At(_), false) => entry.state = ScheduleState::Failed,
            }
            ScheduleOutcome { id, success, error, duration }
        })
        .collect()
        .await;

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingInvoker {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReducerInvoker for CountingInvoker {
        async fn call_reducer(&self, _reducer_name: &str, _args: &Bytes) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ScheduleError::InvalidSchedule("forced failure".into()).into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn at_schedule_completes_once() {
        let scheduler = Scheduler::new(10);
        let now = Timestamp::from_micros(0);
        let id = scheduler.schedule("my_reducer", Bytes::new(), ScheduleAt::at(now), HashMap::new(), now);

        let invoker = CountingInvoker { calls: AtomicUsize::new(0), fail: false };
        let outcomes = scheduler.run_ready(now, &invoker).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.get(id).unwrap().state, ScheduleState::Completed);

        let outcomes = scheduler.run_ready(now, &invoker).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn every_schedule_requeues_with_next_execution_advanced() {
        let scheduler = Scheduler::new(10);
        let now = Timestamp::from_micros(0);
        let interval = Duration::from_secs(10);
        let id = scheduler.schedule(
            "tick_reducer",
            Bytes::new(),
            ScheduleAt::every(interval).unwrap(),
            HashMap::new(),
            now,
        );

        let invoker = CountingInvoker { calls: AtomicUsize::new(0), fail: false };
        scheduler.run_ready(now, &invoker).await;
        let entry = scheduler.get(id).unwrap();
        assert_eq!(entry.state, ScheduleState::Pending);
        assert_eq!(entry.next_execution.as_micros(), now.as_micros() + interval.as_micros());
        assert_eq!(entry.execution_count, 1);

        let later = now.checked_add(interval);
        scheduler.run_ready(later, &invoker).await;
        assert_eq!(scheduler.get(id).unwrap().execution_count, 2);
    }

    #[tokio::test]
    async fn failed_execution_marks_entry_failed_for_at_schedule() {
        let scheduler = Scheduler::new(10);
        let now = Timestamp::from_micros(0);
        let id = scheduler.schedule("boom", Bytes::new(), ScheduleAt::at(now), HashMap::new(), now);
        let invoker = CountingInvoker { calls: AtomicUsize::new(0), fail: true };
        let outcomes = scheduler.run_ready(now, &invoker).await;
        assert!(!outcomes[0].success);
        let entry = scheduler.get(id).unwrap();
        assert_eq!(entry.state, ScheduleState::Failed);
        assert!(entry.error.is_some());
    }

    #[test]
    fn cancel_removes_from_queue() {
        let scheduler = Scheduler::new(10);
        let now = Timestamp::from_micros(0);
        let id = scheduler.schedule("x", Bytes::new(), ScheduleAt::at(now), HashMap::new(), now);
        scheduler.cancel(id).unwrap();
        assert_eq!(scheduler.get(id).unwrap().state, ScheduleState::Cancelled);
    }

    #[test]
    fn cancel_unknown_id_errors() {
        let scheduler = Scheduler::new(10);
        assert!(scheduler.cancel(ScheduleId(999)).is_err());
    }

    #[test]
    fn reschedule_updates_next_execution() {
        let scheduler = Scheduler::new(10);
        let now = Timestamp::from_micros(0);
        let id = scheduler.schedule(
            "x",
            Bytes::new(),
            ScheduleAt::at(now.checked_add(Duration::from_secs(5))),
            HashMap::new(),
            now,
        );
        let new_target = now.checked_add(Duration::from_secs(50));
        scheduler.reschedule(id, ScheduleAt::at(new_target), now).unwrap();
        assert_eq!(scheduler.get(id).unwrap().next_execution, new_target);
    }
}

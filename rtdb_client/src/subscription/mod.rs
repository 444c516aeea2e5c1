//! Subscription engine: per-query lifecycle tracking, single/multi
//! selection, and retry policy (spec §4.6), grounded on
//! `SubscriptionState`/`SubscriptionStrategy`/`RetryPolicy` in
//! `examples/original_source/src/spacetimedb_sdk/subscription_builder.py`.

pub mod delta;

use std::collections::HashMap;
use std::sync::RwLock;

use rand::Rng;

use crate::error::{Result, SubscriptionError as SubscriptionErrorKind};
use crate::ids::QueryId;
use crate::time::{Duration, Timestamp};

pub use delta::{classify, RowDelta};

/// Lifecycle state of one subscription, spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Error,
    Cancelled,
    Retrying,
}

/// How many queries a `QueryId` covers, and whether the caller forced it or
/// the adaptive default chose it, spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Single,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStrategy {
    ForceSingle,
    ForceMulti,
    Adaptive,
}

impl SubscriptionStrategy {
    /// Chooses single for 1 query, multi for 2-5, single for >5 under the
    /// adaptive default, spec §4.6's "Selection strategy".
    pub fn resolve(self, query_count: usize) -> SubscriptionKind {
        match self {
            SubscriptionStrategy::ForceSingle => SubscriptionKind::Single,
            SubscriptionStrategy::ForceMulti => SubscriptionKind::Multi,
            SubscriptionStrategy::Adaptive => {
                if (2..=5).contains(&query_count) {
                    SubscriptionKind::Multi
                } else {
                    SubscriptionKind::Single
                }
            }
        }
    }
}

/// Base delay / exponential backoff / jitter for subscription retries,
/// spec §4.6: "base delay × (2^attempt) with optional ±25% jitter, clamped
/// to max delay."
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionRetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for SubscriptionRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl SubscriptionRetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let raw = base_secs * 2f64.powi(attempt as i32);
        let clamped = raw.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            clamped * factor
        } else {
            clamped
        };
        Duration::from_secs_f64(jittered)
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionErrorInfo {
    pub message: String,
    pub retry_count: u32,
    pub at: Timestamp,
}

/// Per-query subscription record, spec §3's `Subscription` data model.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub query_id: QueryId,
    pub kind: SubscriptionKind,
    pub queries: Vec<String>,
    pub state: SubscriptionState,
    pub retry_count: u32,
    pub errors: Vec<SubscriptionErrorInfo>,
    pub created_at: Timestamp,
    pub applied_at: Option<Timestamp>,
}

impl Subscription {
    fn new(query_id: QueryId, kind: SubscriptionKind, queries: Vec<String>, now: Timestamp) -> Self {
        Self {
            query_id,
            kind,
            queries,
            state: SubscriptionState::Pending,
            retry_count: 0,
            errors: Vec::new(),
            created_at: now,
            applied_at: None,
        }
    }
}

/// Owns every subscription on one connection, keyed by [`QueryId`], and the
/// retry policy applied when the server reports a transient error.
pub struct SubscriptionEngine {
    subscriptions: RwLock<HashMap<QueryId, Subscription>>,
    retry_policy: SubscriptionRetryPolicy,
}

impl SubscriptionEngine {
    pub fn new(retry_policy: SubscriptionRetryPolicy) -> Self {
        Self { subscriptions: RwLock::new(HashMap::new()), retry_policy }
    }

    /// Registers a new pending subscription (spec §8 property 6: every
    /// `SubscribeApplied` has exactly one prior `Subscribe`).
    pub fn begin(&self, query_id: QueryId, kind: SubscriptionKind, queries: Vec<String>, now: Timestamp) {
        let mut subs = self.subscriptions.write().unwrap();
        subs.insert(query_id, Subscription::new(query_id, kind, queries, now));
    }

    /// Marks a subscription active once `SubscribeApplied` arrives.
    pub fn mark_applied(&self, query_id: QueryId, now: Timestamp) -> Result<()> {
        let mut subs = self.subscriptions.write().unwrap();
        let sub = subs
            .get_mut(&query_id)
            .ok_or_else(|| SubscriptionErrorKind::Rejected { reason: "unknown query id".into() })?;
        sub.state = SubscriptionState::Active;
        sub.applied_at = Some(now);
        Ok(())
    }

    /// Records a `SubscriptionError`. If retries remain, transitions to
    /// `Retrying` and returns the backoff delay to wait before resending;
    /// otherwise transitions to the terminal `Error` state.
    pub fn mark_error(&self, query_id: QueryId, message: String, now: Timestamp) -> Option<Duration> {
        let mut subs = self.subscriptions.write().unwrap();
        let Some(sub) = subs.get_mut(&query_id) else { return None };
        sub.errors.push(SubscriptionErrorInfo { message, retry_count: sub.retry_count, at: now });
        if sub.retry_count < self.retry_policy.max_retries {
            sub.state = SubscriptionState::Retrying;
            let delay = self.retry_policy.delay_for_attempt(sub.retry_count);
            sub.retry_count += 1;
            Some(delay)
        } else {
            sub.state = SubscriptionState::Error;
            None
        }
    }

    pub fn cancel(&self, query_id: QueryId) {
        let mut subs = self.subscriptions.write().unwrap();
        if let Some(sub) = subs.get_mut(&query_id) {
            sub.state = SubscriptionState::Cancelled;
        }
    }

    pub fn get(&self, query_id: QueryId) -> Option<Subscription> {
        self.subscriptions.read().unwrap().get(&query_id).cloned()
    }

    pub fn state_of(&self, query_id: QueryId) -> Option<SubscriptionState> {
        self.subscriptions.read().unwrap().get(&query_id).map(|s| s.state)
    }

    pub fn active_query_ids(&self) -> Vec<QueryId> {
        self.subscriptions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.state == SubscriptionState::Active)
            .map(|s| s.query_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_strategy_picks_multi_for_two_to_five_queries() {
        assert_eq!(SubscriptionStrategy::Adaptive.resolve(1), SubscriptionKind::Single);
        assert_eq!(SubscriptionStrategy::Adaptive.resolve(3), SubscriptionKind::Multi);
        assert_eq!(SubscriptionStrategy::Adaptive.resolve(5), SubscriptionKind::Multi);
        assert_eq!(SubscriptionStrategy::Adaptive.resolve(6), SubscriptionKind::Single);
    }

    #[test]
    fn begin_then_apply_transitions_to_active() {
        let engine = SubscriptionEngine::new(SubscriptionRetryPolicy::default());
        let now = Timestamp::from_micros(0);
        engine.begin(QueryId(1), SubscriptionKind::Single, vec!["SELECT * FROM t".into()], now);
        assert_eq!(engine.state_of(QueryId(1)), Some(SubscriptionState::Pending));
        engine.mark_applied(QueryId(1), now).unwrap();
        assert_eq!(engine.state_of(QueryId(1)), Some(SubscriptionState::Active));
    }

    #[test]
    fn error_retries_until_max_then_terminal() {
        let engine = SubscriptionEngine::new(SubscriptionRetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: false,
        });
        let now = Timestamp::from_micros(0);
        engine.begin(QueryId(1), SubscriptionKind::Single, vec!["q".into()], now);

        assert!(engine.mark_error(QueryId(1), "transient".into(), now).is_some());
        assert_eq!(engine.state_of(QueryId(1)), Some(SubscriptionState::Retrying));

        assert!(engine.mark_error(QueryId(1), "transient".into(), now).is_some());
        assert_eq!(engine.state_of(QueryId(1)), Some(SubscriptionState::Retrying));

        assert!(engine.mark_error(QueryId(1), "final".into(), now).is_none());
        assert_eq!(engine.state_of(QueryId(1)), Some(SubscriptionState::Error));
    }

    #[test]
    fn retry_delay_without_jitter_follows_exponential_backoff() {
        let policy = SubscriptionRetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0).as_secs_f64(), 1.0);
        assert_eq!(policy.delay_for_attempt(1).as_secs_f64(), 2.0);
        assert_eq!(policy.delay_for_attempt(2).as_secs_f64(), 4.0);
    }

    #[test]
    fn retry_delay_with_jitter_stays_in_bounds() {
        let policy = SubscriptionRetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        };
        for attempt in 0..4 {
            let delay = policy.delay_for_attempt(attempt).as_secs_f64();
            let expected = 2f64.powi(attempt as i32);
            assert!(delay >= expected * 0.75 - 1e-9 && delay <= expected * 1.25 + 1e-9);
        }
    }

    #[test]
    fn cancel_sets_terminal_state() {
        let engine = SubscriptionEngine::new(SubscriptionRetryPolicy::default());
        let now = Timestamp::from_micros(0);
        engine.begin(QueryId(1), SubscriptionKind::Single, vec!["q".into()], now);
        engine.cancel(QueryId(1));
        assert_eq!(engine.state_of(QueryId(1)), Some(SubscriptionState::Cancelled));
    }
}

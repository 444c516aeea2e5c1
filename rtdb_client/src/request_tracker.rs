//! Correlates outbound requests with their eventual server response.
//!
//! Grounded on `RequestTracker` in
//! `examples/original_source/src/spacetimedb_sdk/request_tracker.py`, with
//! the polling `get_response`/`remove_completed_response` pair replaced by a
//! `oneshot` channel per request, matching the request/response pattern
//! (`oneshot::Sender` stashed per in-flight query) used in
//! `examples/Protryon-klickhouse/klickhouse/src/client.rs`.

use indexmap::IndexMap;
use tokio::sync::oneshot;

use crate::codec::ServerMessage;
use crate::ids::RequestId;
use crate::time::{Duration, Timestamp};

const DEFAULT_TIMEOUT_SECS: i64 = 30;

struct PendingRequest {
    issued_at: Timestamp,
    timeout: Duration,
    reply: oneshot::Sender<ServerMessage>,
}

/// Tracks in-flight requests and wakes their waiters when a matching
/// response arrives, or when they time out.
#[derive(Default)]
pub struct RequestTracker {
    pending: IndexMap<RequestId, PendingRequest>,
    default_timeout: Duration,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            pending: IndexMap::new(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_default_timeout(default_timeout: Duration) -> Self {
        Self { pending: IndexMap::new(), default_timeout }
    }

    /// Registers `request_id` as awaiting a response, returning the receiver
    /// half the caller awaits on.
    pub fn track(&mut self, request_id: RequestId, now: Timestamp) -> oneshot::Receiver<ServerMessage> {
        self.track_with_timeout(request_id, now, self.default_timeout)
    }

    pub fn track_with_timeout(
        &mut self,
        request_id: RequestId,
        now: Timestamp,
        timeout: Duration,
    ) -> oneshot::Receiver<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, PendingRequest { issued_at: now, timeout, reply: tx });
        rx
    }

    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Delivers `response` to the waiter for `request_id`, if any is still
    /// pending. Returns whether a waiter was found (a `false` here for an
    /// unsolicited server message is not itself an error -- the caller
    /// decides whether that's expected, e.g. for broadcast-style updates).
    pub fn resolve(&mut self, request_id: RequestId, response: ServerMessage) -> bool {
        match self.pending.shift_remove(&request_id) {
            Some(entry) => {
                // Dropped receiver just means the caller stopped waiting; not an error.
                let _ = entry.reply.send(response);
                true
            }
            None => false,
        }
    }

    /// Drops (and thus fails) every request whose deadline has passed as of
    /// `now`, returning their ids.
    pub fn poll_timeouts(&mut self, now: Timestamp) -> Vec<RequestId> {
        let timed_out: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.checked_sub_timestamp(entry.issued_at) > entry.timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &timed_out {
            self.pending.shift_remove(id);
        }
        timed_out
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn oldest_pending_age(&self, now: Timestamp) -> Option<Duration> {
        self.pending
            .values()
            .map(|entry| now.checked_sub_timestamp(entry.issued_at))
            .max()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::message::IdentityTokenMessage;
    use crate::identity::{ConnectionId, Identity};

    fn dummy_response() -> ServerMessage {
        ServerMessage::IdentityToken(IdentityTokenMessage {
            identity: Identity::ANONYMOUS,
            token: "tok".into(),
            connection_id: ConnectionId::ZERO,
        })
    }

    #[tokio::test]
    async fn resolve_wakes_the_waiter() {
        let mut tracker = RequestTracker::new();
        let now = Timestamp::from_micros(0);
        let rx = tracker.track(RequestId(1), now);
        assert!(tracker.resolve(RequestId(1), dummy_response()));
        let received = rx.await.unwrap();
        assert!(matches!(received, ServerMessage::IdentityToken(_)));
    }

    #[test]
    fn resolve_unknown_request_returns_false() {
        let mut tracker = RequestTracker::new();
        assert!(!tracker.resolve(RequestId(99), dummy_response()));
    }

    #[test]
    fn poll_timeouts_evicts_expired_entries() {
        let mut tracker = RequestTracker::with_default_timeout(Duration::from_secs(5));
        let start = Timestamp::from_micros(0);
        tracker.track(RequestId(1), start);
        let later = start + Duration::from_secs(10);
        let timed_out = tracker.poll_timeouts(later);
        assert_eq!(timed_out, vec![RequestId(1)]);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn oldest_pending_age_tracks_the_earliest_entry() {
        let mut tracker = RequestTracker::new();
        let t0 = Timestamp::from_micros(0);
        tracker.track(RequestId(1), t0);
        tracker.track(RequestId(2), t0 + Duration::from_secs(2));
        let now = t0 + Duration::from_secs(5);
        assert_eq!(tracker.oldest_pending_age(now), Some(Duration::from_secs(5)));
    }
}

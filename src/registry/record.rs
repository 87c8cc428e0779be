// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscriber records: one per distinct delivery endpoint.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Maximum age of a backlog entry before it is dropped instead of served.
pub(crate) const BACKLOG_MAX_AGE: Duration = Duration::from_millis(3_000);

/// Lower clamp for a polling session lease.
pub(crate) const LEASE_MIN: Duration = Duration::from_millis(1_000);

/// Upper clamp for a polling session lease.
pub(crate) const LEASE_MAX: Duration = Duration::from_millis(60_000);

/// Lease used when a polling client does not ask for one.
pub(crate) const LEASE_DEFAULT: Duration = Duration::from_millis(30_000);

/// Consecutive webhook failures tolerated before the record is evicted.
pub(crate) const MAX_HOOK_FAILURES: u32 = 2;

/// Stable key for a delivery endpoint: the SHA-256 hex digest of the
/// endpoint identifier (webhook URL, or synthetic polling session id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey(String);

impl EndpointKey {
    /// Derives the key for an endpoint identifier.
    #[must_use]
    pub fn from_endpoint(endpoint: &str) -> Self {
        let digest = Sha256::digest(endpoint.as_bytes());
        Self(hex::encode(digest))
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first few bytes are plenty for log correlation.
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// How change events reach a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Pushed to a callback URL.
    Webhook,
    /// Pulled through a long-poll session.
    Polling,
}

/// Which namespace a watch entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// State value changes.
    State,
    /// Object metadata changes.
    Object,
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKind::State => write!(f, "state"),
            WatchKind::Object => write!(f, "object"),
        }
    }
}

/// A change event queued while no long-poll request was parked.
#[derive(Debug)]
pub(crate) struct QueuedEvent {
    pub(crate) payload: String,
    pub(crate) queued_at: Instant,
}

/// The parked half of a long-poll request.
#[derive(Debug)]
pub(crate) struct Waiter {
    /// Sequence number so a timed-out caller only clears its own waiter.
    pub(crate) seq: u64,
    pub(crate) tx: oneshot::Sender<String>,
}

/// Per-session long-poll state: at most one parked waiter, or a short
/// backlog of events awaiting the next poll.
#[derive(Debug)]
pub(crate) struct PollSession {
    pub(crate) lease: Duration,
    pub(crate) waiter: Option<Waiter>,
    pub(crate) backlog: VecDeque<QueuedEvent>,
    next_seq: u64,
}

impl PollSession {
    pub(crate) fn new(lease: Option<Duration>) -> Self {
        Self {
            lease: clamp_lease(lease.unwrap_or(LEASE_DEFAULT)),
            waiter: None,
            backlog: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Drops backlog entries older than [`BACKLOG_MAX_AGE`].
    pub(crate) fn evict_stale(&mut self, now: Instant) {
        while let Some(front) = self.backlog.front() {
            if now.duration_since(front.queued_at) > BACKLOG_MAX_AGE {
                self.backlog.pop_front();
            } else {
                break;
            }
        }
    }

    /// Hands `payload` to the parked waiter if one is live, otherwise
    /// queues it (evicting stale entries first).
    pub(crate) fn push_event(&mut self, payload: String, now: Instant) {
        self.evict_stale(now);
        if let Some(waiter) = self.waiter.take() {
            match waiter.tx.send(payload) {
                Ok(()) => return,
                // The poller went away (connection aborted); keep the event.
                Err(payload) => self.backlog.push_back(QueuedEvent {
                    payload,
                    queued_at: now,
                }),
            }
        } else {
            self.backlog.push_back(QueuedEvent {
                payload,
                queued_at: now,
            });
        }
    }
}

/// Transport-specific parts of a subscriber record.
#[derive(Debug)]
pub(crate) enum TransportState {
    Webhook {
        /// Failed deliveries since the last success.
        consecutive_failures: u32,
        /// Events awaiting delivery, oldest first.
        outbox: VecDeque<String>,
        /// Whether a drain task currently owns the outbox.
        draining: bool,
    },
    Polling(PollSession),
}

/// One subscriber: a delivery endpoint plus the ids it watches.
#[derive(Debug)]
pub struct SubscriberRecord {
    pub(crate) endpoint: String,
    pub(crate) watched_states: Vec<String>,
    pub(crate) watched_objects: Vec<String>,
    pub(crate) last_seen: Instant,
    /// Set when the record has been removed from the registry; guards
    /// against a looked-up handle racing its own teardown.
    pub(crate) defunct: bool,
    pub(crate) transport: TransportState,
}

impl SubscriberRecord {
    /// Creates a webhook record for a validated callback URL.
    #[must_use]
    pub(crate) fn webhook(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            watched_states: Vec::new(),
            watched_objects: Vec::new(),
            last_seen: Instant::now(),
            defunct: false,
            transport: TransportState::Webhook {
                consecutive_failures: 0,
                outbox: VecDeque::new(),
                draining: false,
            },
        }
    }

    /// Creates a polling session record.
    #[must_use]
    pub(crate) fn polling(endpoint: impl Into<String>, lease: Option<Duration>) -> Self {
        Self {
            endpoint: endpoint.into(),
            watched_states: Vec::new(),
            watched_objects: Vec::new(),
            last_seen: Instant::now(),
            defunct: false,
            transport: TransportState::Polling(PollSession::new(lease)),
        }
    }

    /// The delivery endpoint identifier.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The transport kind of this record.
    #[must_use]
    pub fn transport(&self) -> Transport {
        match self.transport {
            TransportState::Webhook { .. } => Transport::Webhook,
            TransportState::Polling(_) => Transport::Polling,
        }
    }

    pub(crate) fn watches(&self, kind: WatchKind) -> &[String] {
        match kind {
            WatchKind::State => &self.watched_states,
            WatchKind::Object => &self.watched_objects,
        }
    }

    fn watches_mut(&mut self, kind: WatchKind) -> &mut Vec<String> {
        match kind {
            WatchKind::State => &mut self.watched_states,
            WatchKind::Object => &mut self.watched_objects,
        }
    }

    pub(crate) fn contains(&self, kind: WatchKind, id: &str) -> bool {
        self.watches(kind).iter().any(|watched| watched == id)
    }

    /// Adds a watch entry; returns false if it was already present.
    pub(crate) fn add_watch(&mut self, kind: WatchKind, id: &str) -> bool {
        if self.contains(kind, id) {
            return false;
        }
        self.watches_mut(kind).push(id.to_string());
        true
    }

    /// Removes one watch entry; returns true if it was present.
    pub(crate) fn remove_watch(&mut self, kind: WatchKind, id: &str) -> bool {
        let watches = self.watches_mut(kind);
        let before = watches.len();
        watches.retain(|watched| watched != id);
        watches.len() != before
    }

    /// Clears one watch set, returning the removed ids.
    pub(crate) fn clear_watches(&mut self, kind: WatchKind) -> Vec<String> {
        std::mem::take(self.watches_mut(kind))
    }

    /// True when both watch sets are empty.
    #[must_use]
    pub fn has_no_watches(&self) -> bool {
        self.watched_states.is_empty() && self.watched_objects.is_empty()
    }

    pub(crate) fn poll_session_mut(&mut self) -> Option<&mut PollSession> {
        match &mut self.transport {
            TransportState::Polling(session) => Some(session),
            TransportState::Webhook { .. } => None,
        }
    }
}

/// Clamps a requested lease into the allowed window.
pub(crate) fn clamp_lease(lease: Duration) -> Duration {
    lease.clamp(LEASE_MIN, LEASE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_key_is_stable_and_distinct() {
        let a = EndpointKey::from_endpoint("http://127.0.0.1:9000/hook/");
        let b = EndpointKey::from_endpoint("http://127.0.0.1:9000/hook/");
        let c = EndpointKey::from_endpoint("127.0.0.1_A");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn endpoint_key_display_truncates_the_digest() {
        let key = EndpointKey::from_endpoint("http://127.0.0.1:9000/hook/");
        let shown = key.to_string();
        assert_eq!(shown.len(), 12);
        assert!(key.as_str().starts_with(&shown));
    }

    #[test]
    fn lease_clamping() {
        assert_eq!(clamp_lease(Duration::from_millis(10)), LEASE_MIN);
        assert_eq!(clamp_lease(Duration::from_millis(90_000)), LEASE_MAX);
        assert_eq!(
            clamp_lease(Duration::from_millis(2_000)),
            Duration::from_millis(2_000)
        );
    }

    #[test]
    fn watch_entries_deduplicate_by_id() {
        let mut record = SubscriberRecord::webhook("http://example.com/hook");

        assert!(record.add_watch(WatchKind::State, "a.0.x"));
        assert!(!record.add_watch(WatchKind::State, "a.0.x"));
        assert_eq!(record.watches(WatchKind::State).len(), 1);

        // Separate namespace
        assert!(record.add_watch(WatchKind::Object, "a.0.x"));
        assert!(!record.has_no_watches());

        assert!(record.remove_watch(WatchKind::State, "a.0.x"));
        assert!(!record.remove_watch(WatchKind::State, "a.0.x"));
        assert_eq!(record.clear_watches(WatchKind::Object), vec!["a.0.x"]);
        assert!(record.has_no_watches());
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_evicts_entries_older_than_three_seconds() {
        let mut session = PollSession::new(None);
        let now = Instant::now();

        session.push_event("old".to_string(), now);
        tokio::time::advance(Duration::from_millis(3_500)).await;
        session.push_event("fresh".to_string(), Instant::now());

        assert_eq!(session.backlog.len(), 1);
        assert_eq!(session.backlog.front().unwrap().payload, "fresh");
    }

    #[tokio::test]
    async fn push_event_prefers_the_parked_waiter() {
        let mut session = PollSession::new(None);
        let (tx, rx) = oneshot::channel();
        let seq = session.next_seq();
        session.waiter = Some(Waiter { seq, tx });

        session.push_event("hello".to_string(), Instant::now());

        assert!(session.waiter.is_none());
        assert!(session.backlog.is_empty());
        assert_eq!(rx.await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn push_event_falls_back_to_backlog_when_waiter_is_gone() {
        let mut session = PollSession::new(None);
        let (tx, rx) = oneshot::channel();
        let seq = session.next_seq();
        session.waiter = Some(Waiter { seq, tx });
        drop(rx); // client aborted

        session.push_event("kept".to_string(), Instant::now());

        assert!(session.waiter.is_none());
        assert_eq!(session.backlog.len(), 1);
    }
}

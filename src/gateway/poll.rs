// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Long-poll session handling.
//!
//! A session is keyed by its synthetic endpoint identifier (client address,
//! optionally suffixed with a session id). Each poll either drains one
//! backlog entry immediately or parks until an event arrives or the lease
//! elapses. At most one request may be parked per session; a second
//! concurrent poll is rejected unless the first caller already went away.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::registry::{EndpointKey, SubscriberRecord, Waiter, clamp_lease};
use crate::store::StateStore;

use super::Gateway;

impl<S: StateStore> Gateway<S> {
    /// Creates or refreshes a polling session without parking.
    ///
    /// Used by connection checks: the session exists afterwards, its lease
    /// is updated if `lease` is given, and its liveness clock restarts.
    pub async fn connect(&self, endpoint: &str, lease: Option<Duration>) {
        let key = EndpointKey::from_endpoint(endpoint);
        let (mut record, created) = self
            .inner
            .registry
            .lock_or_insert(&key, || SubscriberRecord::polling(endpoint, lease))
            .await;
        if created {
            tracing::debug!(endpoint = %endpoint, "subscribe on connection");
        }

        record.last_seen = Instant::now();
        if let (Some(session), Some(lease)) = (record.poll_session_mut(), lease) {
            session.lease = clamp_lease(lease);
        }
        drop(record);

        self.start_polling_gc();
    }

    /// Serves one long poll for `endpoint`.
    ///
    /// Returns `Ok(Some(payload))` when an event was available or arrived
    /// within the lease, `Ok(None)` when the lease elapsed quietly. The
    /// session is created on first use.
    ///
    /// # Errors
    ///
    /// [`Error::PollPending`] when another request is already parked on
    /// this session and its client is still connected.
    pub async fn poll(&self, endpoint: &str, lease: Option<Duration>) -> Result<Option<String>> {
        let key = EndpointKey::from_endpoint(endpoint);
        let (mut record, created) = self
            .inner
            .registry
            .lock_or_insert(&key, || SubscriberRecord::polling(endpoint, lease))
            .await;
        if created {
            tracing::debug!(endpoint = %endpoint, "subscribe on connection");
        }

        record.last_seen = Instant::now();
        let now = Instant::now();

        let Some(session) = record.poll_session_mut() else {
            // The endpoint identifier collides with a webhook registration.
            return Err(Error::Validation(format!(
                "endpoint \"{endpoint}\" is registered as a webhook"
            )));
        };
        if let Some(lease) = lease {
            session.lease = clamp_lease(lease);
        }
        let wait = session.lease;

        // Serve the backlog first, one entry per poll.
        session.evict_stale(now);
        if let Some(event) = session.backlog.pop_front() {
            return Ok(Some(event.payload));
        }

        // Only one parked request per session. A waiter whose client hung
        // up is replaced silently.
        if let Some(waiter) = &session.waiter {
            if !waiter.tx.is_closed() {
                return Err(Error::PollPending);
            }
        }

        let (tx, rx) = oneshot::channel();
        let seq = session.next_seq();
        session.waiter = Some(Waiter { seq, tx });
        drop(record);

        self.start_polling_gc();

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(payload)) => Ok(Some(payload)),
            // Sender dropped: the session was torn down or replaced.
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                // Lease elapsed. Clear the waiter, but only if it is still
                // ours; a fresh poll may have parked in the meantime.
                if let Some(mut record) = self.inner.registry.lock_live(&key).await {
                    if let Some(session) = record.poll_session_mut() {
                        if session.waiter.as_ref().is_some_and(|w| w.seq == seq) {
                            session.waiter = None;
                        }
                    }
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;

    use super::*;
    use crate::config::GatewayConfig;
    use crate::registry::{Transport, WatchKind};
    use crate::store::{MemoryStore, State};

    fn gateway() -> Gateway<MemoryStore> {
        Gateway::new(Arc::new(MemoryStore::new()), GatewayConfig::new()).unwrap()
    }

    #[tokio::test]
    async fn connect_creates_the_session() {
        let gw = gateway();
        gw.connect("127.0.0.1_A", None).await;
        assert_eq!(gw.registry().polling_count(), 1);
    }

    #[tokio::test]
    async fn parked_poll_wakes_on_a_change() {
        let gw = gateway();
        gw.register_subscribe(
            "127.0.0.1_A",
            Transport::Polling,
            WatchKind::State,
            "demo.0.light",
            "system.user.admin",
        )
        .await
        .unwrap();

        let gateway = gw.clone();
        let poller = tokio::spawn(async move {
            gateway.poll("127.0.0.1_A", Some(Duration::from_secs(5))).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        gw.state_change("demo.0.light", Some(State::new(Value::Bool(true))))
            .await;

        let event = poller.await.unwrap().unwrap().expect("event payload");
        let parsed: Value = serde_json::from_str(&event).unwrap();
        assert_eq!(parsed["id"], "demo.0.light");
    }

    #[tokio::test(start_paused = true)]
    async fn poll_returns_none_when_the_lease_elapses() {
        let gw = gateway();
        let result = gw.poll("127.0.0.1_A", Some(Duration::from_secs(2))).await;
        assert_eq!(result.unwrap(), None);

        // The timed-out waiter cleared itself.
        let key = EndpointKey::from_endpoint("127.0.0.1_A");
        let mut record = gw.registry().lock_live(&key).await.unwrap();
        assert!(record.poll_session_mut().unwrap().waiter.is_none());
    }

    #[tokio::test]
    async fn second_concurrent_poll_is_rejected() {
        let gw = gateway();
        let gateway = gw.clone();
        let first = tokio::spawn(async move {
            gateway.poll("127.0.0.1_A", Some(Duration::from_secs(2))).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = gw.poll("127.0.0.1_A", Some(Duration::from_secs(2))).await;
        assert!(matches!(second, Err(Error::PollPending)));

        // The first poll is unaffected and still parked; release it.
        gw.register_subscribe(
            "127.0.0.1_A",
            Transport::Polling,
            WatchKind::State,
            "demo.0.light",
            "system.user.admin",
        )
        .await
        .unwrap();
        gw.state_change("demo.0.light", Some(State::new(Value::from(1))))
            .await;
        assert!(first.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn abandoned_waiter_is_replaced_by_a_fresh_poll() {
        let gw = gateway();
        let gateway = gw.clone();
        let first = tokio::spawn(async move {
            gateway.poll("127.0.0.1_A", Some(Duration::from_secs(30))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Client hangs up: the parked future is dropped.
        first.abort();
        let _ = first.await;

        gw.register_subscribe(
            "127.0.0.1_A",
            Transport::Polling,
            WatchKind::State,
            "demo.0.light",
            "system.user.admin",
        )
        .await
        .unwrap();

        let gateway = gw.clone();
        let second = tokio::spawn(async move {
            gateway.poll("127.0.0.1_A", Some(Duration::from_secs(5))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gw.state_change("demo.0.light", Some(State::new(Value::from(2))))
            .await;

        assert!(second.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn backlog_is_served_one_entry_per_poll() {
        let gw = gateway();
        gw.register_subscribe(
            "127.0.0.1_A",
            Transport::Polling,
            WatchKind::State,
            "demo.0.light",
            "system.user.admin",
        )
        .await
        .unwrap();

        gw.state_change("demo.0.light", Some(State::new(Value::from(1))))
            .await;
        gw.state_change("demo.0.light", Some(State::new(Value::from(2))))
            .await;

        let first = gw.poll("127.0.0.1_A", None).await.unwrap().unwrap();
        let second = gw.poll("127.0.0.1_A", None).await.unwrap().unwrap();
        let first: Value = serde_json::from_str(&first).unwrap();
        let second: Value = serde_json::from_str(&second).unwrap();
        assert_eq!(first["state"]["val"], 1);
        assert_eq!(second["state"]["val"], 2);
    }
}

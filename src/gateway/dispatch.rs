// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fan-out of store change notifications to subscribers, plus the
//! write-then-wait-for-acknowledgement path.
//!
//! Delivery per subscriber is strictly ordered: polling sessions queue into
//! a per-session backlog, webhooks queue into a per-record outbox that a
//! single drain task empties one POST at a time. The drain never holds the
//! record guard across a network call, so a slow hook only slows itself.

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::registry::{EndpointKey, MAX_HOOK_FAILURES, TransportState, WatchKind};
use crate::store::{ObjectMeta, State, StateStore, StoreEvent};

use super::{Gateway, WaitTask};

impl<S: StateStore> Gateway<S> {
    // =========================================================================
    // Change intake
    // =========================================================================

    /// Handles a state change notification from the store.
    ///
    /// Resolves pending write-then-wait requests first (acknowledged values
    /// only), then fans the event out to every subscriber watching `id`.
    /// `state` is `None` when the id was deleted.
    pub async fn state_change(&self, id: &str, state: Option<State>) {
        tracing::debug!(id = %id, "state change");

        if let Some(new_state) = &state {
            if new_state.ack {
                self.resolve_ack_waiters(id, new_state);
            }
        }

        let payload = json!({ "id": id, "state": state }).to_string();
        self.fan_out(WatchKind::State, id, &payload).await;
    }

    /// Handles an object change notification from the store.
    pub async fn object_change(&self, id: &str, object: Option<ObjectMeta>) {
        tracing::debug!(id = %id, "object change");

        let payload = json!({ "id": id, "obj": object }).to_string();
        self.fan_out(WatchKind::Object, id, &payload).await;
    }

    /// Spawns a task that forwards a [`StoreEvent`] stream into the gateway.
    ///
    /// Convenience wiring for stores that expose a broadcast channel, such
    /// as [`MemoryStore`](crate::store::MemoryStore). The task ends when the
    /// sender side is dropped.
    pub fn spawn_change_feed(
        &self,
        mut events: tokio::sync::broadcast::Receiver<StoreEvent>,
    ) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::State { id, state }) => {
                        gateway.state_change(&id, state).await;
                    }
                    Ok(StoreEvent::Object { id, object }) => {
                        gateway.object_change(&id, object).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "change feed lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    async fn fan_out(&self, kind: WatchKind, id: &str, payload: &str) {
        let now = Instant::now();

        for (key, _, handle) in self.inner.registry.snapshot() {
            let mut record = handle.lock_owned().await;
            if record.defunct || !record.contains(kind, id) {
                continue;
            }

            match &mut record.transport {
                TransportState::Polling(session) => {
                    session.push_event(payload.to_string(), now);
                }
                TransportState::Webhook {
                    outbox, draining, ..
                } => {
                    outbox.push_back(payload.to_string());
                    if !*draining {
                        *draining = true;
                        let gateway = self.clone();
                        tokio::spawn(async move {
                            gateway.drain_hook_outbox(key).await;
                        });
                    }
                }
            }
        }
    }

    // =========================================================================
    // Webhook delivery
    // =========================================================================

    /// Empties one record's outbox, oldest entry first. Only one drain task
    /// exists per record; the `draining` flag hands the outbox over.
    async fn drain_hook_outbox(&self, key: EndpointKey) {
        loop {
            let Some(mut record) = self.inner.registry.lock_live(&key).await else {
                return;
            };
            let TransportState::Webhook {
                outbox, draining, ..
            } = &mut record.transport
            else {
                return;
            };
            let Some(payload) = outbox.pop_front() else {
                *draining = false;
                return;
            };
            let endpoint = record.endpoint().to_string();
            drop(record);

            match self.hooks().post_json(&endpoint, &payload).await {
                Ok(()) => {
                    let Some(mut record) = self.inner.registry.lock_live(&key).await else {
                        return;
                    };
                    if let TransportState::Webhook {
                        consecutive_failures,
                        ..
                    } = &mut record.transport
                    {
                        *consecutive_failures = 0;
                    }
                }
                Err(err) => {
                    tracing::warn!(key = %key, endpoint = %endpoint, error = %err, "cannot report to hook");
                    if self.note_hook_failure(&key).await {
                        return;
                    }
                }
            }
        }
    }

    /// Bumps the consecutive-failure counter for a webhook record and tears
    /// it down once the budget is exhausted. Returns true when the record
    /// is gone.
    pub(crate) async fn note_hook_failure(&self, key: &EndpointKey) -> bool {
        let Some(mut record) = self.inner.registry.lock_live(key).await else {
            return true;
        };
        let TransportState::Webhook {
            consecutive_failures,
            ..
        } = &mut record.transport
        else {
            return true;
        };

        *consecutive_failures += 1;
        if *consecutive_failures > MAX_HOOK_FAILURES {
            tracing::warn!(
                key = %key,
                endpoint = %record.endpoint(),
                "3 consecutive errors, removing all subscriptions for this hook"
            );
            self.teardown_record(key, record).await;
            return true;
        }
        false
    }

    // =========================================================================
    // Write then wait for acknowledgement
    // =========================================================================

    /// Writes a state and waits until the store reports it back with
    /// `ack == true`, or until `wait` elapses.
    ///
    /// The store subscription is held through the gateway-wide watch index,
    /// so an existing subscriber watching the same id is unaffected when
    /// the wait ends.
    ///
    /// # Errors
    ///
    /// [`Error::Upstream`] if the write fails, [`Error::AckTimeout`] if no
    /// acknowledged change arrives in time.
    pub async fn set_state_and_wait(
        &self,
        id: &str,
        val: Value,
        ack: Option<bool>,
        wait: std::time::Duration,
        user: &str,
    ) -> Result<State> {
        self.acquire_watch(WatchKind::State, id, user).await?;

        let (tx, rx) = oneshot::channel();
        let seq = self.next_wait_seq();
        self.inner.wait_tasks.lock().push(WaitTask {
            id: id.to_string(),
            seq,
            tx,
        });

        let opts = self.access(user);
        if let Err(err) = self.inner.store.set_state(id, val.clone(), ack, &opts).await {
            self.remove_wait_task(seq);
            self.release_watch(WatchKind::State, id, user).await;
            return Err(err.into());
        }

        let outcome = tokio::time::timeout(wait, rx).await;
        self.remove_wait_task(seq);
        self.release_watch(WatchKind::State, id, user).await;

        match outcome {
            Ok(Ok(state)) => Ok(state),
            _ => Err(Error::AckTimeout {
                id: id.to_string(),
                val,
            }),
        }
    }

    /// Completes every pending wait task for `id` with the new state.
    fn resolve_ack_waiters(&self, id: &str, state: &State) {
        let mut tasks = self.inner.wait_tasks.lock();
        let mut i = 0;
        while i < tasks.len() {
            if tasks[i].id == id {
                let task = tasks.remove(i);
                // The waiter may have timed out already; nothing to do then.
                let _ = task.tx.send(state.clone());
            } else {
                i += 1;
            }
        }
    }

    fn remove_wait_task(&self, seq: u64) {
        self.inner.wait_tasks.lock().retain(|task| task.seq != seq);
    }
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The gateway facade: subscription registry operations, shared watch
//! accounting, and lifecycle.
//!
//! A [`Gateway`] owns the subscriber registry and every background task that
//! mutates it. It is cheap to clone (all state lives behind an `Arc`) so the
//! routing layer, the store's change feed, and the sweeps can each hold a
//! handle.
//!
//! Store subscriptions are reference counted gateway-wide: the external
//! store is asked to subscribe an id only when its first watcher appears and
//! to unsubscribe only when its last watcher is gone. Watchers are
//! subscriber records *and* in-flight write-then-wait requests, so removing
//! one subscriber never silences another.

mod dispatch;
mod poll;
mod sweep;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::OwnedMutexGuard;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::hook::HookDelivery;
use crate::registry::{
    EndpointKey, SubscriberRecord, SubscriberRegistry, Transport, WatchKind,
};
use crate::store::{AccessOptions, State, StateStore};

/// An in-flight write-then-wait-for-acknowledgement request.
pub(crate) struct WaitTask {
    pub(crate) id: String,
    pub(crate) seq: u64,
    pub(crate) tx: oneshot::Sender<State>,
}

/// Gateway-wide reference counts per watched id, shared by subscriber
/// records and ack-wait tasks.
#[derive(Debug, Default)]
struct WatchIndex {
    counts: Mutex<HashMap<(WatchKind, String), usize>>,
}

impl WatchIndex {
    /// Increments the count; returns true when this is the first watcher.
    fn acquire(&self, kind: WatchKind, id: &str) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry((kind, id.to_string())).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Decrements the count; returns true when the last watcher is gone.
    fn release(&self, kind: WatchKind, id: &str) -> bool {
        let mut counts = self.counts.lock();
        let Some(count) = counts.get_mut(&(kind, id.to_string())) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            counts.remove(&(kind, id.to_string()));
            return true;
        }
        false
    }

    fn clear(&self) {
        self.counts.lock().clear();
    }
}

#[derive(Debug, Default)]
struct SweepHandles {
    checker: Mutex<Option<JoinHandle<()>>>,
    gc: Mutex<Option<JoinHandle<()>>>,
}

struct GatewayInner<S> {
    config: GatewayConfig,
    store: Arc<S>,
    registry: SubscriberRegistry,
    hooks: HookDelivery,
    watch_index: WatchIndex,
    wait_tasks: Mutex<Vec<WaitTask>>,
    wait_seq: AtomicU64,
    sweeps: SweepHandles,
}

/// Subscription registry and change-notification engine.
///
/// # Examples
///
/// ```no_run
/// use statehook::{Gateway, GatewayConfig, Transport, WatchKind};
/// use statehook::store::MemoryStore;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> statehook::Result<()> {
/// let store = Arc::new(MemoryStore::new());
/// let gateway = Gateway::new(store.clone(), GatewayConfig::new())?;
///
/// // Feed the store's change notifications into the gateway.
/// let _feed = gateway.spawn_change_feed(store.events());
///
/// // Register a webhook for a state id (the URL is probed first).
/// gateway
///     .register_subscribe(
///         "http://192.168.0.5:9000/hook/",
///         Transport::Webhook,
///         WatchKind::State,
///         "hm-rpc.0.light",
///         "system.user.admin",
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Gateway<S> {
    inner: Arc<GatewayInner<S>>,
}

impl<S> Clone for Gateway<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> std::fmt::Debug for Gateway<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("records", &self.inner.registry.len())
            .finish()
    }
}

impl<S: StateStore> Gateway<S> {
    /// Creates a gateway over the given store.
    ///
    /// # Errors
    ///
    /// Returns an error if the webhook HTTP client cannot be built.
    pub fn new(store: Arc<S>, config: GatewayConfig) -> Result<Self> {
        let hooks = HookDelivery::new(config.hook_timeout())
            .map_err(|e| Error::Validation(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(GatewayInner {
                config,
                store,
                registry: SubscriberRegistry::new(),
                hooks,
                watch_index: WatchIndex::default(),
                wait_tasks: Mutex::new(Vec::new()),
                wait_seq: AtomicU64::new(0),
                sweeps: SweepHandles::default(),
            }),
        })
    }

    /// The gateway configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// The underlying store handle.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// The subscriber registry (read-only view for callers).
    #[must_use]
    pub fn registry(&self) -> &SubscriberRegistry {
        &self.inner.registry
    }

    pub(crate) fn hooks(&self) -> &HookDelivery {
        &self.inner.hooks
    }

    /// Builds the access options for a store call on behalf of `user`.
    #[must_use]
    pub fn access(&self, user: &str) -> AccessOptions {
        AccessOptions {
            user: user.to_string(),
            limit_to_owner_rights: self.inner.config.only_allow_when_user_is_owner(),
        }
    }

    // =========================================================================
    // Registry operations
    // =========================================================================

    /// Registers a watch entry for an endpoint, creating the subscriber
    /// record on first use.
    ///
    /// Webhook endpoints are probed before the record is created; an
    /// unreachable hook fails with [`Error::Validation`] and leaves no
    /// trace in the registry. Adding an id that is already watched by this
    /// endpoint is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if the webhook probe fails, [`Error::Upstream`]
    /// if the store refuses the subscription.
    pub async fn register_subscribe(
        &self,
        endpoint: &str,
        transport: Transport,
        kind: WatchKind,
        watch_id: &str,
        user: &str,
    ) -> Result<()> {
        let key = EndpointKey::from_endpoint(endpoint);

        let mut record = match self.inner.registry.lock_live(&key).await {
            Some(record) => record,
            None => {
                if transport == Transport::Webhook {
                    if let Err(err) = self.inner.hooks.validate(endpoint).await {
                        tracing::warn!(key = %key, endpoint = %endpoint, error = %err, "cannot report to hook");
                        return Err(Error::Validation(format!(
                            "no valid answer from URL hook: {err}"
                        )));
                    }
                }
                let (record, created) = self
                    .inner
                    .registry
                    .lock_or_insert(&key, || match transport {
                        Transport::Webhook => SubscriberRecord::webhook(endpoint),
                        Transport::Polling => SubscriberRecord::polling(endpoint, None),
                    })
                    .await;
                if created && transport == Transport::Polling {
                    tracing::debug!(endpoint = %endpoint, "subscribe on connection");
                }
                record
            }
        };

        if record.transport() == Transport::Polling {
            self.start_polling_gc();
        }

        if record.add_watch(kind, watch_id) {
            tracing::debug!(
                key = %key,
                endpoint = %record.endpoint(),
                id = watch_id,
                kind = %kind,
                "subscribe"
            );
            if let Err(err) = self.acquire_watch(kind, watch_id, user).await {
                record.remove_watch(kind, watch_id);
                if record.has_no_watches() && record.transport() == Transport::Webhook {
                    self.inner.registry.remove_locked(&key, &mut record);
                }
                drop(record);
                if self.inner.registry.is_empty() {
                    self.stop_checker();
                }
                return Err(err);
            }
        }
        drop(record);

        self.start_checker();
        Ok(())
    }

    /// Removes one watch entry (or the whole `kind` set when `watch_id` is
    /// `None`) from the record for `endpoint`.
    ///
    /// Unknown endpoints are a successful no-op. The record is deleted as
    /// soon as both watch sets are empty; a parked long-poll request is
    /// released with empty data when that happens.
    ///
    /// # Errors
    ///
    /// Currently infallible; store unsubscribe failures are logged and do
    /// not abort the removal.
    pub async fn unregister_subscribe(
        &self,
        endpoint: &str,
        kind: WatchKind,
        watch_id: Option<&str>,
        user: &str,
    ) -> Result<()> {
        let key = EndpointKey::from_endpoint(endpoint);
        let Some(mut record) = self.inner.registry.lock_live(&key).await else {
            return Ok(());
        };

        let removed = match watch_id {
            Some(id) => {
                if record.remove_watch(kind, id) {
                    vec![id.to_string()]
                } else {
                    Vec::new()
                }
            }
            None => record.clear_watches(kind),
        };

        for id in &removed {
            tracing::debug!(key = %key, endpoint = %record.endpoint(), id = %id, kind = %kind, "unsubscribe");
            self.release_watch(kind, id, user).await;
        }

        if record.has_no_watches() {
            if let Some(session) = record.poll_session_mut() {
                // Dropping the sender releases the parked poll with empty data.
                session.waiter.take();
            }
            self.inner.registry.remove_locked(&key, &mut record);
            drop(record);
            if self.inner.registry.is_empty() {
                self.stop_checker();
            }
        }
        Ok(())
    }

    /// Returns the current watch list for an endpoint, or `None` if no
    /// record exists. `filter` narrows the list to ids equal to it.
    pub async fn get_subscribes(
        &self,
        endpoint: &str,
        kind: WatchKind,
        filter: Option<&str>,
    ) -> Option<Vec<String>> {
        let key = EndpointKey::from_endpoint(endpoint);
        let record = self.inner.registry.lock_live(&key).await?;
        let ids = record.watches(kind);
        Some(match filter {
            Some(wanted) => ids.iter().filter(|id| id.as_str() == wanted).cloned().collect(),
            None => ids.to_vec(),
        })
    }

    // =========================================================================
    // Shared watch accounting
    // =========================================================================

    /// Takes a reference on `(kind, id)`, subscribing the store on the
    /// first one.
    pub(crate) async fn acquire_watch(
        &self,
        kind: WatchKind,
        id: &str,
        user: &str,
    ) -> Result<()> {
        if self.inner.watch_index.acquire(kind, id) {
            let opts = self.access(user);
            let result = match kind {
                WatchKind::State => self.inner.store.subscribe_states(id, &opts).await,
                WatchKind::Object => self.inner.store.subscribe_objects(id, &opts).await,
            };
            if let Err(err) = result {
                self.inner.watch_index.release(kind, id);
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Releases a reference on `(kind, id)`, unsubscribing the store after
    /// the last one. Store failures are logged, not raised — the watch
    /// entry is already gone.
    pub(crate) async fn release_watch(&self, kind: WatchKind, id: &str, user: &str) {
        if self.inner.watch_index.release(kind, id) {
            let opts = self.access(user);
            let result = match kind {
                WatchKind::State => self.inner.store.unsubscribe_states(id, &opts).await,
                WatchKind::Object => self.inner.store.unsubscribe_objects(id, &opts).await,
            };
            if let Err(err) = result {
                tracing::warn!(id = %id, kind = %kind, error = %err, "store unsubscribe failed");
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Fully removes a record whose guard the caller holds: releases a
    /// parked poll, withdraws every watch, deletes the record, and stops
    /// the health sweep if the registry emptied.
    pub(crate) async fn teardown_record(
        &self,
        key: &EndpointKey,
        mut record: OwnedMutexGuard<SubscriberRecord>,
    ) {
        if let Some(session) = record.poll_session_mut() {
            session.waiter.take();
        }
        let states = record.clear_watches(WatchKind::State);
        let objects = record.clear_watches(WatchKind::Object);
        let endpoint = record.endpoint().to_string();
        self.inner.registry.remove_locked(key, &mut record);
        drop(record);

        let user = self.inner.config.default_user().to_string();
        for id in states {
            tracing::debug!(endpoint = %endpoint, id = %id, "unsubscribe from state");
            self.release_watch(WatchKind::State, &id, &user).await;
        }
        for id in objects {
            tracing::debug!(endpoint = %endpoint, id = %id, "unsubscribe from object");
            self.release_watch(WatchKind::Object, &id, &user).await;
        }

        if self.inner.registry.is_empty() {
            self.stop_checker();
        }
    }

    /// Notifies every registered endpoint that the gateway is going away
    /// and clears the registry. Call before process shutdown.
    ///
    /// Webhooks receive a best-effort `{"disconnect": true}` POST; polling
    /// sessions get the same payload through their waiter or backlog.
    pub async fn unload(&self) {
        self.stop_checker();
        self.stop_gc();

        let payload = json!({ "disconnect": true }).to_string();
        let now = Instant::now();

        for (_key, transport, handle) in self.inner.registry.drain() {
            let mut record = handle.lock_owned().await;
            record.defunct = true;
            match transport {
                Transport::Polling => {
                    if let Some(session) = record.poll_session_mut() {
                        session.push_event(payload.clone(), now);
                    }
                }
                Transport::Webhook => {
                    let endpoint = record.endpoint().to_string();
                    drop(record);
                    self.inner.hooks.notify_disconnect(&endpoint).await;
                }
            }
        }

        self.inner.watch_index.clear();
        self.inner.wait_tasks.lock().clear();
    }

    pub(crate) fn next_wait_seq(&self) -> u64 {
        self.inner.wait_seq.fetch_add(1, Ordering::Relaxed)
    }
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory reference implementation of [`StateStore`].
//!
//! Change notifications are emitted over a broadcast channel, but only for
//! ids covered by an active subscription — the same behavior a real store
//! exhibits, which is what lets the test suite catch over-eager
//! unsubscribing.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;

use super::{
    AccessOptions, ObjectMeta, State, StateStore, StoreError, StoreEvent, now_millis,
    pattern_match,
};

/// Default capacity of the change notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-memory state/object store.
///
/// # Examples
///
/// ```
/// use statehook::store::{AccessOptions, MemoryStore, StateStore};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryStore::new();
/// let opts = AccessOptions::for_user("system.user.admin");
///
/// store.set_state("demo.0.temp", json!(21.5), None, &opts).await.unwrap();
/// let state = store.get_state("demo.0.temp", &opts).await.unwrap().unwrap();
/// assert_eq!(state.val, json!(21.5));
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    states: RwLock<HashMap<String, State>>,
    objects: RwLock<HashMap<String, ObjectMeta>>,
    // Subscription patterns with reference counts, states and objects apart.
    state_subs: Mutex<HashMap<String, usize>>,
    object_subs: Mutex<HashMap<String, usize>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            states: RwLock::new(HashMap::new()),
            objects: RwLock::new(HashMap::new()),
            state_subs: Mutex::new(HashMap::new()),
            object_subs: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Returns a receiver for change notifications.
    ///
    /// Only changes covered by an active subscription are delivered.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Seeds an object without emitting a notification.
    pub fn put_object(&self, object: ObjectMeta) {
        self.objects.write().insert(object.id.clone(), object);
    }

    /// Seeds a state without emitting a notification.
    pub fn put_state(&self, id: impl Into<String>, state: State) {
        self.states.write().insert(id.into(), state);
    }

    /// Number of active state subscriptions matching `id` exactly.
    ///
    /// Useful in tests to assert that the gateway keeps the store
    /// subscription alive while any subscriber still watches the id.
    #[must_use]
    pub fn state_subscription_count(&self, id: &str) -> usize {
        self.state_subs.lock().get(id).copied().unwrap_or(0)
    }

    fn state_subscribed(&self, id: &str) -> bool {
        self.state_subs
            .lock()
            .keys()
            .any(|pattern| pattern_match(pattern, id))
    }

    fn object_subscribed(&self, id: &str) -> bool {
        self.object_subs
            .lock()
            .keys()
            .any(|pattern| pattern_match(pattern, id))
    }

    fn add_sub(map: &Mutex<HashMap<String, usize>>, pattern: &str) {
        *map.lock().entry(pattern.to_string()).or_insert(0) += 1;
    }

    fn remove_sub(map: &Mutex<HashMap<String, usize>>, pattern: &str) {
        let mut subs = map.lock();
        if let Some(count) = subs.get_mut(pattern) {
            *count -= 1;
            if *count == 0 {
                subs.remove(pattern);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    async fn get_state(
        &self,
        id: &str,
        _opts: &AccessOptions,
    ) -> Result<Option<State>, StoreError> {
        Ok(self.states.read().get(id).cloned())
    }

    async fn set_state(
        &self,
        id: &str,
        val: Value,
        ack: Option<bool>,
        _opts: &AccessOptions,
    ) -> Result<(), StoreError> {
        let state = State {
            val,
            ack: ack.unwrap_or(false),
            ts: now_millis(),
        };
        self.states.write().insert(id.to_string(), state.clone());

        if self.state_subscribed(id) {
            let _ = self.events.send(StoreEvent::State {
                id: id.to_string(),
                state: Some(state),
            });
        }
        Ok(())
    }

    async fn get_object(
        &self,
        id: &str,
        _opts: &AccessOptions,
    ) -> Result<Option<ObjectMeta>, StoreError> {
        Ok(self.objects.read().get(id).cloned())
    }

    async fn get_states(
        &self,
        pattern: &str,
        _opts: &AccessOptions,
    ) -> Result<BTreeMap<String, State>, StoreError> {
        Ok(self
            .states
            .read()
            .iter()
            .filter(|(id, _)| pattern_match(pattern, id))
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect())
    }

    async fn subscribe_states(&self, id: &str, _opts: &AccessOptions) -> Result<(), StoreError> {
        Self::add_sub(&self.state_subs, id);
        Ok(())
    }

    async fn unsubscribe_states(&self, id: &str, _opts: &AccessOptions) -> Result<(), StoreError> {
        Self::remove_sub(&self.state_subs, id);
        Ok(())
    }

    async fn subscribe_objects(&self, id: &str, _opts: &AccessOptions) -> Result<(), StoreError> {
        Self::add_sub(&self.object_subs, id);
        Ok(())
    }

    async fn unsubscribe_objects(&self, id: &str, _opts: &AccessOptions) -> Result<(), StoreError> {
        Self::remove_sub(&self.object_subs, id);
        Ok(())
    }
}

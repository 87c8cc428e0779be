// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscriber registry: the map from endpoint hashes to subscriber records.
//!
//! Concurrency contract (two producers and two sweeps share this map):
//!
//! - The map itself is guarded by a synchronous lock that is never held
//!   across an `.await`.
//! - Every record sits behind its own `tokio::sync::Mutex`, so operations
//!   on the *same* endpoint serialize — including across store calls made
//!   while the guard is held — while operations on different endpoints
//!   never block each other.
//! - Removal happens while the record guard is held: the record is flagged
//!   `defunct` and taken out of the map in one step, so a concurrent
//!   operation that already cloned the handle observes the flag once it
//!   acquires the guard and retries against the map.

mod record;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub use record::{EndpointKey, SubscriberRecord, Transport, WatchKind};
pub(crate) use record::{MAX_HOOK_FAILURES, TransportState, Waiter, clamp_lease};

type RecordHandle = Arc<Mutex<SubscriberRecord>>;

/// One registry slot. The transport never changes over a record's lifetime,
/// so it is mirrored outside the mutex for lock-free filtering.
#[derive(Debug, Clone)]
struct Slot {
    transport: Transport,
    record: RecordHandle,
}

/// Registry of all subscriber records, keyed by endpoint hash.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    records: RwLock<HashMap<EndpointKey, Slot>>,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when no records are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of polling records currently registered.
    #[must_use]
    pub fn polling_count(&self) -> usize {
        self.records
            .read()
            .values()
            .filter(|slot| slot.transport == Transport::Polling)
            .count()
    }

    /// Locks the record for `key`, retrying if the handle it found was torn
    /// down while waiting for the guard. Returns `None` if no record exists.
    pub(crate) async fn lock_live(
        &self,
        key: &EndpointKey,
    ) -> Option<OwnedMutexGuard<SubscriberRecord>> {
        loop {
            let handle = self.records.read().get(key)?.record.clone();
            let guard = handle.lock_owned().await;
            if !guard.defunct {
                return Some(guard);
            }
        }
    }

    /// Locks the record for `key`, creating it with `make` if absent.
    ///
    /// The boolean is `true` when this call created the record.
    pub(crate) async fn lock_or_insert(
        &self,
        key: &EndpointKey,
        make: impl Fn() -> SubscriberRecord,
    ) -> (OwnedMutexGuard<SubscriberRecord>, bool) {
        loop {
            let (handle, created) = {
                let mut map = self.records.write();
                if let Some(slot) = map.get(key) {
                    (slot.record.clone(), false)
                } else {
                    let record = make();
                    let transport = record.transport();
                    let handle: RecordHandle = Arc::new(Mutex::new(record));
                    map.insert(
                        key.clone(),
                        Slot {
                            transport,
                            record: handle.clone(),
                        },
                    );
                    (handle, true)
                }
            };
            let guard = handle.lock_owned().await;
            if !guard.defunct {
                return (guard, created);
            }
        }
    }

    /// Removes a record whose guard the caller holds. The `defunct` flag and
    /// the map entry change together, before the guard is released.
    pub(crate) fn remove_locked(&self, key: &EndpointKey, record: &mut SubscriberRecord) {
        record.defunct = true;
        self.records.write().remove(key);
    }

    /// Snapshot of all current records for iteration outside the map lock.
    pub(crate) fn snapshot(&self) -> Vec<(EndpointKey, Transport, RecordHandle)> {
        self.records
            .read()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.transport, slot.record.clone()))
            .collect()
    }

    /// Drains the whole registry, returning the handles so the caller can
    /// still notify them. Used by `unload`.
    pub(crate) fn drain(&self) -> Vec<(EndpointKey, Transport, RecordHandle)> {
        self.records
            .write()
            .drain()
            .map(|(key, slot)| (key, slot.transport, slot.record))
            .collect()
    }
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contract for the external state/object store.
//!
//! The gateway never owns state itself; it reads, writes and subscribes
//! through [`StateStore`] and receives change notifications back as
//! [`StoreEvent`]s. The crate ships one implementation,
//! [`MemoryStore`](memory::MemoryStore), which is enough for tests and small
//! embedded setups — production deployments implement the trait against
//! their real store.

mod memory;

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;

/// Error reported by a [`StateStore`] implementation.
///
/// The gateway treats the store as opaque: whatever went wrong upstream is
/// carried as a message and surfaced to clients as a 500.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    /// Creates a store error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Access context passed along with every store call.
#[derive(Debug, Clone, Default)]
pub struct AccessOptions {
    /// The user the operation runs as, e.g. `system.user.admin`.
    pub user: String,
    /// Restrict the operation to objects owned by `user`.
    pub limit_to_owner_rights: bool,
}

impl AccessOptions {
    /// Creates options for the given user without owner restriction.
    #[must_use]
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            limit_to_owner_rights: false,
        }
    }
}

/// A single named data point: current value plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Current value.
    pub val: Value,
    /// Whether the value was acknowledged by the underlying device/driver.
    pub ack: bool,
    /// Timestamp of the last write, epoch milliseconds.
    pub ts: i64,
}

impl State {
    /// Creates an unacknowledged state with the current timestamp.
    #[must_use]
    pub fn new(val: Value) -> Self {
        Self {
            val,
            ack: false,
            ts: now_millis(),
        }
    }

    /// Creates a state with an explicit acknowledgement flag.
    #[must_use]
    pub fn with_ack(val: Value, ack: bool) -> Self {
        Self {
            val,
            ack,
            ts: now_millis(),
        }
    }
}

/// Structural metadata describing a state or device, distinct from its
/// live value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object id, identical to the state id it describes.
    #[serde(rename = "_id")]
    pub id: String,
    /// Object kind, e.g. `state`, `channel`, `device`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Common attributes.
    pub common: ObjectCommon,
}

/// The `common` section of an object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectCommon {
    /// Human readable name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Value type of the described state: `boolean`, `number`, `string`, ...
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Role hint, e.g. `switch`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Lower bound for numeric states.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound for numeric states.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ObjectMeta {
    /// Creates a `state` object with the given value type.
    #[must_use]
    pub fn state(id: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "state".to_string(),
            common: ObjectCommon {
                data_type: Some(data_type.into()),
                ..ObjectCommon::default()
            },
        }
    }
}

/// Asynchronous change notification emitted by a store.
///
/// `state`/`object` are `None` when the entry was deleted.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A state value changed or was deleted.
    State {
        /// The state id.
        id: String,
        /// The new state, `None` on deletion.
        state: Option<State>,
    },
    /// An object changed or was deleted.
    Object {
        /// The object id.
        id: String,
        /// The new object, `None` on deletion.
        object: Option<ObjectMeta>,
    },
}

/// Contract the gateway consumes from the external state/object store.
///
/// Implementations are expected to deliver change notifications for every id
/// (or pattern) with an active subscription; the gateway wires those into
/// [`Gateway::state_change`](crate::Gateway::state_change) and
/// [`Gateway::object_change`](crate::Gateway::object_change).
pub trait StateStore: Send + Sync + 'static {
    /// Reads a state. Returns `None` if the id has no value yet.
    fn get_state(
        &self,
        id: &str,
        opts: &AccessOptions,
    ) -> impl Future<Output = Result<Option<State>, StoreError>> + Send;

    /// Writes a state value. `ack` of `None` keeps the store's default
    /// (unacknowledged).
    fn set_state(
        &self,
        id: &str,
        val: Value,
        ack: Option<bool>,
        opts: &AccessOptions,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Reads an object. Returns `None` if unknown.
    fn get_object(
        &self,
        id: &str,
        opts: &AccessOptions,
    ) -> impl Future<Output = Result<Option<ObjectMeta>, StoreError>> + Send;

    /// Lists states whose ids match `pattern` (`*` wildcards).
    fn get_states(
        &self,
        pattern: &str,
        opts: &AccessOptions,
    ) -> impl Future<Output = Result<BTreeMap<String, State>, StoreError>> + Send;

    /// Registers interest in changes of a state id or pattern.
    fn subscribe_states(
        &self,
        id: &str,
        opts: &AccessOptions,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Withdraws interest in changes of a state id or pattern.
    fn unsubscribe_states(
        &self,
        id: &str,
        opts: &AccessOptions,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Registers interest in changes of an object id or pattern.
    fn subscribe_objects(
        &self,
        id: &str,
        opts: &AccessOptions,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Withdraws interest in changes of an object id or pattern.
    fn unsubscribe_objects(
        &self,
        id: &str,
        opts: &AccessOptions,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Returns the current time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Matches an id against a subscription pattern with `*` wildcards.
///
/// Patterns are matched segment-wise: `javascript.0.*` matches every id
/// under that prefix, `*` matches everything, and a pattern without `*`
/// must match exactly.
#[must_use]
pub fn pattern_match(pattern: &str, id: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == id;
    }

    let mut remainder = id;
    let mut first = true;
    let mut parts = pattern.split('*').peekable();

    while let Some(part) = parts.next() {
        let last = parts.peek().is_none();
        if first {
            if !remainder.starts_with(part) {
                return false;
            }
            remainder = &remainder[part.len()..];
        } else if last {
            return remainder.ends_with(part);
        } else if let Some(pos) = remainder.find(part) {
            remainder = &remainder[pos + part.len()..];
        } else {
            return false;
        }
        first = false;
    }

    // Pattern ended with '*'
    true
}

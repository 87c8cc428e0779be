// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `statehook` gateway.
//!
//! The taxonomy mirrors what a routing layer needs to map a failure onto an
//! HTTP status: validation problems (422), permission denials (403), unknown
//! ids or sessions (404), upstream store failures (500), acknowledgement
//! timeouts (501), and long-poll conflicts (409). Webhook delivery failures
//! are deliberately *not* part of the public surface — they are logged and
//! counted on the subscriber record, never raised to a request.

use serde_json::Value;
use thiserror::Error;

use crate::store::StoreError;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// A request field is missing or invalid, or a webhook URL failed its
    /// reachability probe before registration.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requesting user lacks the permission for this operation.
    #[error("permission denied for user \"{user}\": {operation}")]
    Permission {
        /// The user the check ran against.
        user: String,
        /// The operation that was denied, e.g. `state/read`.
        operation: String,
    },

    /// An id, endpoint, or polling session is unknown. The message is the
    /// verbatim response body text, e.g. `URL or session not found`.
    #[error("{0}")]
    NotFound(String),

    /// A call into the external state/object store failed.
    #[error("upstream store error: {0}")]
    Upstream(#[from] StoreError),

    /// A write-then-wait request was not acknowledged before its deadline.
    #[error("timeout waiting for acknowledgement of \"{id}\"")]
    AckTimeout {
        /// The state id that was written.
        id: String,
        /// The value that was written.
        val: Value,
    },

    /// A long-poll request is already parked on this session.
    #[error("a long-poll request is already waiting on this session")]
    PollPending,
}

impl Error {
    /// Maps the error onto the HTTP status code the routing layer should use.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 422,
            Error::Permission { .. } => 403,
            Error::NotFound(_) => 404,
            Error::Upstream(_) => 500,
            Error::AckTimeout { .. } => 501,
            Error::PollPending => 409,
        }
    }

    /// Convenience constructor for permission denials.
    #[must_use]
    pub fn permission(user: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::Permission {
            user: user.into(),
            operation: operation.into(),
        }
    }
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            Error::Validation("url not provided".into()).status_code(),
            422
        );
        assert_eq!(
            Error::permission("system.user.guest", "state/write").status_code(),
            403
        );
        assert_eq!(Error::NotFound("hm-rpc.0.x".into()).status_code(), 404);
        assert_eq!(
            Error::Upstream(StoreError::new("connection lost")).status_code(),
            500
        );
        assert_eq!(
            Error::AckTimeout {
                id: "hm-rpc.0.x".into(),
                val: Value::Bool(true),
            }
            .status_code(),
            501
        );
        assert_eq!(Error::PollPending.status_code(), 409);
    }

    #[test]
    fn permission_display_names_user_and_operation() {
        let err = Error::permission("system.user.guest", "state/write");
        assert_eq!(
            err.to_string(),
            "permission denied for user \"system.user.guest\": state/write"
        );
    }

    #[test]
    fn not_found_displays_the_plain_message() {
        let err = Error::NotFound("URL or session not found".into());
        assert_eq!(err.to_string(), "URL or session not found");
    }

    #[test]
    fn upstream_from_store_error() {
        let err: Error = StoreError::new("redis gone").into();
        assert!(matches!(err, Error::Upstream(_)));
        assert_eq!(err.to_string(), "upstream store error: redis gone");
    }
}

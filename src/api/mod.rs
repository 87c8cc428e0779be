// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framework-neutral request handlers.
//!
//! The crate does not bind to an HTTP server; a routing layer builds an
//! [`ApiRequest`] from whatever framework it uses, calls a handler from
//! [`state`], and writes the returned [`ApiResponse`] back. Status codes
//! follow the error taxonomy in [`crate::error`].

pub mod state;

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::error::Error;
use crate::registry::Transport;

/// A parsed request, independent of the HTTP framework in front.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    user: Option<String>,
    remote_addr: String,
    forwarded_for: Option<String>,
    query: HashMap<String, String>,
    body: Value,
}

impl ApiRequest {
    /// Creates a request originating from `remote_addr`.
    #[must_use]
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            user: None,
            remote_addr: remote_addr.into(),
            forwarded_for: None,
            query: HashMap::new(),
            body: Value::Null,
        }
    }

    /// Sets the authenticated user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the `X-Forwarded-For` client address.
    #[must_use]
    pub fn with_forwarded_for(mut self, addr: impl Into<String>) -> Self {
        self.forwarded_for = Some(addr.into());
        self
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Returns a query parameter.
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// True when the query parameter is present, regardless of value.
    #[must_use]
    pub fn has_query(&self, key: &str) -> bool {
        self.query.contains_key(key)
    }

    /// Returns the request body.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Returns a string field from the body object.
    #[must_use]
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// The authenticated user, or `fallback` for anonymous requests.
    #[must_use]
    pub fn user_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.user.as_deref().unwrap_or(fallback)
    }

    /// The synthetic endpoint identifier of this client's polling session:
    /// the client address (`X-Forwarded-For` wins over the socket address),
    /// optionally suffixed with a caller-supplied session id so one
    /// address can hold several isolated sessions.
    #[must_use]
    pub fn session_endpoint(&self) -> String {
        let addr = self.forwarded_for.as_deref().unwrap_or(&self.remote_addr);
        match self.query("sid").or_else(|| self.body_str("sid")) {
            Some(sid) if !sid.is_empty() => format!("{addr}_{sid}"),
            _ => addr.to_string(),
        }
    }

    /// Resolves where change events for this request should be delivered:
    /// the polling session when `method=polling` is requested (query or
    /// body), otherwise the `url` body field. `None` means the caller
    /// supplied neither.
    #[must_use]
    pub fn delivery_endpoint(&self) -> Option<(String, Transport)> {
        let polling = self.query("method") == Some("polling")
            || self.body_str("method") == Some("polling");
        if polling {
            return Some((self.session_endpoint(), Transport::Polling));
        }
        self.body_str("url")
            .filter(|url| !url.is_empty())
            .map(|url| (url.to_string(), Transport::Webhook))
    }
}

/// Response body variants a handler can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// A JSON document.
    Json(Value),
    /// Raw text, e.g. a plain state value or a long-poll payload.
    Text(String),
    /// No body (long-poll lease elapsed quietly).
    Empty,
}

/// A handler result the routing layer writes back verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: ResponseBody,
}

impl ApiResponse {
    /// 200 with a JSON body.
    #[must_use]
    pub fn ok_json(body: Value) -> Self {
        Self::json(200, body)
    }

    /// Arbitrary status with a JSON body.
    #[must_use]
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: ResponseBody::Json(body),
        }
    }

    /// Arbitrary status with a text body.
    #[must_use]
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: ResponseBody::Text(body.into()),
        }
    }

    /// Arbitrary status with no body.
    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: ResponseBody::Empty,
        }
    }

    /// Maps a gateway error onto status and JSON body.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        let body = match err {
            Error::AckTimeout { id, val } => json!({
                "error": "timeout",
                "id": id,
                "val": val,
            }),
            other => json!({ "error": other.to_string() }),
        };
        Self::json(err.status_code(), body)
    }
}

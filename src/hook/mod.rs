// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound webhook delivery.
//!
//! All webhook traffic funnels through [`HookDelivery`]: the registration
//! probe, change payload posts, and the shutdown notice. A call succeeds
//! when the hook answers with any status below 400 within the configured
//! timeout; everything else — including the timeout itself — counts as a
//! failure toward the subscriber's consecutive-failure budget.

use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use thiserror::Error;

/// Errors produced by webhook calls. These never reach a client response;
/// callers log them and update the failure counter.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The request could not be sent or timed out.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The hook answered, but with an error status.
    #[error("hook answered with status {0}")]
    Status(u16),
}

/// HTTP client for webhook callbacks.
#[derive(Debug, Clone)]
pub struct HookDelivery {
    client: Client,
    timeout: Duration,
}

impl HookDelivery {
    /// Creates a delivery client with the given per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DeliveryError::Http)?;
        Ok(Self { client, timeout })
    }

    /// Probes a callback URL before it is registered.
    ///
    /// Posts `{"test": true}`; any status below 400 passes.
    pub async fn validate(&self, url: &str) -> Result<(), DeliveryError> {
        self.post_json(url, &json!({ "test": true }).to_string())
            .await
    }

    /// Posts a pre-serialized JSON payload to a hook.
    pub async fn post_json(&self, url: &str, payload: &str) -> Result<(), DeliveryError> {
        tracing::debug!(url = %url, "posting to hook");

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(DeliveryError::Http)?;

        let status = response.status();
        if status.as_u16() < 400 {
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }

    /// Best-effort shutdown notice: `{"disconnect": true}`, errors ignored.
    pub async fn notify_disconnect(&self, url: &str) {
        if let Err(err) = self
            .post_json(url, &json!({ "disconnect": true }).to_string())
            .await
        {
            tracing::debug!(url = %url, error = %err, "disconnect notice not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_error_display() {
        let err = DeliveryError::Status(503);
        assert_eq!(err.to_string(), "hook answered with status 503");
    }

    #[tokio::test]
    async fn unreachable_hook_fails_validation() {
        // Nothing listens on this port.
        let hooks = HookDelivery::new(Duration::from_millis(200)).unwrap();
        let result = hooks.validate("http://127.0.0.1:59999/hook/").await;
        assert!(matches!(result, Err(DeliveryError::Http(_))));
    }
}

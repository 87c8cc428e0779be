// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background sweeps: the webhook health check and the polling session
//! garbage collector.
//!
//! Both run as lone tokio tasks whose handles live in `SweepHandles`. The
//! GC stops itself once no polling session is left; the decision is made
//! under the handle slot lock so a concurrent session creation either sees
//! the running task or finds the slot empty and starts a fresh one.

use std::time::Duration;

use tokio::time::Instant;

use crate::registry::Transport;
use crate::store::StateStore;

use super::Gateway;

/// How often stale polling sessions are collected.
pub(crate) const GC_INTERVAL: Duration = Duration::from_secs(30);

impl<S: StateStore> Gateway<S> {
    // =========================================================================
    // Webhook health check
    // =========================================================================

    /// Starts the periodic webhook health sweep if it is not running.
    pub(crate) fn start_checker(&self) {
        let interval = self.inner.config.check_interval();
        if interval.is_zero() {
            tracing::warn!("check of hooks is disabled, check interval is 0");
            return;
        }

        let mut slot = self.inner.sweeps.checker.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let gateway = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gateway.check_hooks().await;
            }
        }));
    }

    /// Stops the webhook health sweep.
    pub(crate) fn stop_checker(&self) {
        if let Some(handle) = self.inner.sweeps.checker.lock().take() {
            handle.abort();
        }
    }

    /// Probes every registered webhook once. Failures count against the
    /// same consecutive-failure budget as delivery failures, so a hook
    /// that goes dark is evicted even when no events flow.
    pub(crate) async fn check_hooks(&self) {
        for (key, transport, _) in self.inner.registry.snapshot() {
            if transport != Transport::Webhook {
                continue;
            }
            let endpoint = match self.inner.registry.lock_live(&key).await {
                Some(record) => record.endpoint().to_string(),
                None => continue,
            };

            match self.hooks().validate(&endpoint).await {
                Ok(()) => {
                    if let Some(mut record) = self.inner.registry.lock_live(&key).await {
                        if let crate::registry::TransportState::Webhook {
                            consecutive_failures,
                            ..
                        } = &mut record.transport
                        {
                            *consecutive_failures = 0;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(key = %key, endpoint = %endpoint, error = %err, "cannot report to hook");
                    self.note_hook_failure(&key).await;
                }
            }
        }
    }

    // =========================================================================
    // Polling session garbage collection
    // =========================================================================

    /// Starts the polling session GC if it is not running.
    pub(crate) fn start_polling_gc(&self) {
        let mut slot = self.inner.sweeps.gc.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let gateway = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gateway.collect_stale_sessions().await;

                // Stop once no polling session is left. Clearing the slot
                // and deciding happen under the same lock that a starter
                // takes, so no session can slip between the two.
                {
                    let mut slot = gateway.inner.sweeps.gc.lock();
                    if gateway.inner.registry.polling_count() == 0 {
                        *slot = None;
                        return;
                    }
                }
            }
        }));
    }

    /// Stops the polling session GC.
    pub(crate) fn stop_gc(&self) {
        if let Some(handle) = self.inner.sweeps.gc.lock().take() {
            handle.abort();
        }
    }

    /// Removes every polling session that has been silent for more than
    /// twice its lease.
    pub(crate) async fn collect_stale_sessions(&self) {
        let now = Instant::now();
        for (key, transport, handle) in self.inner.registry.snapshot() {
            if transport != Transport::Polling {
                continue;
            }
            let mut record = handle.lock_owned().await;
            if record.defunct {
                continue;
            }
            let last_seen = record.last_seen;
            let Some(session) = record.poll_session_mut() else {
                continue;
            };
            if now.duration_since(last_seen) > session.lease * 2 {
                tracing::debug!(key = %key, endpoint = %record.endpoint(), "destroy connection due inactivity");
                self.teardown_record(&key, record).await;
            }
        }
    }
}

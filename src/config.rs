// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway configuration.
//!
//! All intervals carry the floors the gateway relies on: the webhook health
//! sweep never runs more often than every 5 seconds (0 disables it entirely),
//! and webhook calls always get at least 50 ms to answer.

use std::time::Duration;

/// Configuration for a [`Gateway`](crate::Gateway).
///
/// # Examples
///
/// ```
/// use statehook::GatewayConfig;
/// use std::time::Duration;
///
/// let config = GatewayConfig::new()
///     .with_check_interval(Duration::from_secs(60))
///     .with_hook_timeout(Duration::from_millis(500))
///     .with_default_user("admin");
///
/// assert_eq!(config.default_user(), "system.user.admin");
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    check_interval: Duration,
    hook_timeout: Duration,
    only_allow_when_user_is_owner: bool,
    default_user: String,
    data_source: Option<String>,
}

impl GatewayConfig {
    /// Default webhook health sweep interval.
    pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(20_000);
    /// Minimum webhook health sweep interval (a non-zero value below this is
    /// raised to it).
    pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(5_000);
    /// Default webhook call timeout.
    pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_millis(3_000);
    /// Minimum webhook call timeout.
    pub const MIN_HOOK_TIMEOUT: Duration = Duration::from_millis(50);
    /// Fallback user for unauthenticated requests.
    pub const DEFAULT_USER: &'static str = "system.user.admin";

    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            check_interval: Self::DEFAULT_CHECK_INTERVAL,
            hook_timeout: Self::DEFAULT_HOOK_TIMEOUT,
            only_allow_when_user_is_owner: false,
            default_user: Self::DEFAULT_USER.to_string(),
            data_source: None,
        }
    }

    /// Sets the webhook health sweep interval.
    ///
    /// `Duration::ZERO` disables the sweep; non-zero values are floored at
    /// [`Self::MIN_CHECK_INTERVAL`].
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = if interval.is_zero() {
            Duration::ZERO
        } else {
            interval.max(Self::MIN_CHECK_INTERVAL)
        };
        self
    }

    /// Sets the webhook call timeout, floored at [`Self::MIN_HOOK_TIMEOUT`].
    #[must_use]
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout.max(Self::MIN_HOOK_TIMEOUT);
        self
    }

    /// Restricts store reads/writes to objects owned by the requesting user.
    #[must_use]
    pub fn with_owner_only_access(mut self, enabled: bool) -> Self {
        self.only_allow_when_user_is_owner = enabled;
        self
    }

    /// Sets the fallback user. A bare name is prefixed with `system.user.`.
    #[must_use]
    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        let user = user.into();
        self.default_user = if user.starts_with("system.user.") {
            user
        } else {
            format!("system.user.{user}")
        };
        self
    }

    /// Sets the default history data source, e.g. `history.0`.
    #[must_use]
    pub fn with_data_source(mut self, source: impl Into<String>) -> Self {
        self.data_source = Some(source.into());
        self
    }

    /// Returns the webhook health sweep interval (zero means disabled).
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Returns the webhook call timeout.
    #[must_use]
    pub fn hook_timeout(&self) -> Duration {
        self.hook_timeout
    }

    /// Returns whether store access is limited to object owners.
    #[must_use]
    pub fn only_allow_when_user_is_owner(&self) -> bool {
        self.only_allow_when_user_is_owner
    }

    /// Returns the fallback user.
    #[must_use]
    pub fn default_user(&self) -> &str {
        &self.default_user
    }

    /// Returns the default history data source, if configured.
    #[must_use]
    pub fn data_source(&self) -> Option<&str> {
        self.data_source.as_deref()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GatewayConfig::new();
        assert_eq!(config.check_interval(), Duration::from_millis(20_000));
        assert_eq!(config.hook_timeout(), Duration::from_millis(3_000));
        assert!(!config.only_allow_when_user_is_owner());
        assert_eq!(config.default_user(), "system.user.admin");
        assert!(config.data_source().is_none());
    }

    #[test]
    fn check_interval_is_floored() {
        let config = GatewayConfig::new().with_check_interval(Duration::from_millis(100));
        assert_eq!(config.check_interval(), GatewayConfig::MIN_CHECK_INTERVAL);
    }

    #[test]
    fn zero_check_interval_disables_the_sweep() {
        let config = GatewayConfig::new().with_check_interval(Duration::ZERO);
        assert!(config.check_interval().is_zero());
    }

    #[test]
    fn hook_timeout_is_floored() {
        let config = GatewayConfig::new().with_hook_timeout(Duration::from_millis(1));
        assert_eq!(config.hook_timeout(), GatewayConfig::MIN_HOOK_TIMEOUT);
    }

    #[test]
    fn bare_default_user_gets_prefixed() {
        let config = GatewayConfig::new().with_default_user("guest");
        assert_eq!(config.default_user(), "system.user.guest");

        let config = GatewayConfig::new().with_default_user("system.user.guest");
        assert_eq!(config.default_user(), "system.user.guest");
    }
}

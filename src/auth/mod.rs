// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contract for the external auth/permission service.
//!
//! The gateway never stores credentials; request handlers ask an
//! [`AuthService`] whether a user may perform an operation. [`AllowAll`]
//! is the permissive implementation used when the routing layer already
//! authenticated the request, and in tests.

use std::fmt;
use std::future::Future;

use crate::error::Error;

/// What a permission check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionScope {
    /// State values.
    State,
    /// Object metadata.
    Object,
}

/// The operation a permission check asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read a single entry.
    Read,
    /// Write an entry.
    Write,
    /// Enumerate entries.
    List,
}

/// A single `(scope, operation)` pair to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionCheck {
    /// The scope the operation applies to.
    pub scope: PermissionScope,
    /// The requested operation.
    pub operation: Operation,
}

impl PermissionCheck {
    /// Shorthand for `state/read`.
    pub const STATE_READ: Self = Self {
        scope: PermissionScope::State,
        operation: Operation::Read,
    };
    /// Shorthand for `state/write`.
    pub const STATE_WRITE: Self = Self {
        scope: PermissionScope::State,
        operation: Operation::Write,
    };
    /// Shorthand for `state/list`.
    pub const STATE_LIST: Self = Self {
        scope: PermissionScope::State,
        operation: Operation::List,
    };
}

impl fmt::Display for PermissionCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            PermissionScope::State => "state",
            PermissionScope::Object => "object",
        };
        let operation = match self.operation {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::List => "list",
        };
        write!(f, "{scope}/{operation}")
    }
}

/// Contract the gateway consumes from the external auth service.
pub trait AuthService: Send + Sync {
    /// Checks that `user` may perform every operation in `checks`.
    ///
    /// Returns [`Error::Permission`] naming the first denied operation.
    fn check_permissions(
        &self,
        user: &str,
        checks: &[PermissionCheck],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Verifies a user/password pair.
    fn check_password(
        &self,
        user: &str,
        password: &str,
    ) -> impl Future<Output = bool> + Send;
}

/// Auth service that grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthService for AllowAll {
    async fn check_permissions(
        &self,
        _user: &str,
        _checks: &[PermissionCheck],
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn check_password(&self, _user: &str, _password: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_check_display() {
        assert_eq!(PermissionCheck::STATE_READ.to_string(), "state/read");
        assert_eq!(PermissionCheck::STATE_WRITE.to_string(), "state/write");
        assert_eq!(
            PermissionCheck {
                scope: PermissionScope::Object,
                operation: Operation::List,
            }
            .to_string(),
            "object/list"
        );
    }

    #[tokio::test]
    async fn allow_all_grants_everything() {
        let auth = AllowAll;
        assert!(
            auth.check_permissions("system.user.guest", &[PermissionCheck::STATE_WRITE])
                .await
                .is_ok()
        );
        assert!(auth.check_password("any", "thing").await);
    }
}

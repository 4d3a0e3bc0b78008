// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A cloud-issued session binding a tag to a user and a permission set.
///
/// The session cache owns every live `TokenSession`; everyone else holds an
/// `Arc` observer obtained from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSession {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    pub permissions: BTreeSet<String>,
    /// Remaining validity at issue time; `None` means no expiry.
    pub expires_in_secs: Option<u64>,
}

impl TokenSession {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

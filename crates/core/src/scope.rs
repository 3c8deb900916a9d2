// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ownership scopes and resource policies.
//!
//! Every session is owned by a keypair inside a user/group/domain hierarchy.
//! Quota enforcement and fair-share accounting aggregate per scope; a single
//! running kernel therefore contributes to four scope totals at once.

use crate::slot::ResourceSlots;
use serde::{Deserialize, Serialize};

/// The identity a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub access_key: String,
    pub user: String,
    pub group: String,
    pub domain: String,
}

impl Owner {
    /// All scopes this owner's usage is accounted against, narrowest first.
    pub fn scopes(&self) -> [Scope; 4] {
        [
            Scope::Keypair(self.access_key.clone()),
            Scope::User(self.user.clone()),
            Scope::Group(self.group.clone()),
            Scope::Domain(self.domain.clone()),
        ]
    }
}

/// One level of the ownership hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Scope {
    Keypair(String),
    User(String),
    Group(String),
    Domain(String),
}

impl Scope {
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Keypair(_) => "keypair",
            Scope::User(_) => "user",
            Scope::Group(_) => "group",
            Scope::Domain(_) => "domain",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Scope::Keypair(n) | Scope::User(n) | Scope::Group(n) | Scope::Domain(n) => n,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// Caps applied to a scope.
///
/// Slot caps are open-ended: a slot name absent from `total_slots` is
/// unbounded for this scope. Count caps of `None` mean no limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Ceiling on slots held by running + scheduling sessions of the scope.
    #[serde(default)]
    pub total_slots: ResourceSlots,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_sessions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_sessions: Option<u32>,
    /// Ceiling on slots requested by pending sessions of the scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_slots: Option<ResourceSlots>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_vfolder_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_registries: Vec<String>,
    /// Terminate interactive sessions idle longer than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    /// Hard ceiling on session lifetime regardless of activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_session_lifetime_ms: Option<u64>,
}

impl ResourcePolicy {
    /// Remaining slot headroom given current usage.
    ///
    /// Slots without a declared cap stay unbounded; the infinity sentinel is
    /// absorbing, so `min()` against another limit picks the finite one.
    pub fn remaining(&self, used: &ResourceSlots) -> ResourceSlots {
        self.total_slots
            .iter()
            .map(|(name, cap)| {
                let left = cap
                    .checked_sub(used.get(name.as_str()))
                    .unwrap_or(crate::slot::Quantity::ZERO);
                (name.clone(), left)
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "scope_tests.rs"]
mod tests;

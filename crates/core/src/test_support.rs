// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for tests across the workspace.
//!
//! Enabled for other crates via the `test-support` feature.

use crate::scope::Owner;
use crate::slot::{Quantity, ResourceSlots, SlotName};

/// Build a slot map from `(name, raw_quantity)` pairs.
///
/// Raw units: milli-units for COUNT slots, bytes for BYTES slots.
pub fn slots(pairs: &[(&str, u64)]) -> ResourceSlots {
    pairs
        .iter()
        .map(|(name, q)| (SlotName::new(*name), Quantity(*q)))
        .collect()
}

/// An owner whose user/group/domain derive from the access key.
pub fn owner(access_key: &str) -> Owner {
    Owner {
        access_key: access_key.to_string(),
        user: format!("user-{access_key}"),
        group: format!("group-{access_key}"),
        domain: "default".to_string(),
    }
}

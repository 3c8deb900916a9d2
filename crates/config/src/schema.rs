// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot-schema registry: the closed slot vocabulary of a resource group.
//!
//! Loaded at startup from config. Enqueue validation parses the request's
//! human-written quantities against this table; a slot name the group never
//! declared is rejected before the session touches the queue.

use berth_core::{ResourceSlots, SlotError, SlotName, SlotType};
use indexmap::IndexMap;

/// The slot vocabulary of one resource group.
#[derive(Debug, Clone, Default)]
pub struct SlotSchema {
    slots: IndexMap<SlotName, SlotType>,
}

impl SlotSchema {
    pub fn new(slots: IndexMap<SlotName, SlotType>) -> Self {
        Self { slots }
    }

    pub fn slot_type(&self, name: &str) -> Option<SlotType> {
        self.slots.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &SlotName> {
        self.slots.keys()
    }

    /// Parse a request's `slot → human string` map into typed quantities.
    ///
    /// Unknown slot names fail; UNIQUE slots above 1 fail inside parsing.
    pub fn parse_request(
        &self,
        request: &IndexMap<SlotName, String>,
    ) -> Result<ResourceSlots, SlotError> {
        let mut out = ResourceSlots::new();
        for (name, value) in request {
            let slot_type = self
                .slot_type(name.as_str())
                .ok_or_else(|| SlotError::UnknownSlot(name.clone()))?;
            out.insert(name.clone(), slot_type.parse_quantity(value)?);
        }
        Ok(out)
    }

    /// Check that already-typed slots only use declared names.
    pub fn check_names(&self, slots: &ResourceSlots) -> Result<(), SlotError> {
        for name in slots.names() {
            if self.slot_type(name.as_str()).is_none() {
                return Err(SlotError::UnknownSlot(name.clone()));
            }
        }
        Ok(())
    }

    /// Render typed slots back into operator-facing strings.
    pub fn format(&self, slots: &ResourceSlots) -> IndexMap<SlotName, String> {
        slots
            .iter()
            .map(|(name, q)| {
                let text = match self.slot_type(name.as_str()) {
                    Some(ty) => ty.format_quantity(q),
                    None => format!("{}", q.0),
                };
                (name.clone(), text)
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;

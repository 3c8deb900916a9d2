// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed resource-slot arithmetic.
//!
//! A [`ResourceSlots`] value is a multiset of quantities keyed by slot name
//! (`cpu`, `mem`, `cuda.device`, …). Addition is component-wise, comparison is
//! the conjunction of per-key `<=`, and subtraction forbids underflow per key.
//! Unknown keys are never auto-created by arithmetic; requests referencing a
//! slot name that is not declared in the resource group's schema are rejected
//! at validation time, before they reach any of this.
//!
//! COUNT quantities are stored in milli-units so fractional requests
//! ("cpu = 0.5") stay exact integers; BYTES are raw bytes; UNIQUE is 0 or 1.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

crate::define_id! {
    /// Name of a resource slot (e.g. "cpu", "mem", "cuda.device").
    pub struct SlotName;
}

/// Errors from slot arithmetic and quantity parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot '{name}' would underflow ({have} < {need})")]
    Underflow { name: SlotName, have: u64, need: u64 },
    #[error("unknown slot '{0}'")]
    UnknownSlot(SlotName),
    #[error("invalid quantity '{value}': {reason}")]
    InvalidQuantity { value: String, reason: String },
}

/// How quantities of a slot are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    /// Divisible units, possibly fractional (stored as milli-units).
    Count,
    /// Whole bytes (suffixes K/M/G/T accepted when parsing).
    Bytes,
    /// At most one per kernel.
    Unique,
}

crate::simple_display! {
    SlotType {
        Count => "count",
        Bytes => "bytes",
        Unique => "unique",
    }
}

impl SlotType {
    /// Parse a human-written quantity for this slot type.
    pub fn parse_quantity(&self, value: &str) -> Result<Quantity, SlotError> {
        let invalid = |reason: &str| SlotError::InvalidQuantity {
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let value = value.trim();
        if value.is_empty() {
            return Err(invalid("empty"));
        }

        match self {
            SlotType::Count => {
                // Fixed-point with up to three fractional digits.
                let (whole, frac) = match value.split_once('.') {
                    Some((w, f)) => (w, f),
                    None => (value, ""),
                };
                if frac.len() > 3 {
                    return Err(invalid("at most 3 fractional digits"));
                }
                let whole: u64 = whole.parse().map_err(|_| invalid("not a number"))?;
                let mut milli = whole
                    .checked_mul(1000)
                    .ok_or_else(|| invalid("out of range"))?;
                if !frac.is_empty() {
                    let scale = 10u64.pow(3 - frac.len() as u32);
                    let frac: u64 = frac.parse().map_err(|_| invalid("not a number"))?;
                    milli = milli
                        .checked_add(frac * scale)
                        .ok_or_else(|| invalid("out of range"))?;
                }
                Ok(Quantity(milli))
            }
            SlotType::Bytes => {
                let (digits, suffix) = value
                    .char_indices()
                    .find(|(_, c)| !c.is_ascii_digit())
                    .map(|(i, _)| (&value[..i], &value[i..]))
                    .unwrap_or((value, ""));
                let base: u64 = digits.parse().map_err(|_| invalid("not a number"))?;
                let mult: u64 = match suffix.trim_end_matches(['i', 'B', 'b']) {
                    "" => 1,
                    "K" | "k" => 1 << 10,
                    "M" | "m" => 1 << 20,
                    "G" | "g" => 1 << 30,
                    "T" | "t" => 1 << 40,
                    _ => return Err(invalid("unknown byte suffix")),
                };
                base.checked_mul(mult)
                    .map(Quantity)
                    .ok_or_else(|| invalid("out of range"))
            }
            SlotType::Unique => match value {
                "0" => Ok(Quantity::ZERO),
                "1" => Ok(Quantity(1)),
                _ => Err(invalid("unique slots are 0 or 1")),
            },
        }
    }

    /// Render a quantity for operator display.
    pub fn format_quantity(&self, q: Quantity) -> String {
        if q.is_unbounded() {
            return "unlimited".to_string();
        }
        match self {
            SlotType::Count => {
                if q.0 % 1000 == 0 {
                    format!("{}", q.0 / 1000)
                } else {
                    format!("{}.{:03}", q.0 / 1000, q.0 % 1000)
                        .trim_end_matches('0')
                        .to_string()
                }
            }
            SlotType::Bytes => {
                const UNITS: [(&str, u64); 4] =
                    [("T", 1 << 40), ("G", 1 << 30), ("M", 1 << 20), ("K", 1 << 10)];
                for (suffix, mult) in UNITS {
                    if q.0 >= mult && q.0 % mult == 0 {
                        return format!("{}{}", q.0 / mult, suffix);
                    }
                }
                format!("{}", q.0)
            }
            SlotType::Unique => format!("{}", q.0),
        }
    }
}

/// A single slot quantity.
///
/// The raw integer unit depends on the slot type (milli-units for COUNT,
/// bytes for BYTES); arithmetic is uniform. [`Quantity::UNBOUNDED`] is the
/// infinity sentinel used by policy caps: it absorbs under `min` (it is the
/// maximum value) and under addition (saturating).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(pub u64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);
    pub const UNBOUNDED: Quantity = Quantity(u64::MAX);

    /// A COUNT quantity of `n` whole units.
    pub const fn units(n: u64) -> Self {
        Quantity(n * 1000)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_unbounded(&self) -> bool {
        self.0 == u64::MAX
    }

    /// Component addition; the unbounded sentinel is absorbing.
    pub fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }

    /// Component subtraction; `None` on underflow. Subtracting from the
    /// unbounded sentinel leaves it unbounded.
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        if self.is_unbounded() {
            return Some(self);
        }
        self.0.checked_sub(other.0).map(Quantity)
    }
}

/// An ordered map of slot name → quantity.
///
/// Insertion order is preserved so serialized forms and log lines are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSlots(IndexMap<SlotName, Quantity>);

impl ResourceSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0.values().all(Quantity::is_zero)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Quantity for a slot; absent keys read as zero.
    pub fn get(&self, name: &str) -> Quantity {
        self.0.get(name).copied().unwrap_or(Quantity::ZERO)
    }

    pub fn insert(&mut self, name: impl Into<SlotName>, q: Quantity) {
        self.0.insert(name.into(), q);
    }

    pub fn with(mut self, name: impl Into<SlotName>, q: Quantity) -> Self {
        self.insert(name, q);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SlotName, Quantity)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &SlotName> {
        self.0.keys()
    }

    /// Component-wise sum over the union of keys.
    pub fn added(&self, other: &ResourceSlots) -> ResourceSlots {
        let mut out = self.clone();
        for (name, q) in other.iter() {
            let cur = out.get(name.as_str());
            out.insert(name.clone(), cur.saturating_add(q));
        }
        out
    }

    /// Component-wise subtraction of `other` from `self`.
    ///
    /// Every key of `other` must be covered by `self`; going below zero on
    /// any key is an error, never a silent clamp.
    pub fn subtracted(&self, other: &ResourceSlots) -> Result<ResourceSlots, SlotError> {
        let mut out = self.clone();
        for (name, need) in other.iter() {
            if need.is_zero() {
                continue;
            }
            let have = out.get(name.as_str());
            let left = have.checked_sub(need).ok_or_else(|| SlotError::Underflow {
                name: name.clone(),
                have: have.0,
                need: need.0,
            })?;
            out.insert(name.clone(), left);
        }
        Ok(out)
    }

    /// Conjunction of per-key `<=` against `avail`.
    ///
    /// Keys absent from `avail` read as zero, so a request for a slot the
    /// other side does not have never fits.
    pub fn fits_within(&self, avail: &ResourceSlots) -> bool {
        self.iter()
            .all(|(name, need)| need <= avail.get(name.as_str()))
    }

    /// Largest per-key ratio of `self` over `total`, as a fraction in [0, 1].
    ///
    /// This is the dominant share used by the DRF queue policy. Keys with an
    /// unbounded or zero total contribute nothing.
    pub fn dominant_share_against(&self, total: &ResourceSlots) -> f64 {
        self.iter()
            .filter_map(|(name, used)| {
                let cap = total.get(name.as_str());
                if cap.is_zero() || cap.is_unbounded() {
                    None
                } else {
                    Some(used.0 as f64 / cap.0 as f64)
                }
            })
            .fold(0.0, f64::max)
    }
}

impl FromIterator<(SlotName, Quantity)> for ResourceSlots {
    fn from_iter<T: IntoIterator<Item = (SlotName, Quantity)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
#[path = "slot_tests.rs"]
mod tests;

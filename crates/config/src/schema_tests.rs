// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use berth_core::{Quantity, SlotError};

fn schema() -> SlotSchema {
    SlotSchema::new(IndexMap::from([
        (SlotName::new("cpu"), SlotType::Count),
        (SlotName::new("mem"), SlotType::Bytes),
        (SlotName::new("cuda.device"), SlotType::Unique),
    ]))
}

fn request(pairs: &[(&str, &str)]) -> IndexMap<SlotName, String> {
    pairs
        .iter()
        .map(|(n, v)| (SlotName::new(*n), v.to_string()))
        .collect()
}

#[test]
fn parses_typed_quantities() {
    let slots = schema()
        .parse_request(&request(&[("cpu", "2.5"), ("mem", "8G"), ("cuda.device", "1")]))
        .unwrap();
    assert_eq!(slots.get("cpu"), Quantity(2_500));
    assert_eq!(slots.get("mem"), Quantity(8 << 30));
    assert_eq!(slots.get("cuda.device"), Quantity(1));
}

#[test]
fn unknown_slot_is_rejected() {
    let err = schema()
        .parse_request(&request(&[("tpu.device", "1")]))
        .unwrap_err();
    assert_eq!(err, SlotError::UnknownSlot(SlotName::new("tpu.device")));
}

#[test]
fn check_names_catches_undeclared() {
    let slots = berth_core::test_support::slots(&[("cpu", 1_000), ("fpga", 1)]);
    let err = schema().check_names(&slots).unwrap_err();
    assert_eq!(err, SlotError::UnknownSlot(SlotName::new("fpga")));
}

#[test]
fn format_renders_per_type() {
    let slots = berth_core::test_support::slots(&[("cpu", 2_500), ("mem", 8 << 30)]);
    let rendered = schema().format(&slots);
    assert_eq!(rendered.get("cpu").map(String::as_str), Some("2.5"));
    assert_eq!(rendered.get("mem").map(String::as_str), Some("8G"));
}

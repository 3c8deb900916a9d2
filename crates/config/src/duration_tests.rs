// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[yare::parameterized(
    millis = { "250ms", 0, 250 },
    bare_secs = { "30", 30, 0 },
    secs = { "30s", 30, 0 },
    minutes = { "5m", 300, 0 },
    hours = { "1h", 3600, 0 },
    days = { "2d", 172800, 0 },
)]
fn parses(input: &str, secs: u64, millis: u64) {
    let d = parse_duration(input).unwrap();
    assert_eq!(d, Duration::from_secs(secs) + Duration::from_millis(millis));
}

#[yare::parameterized(
    empty = { "" },
    junk = { "abc" },
    bad_suffix = { "5x" },
    negative = { "-5s" },
)]
fn rejects(input: &str) {
    assert!(parse_duration(input).is_err());
}

#[yare::parameterized(
    millis = { 1500, "1500ms" },
    secs = { 45_000, "45s" },
    minutes = { 300_000, "5m" },
    hours = { 7_200_000, "2h" },
)]
fn formats(ms: u64, expected: &str) {
    assert_eq!(format_duration(Duration::from_millis(ms)), expected);
}

#[test]
fn roundtrip_through_serde_str() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct Wrap {
        #[serde(with = "super::serde_str")]
        d: Duration,
    }
    let w: Wrap = toml::from_str("d = \"90s\"").unwrap();
    assert_eq!(w.d, Duration::from_secs(90));
    let text = toml::to_string(&Wrap { d: Duration::from_secs(90) }).unwrap();
    assert_eq!(text.trim(), "d = \"90s\"");
}

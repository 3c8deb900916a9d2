//! berthd command-line surface.

use crate::prelude::*;

#[test]
fn version_flag_prints_and_exits_zero() {
    let output = assert_cmd::Command::new(binary_path("berthd"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("berthd"));
}

#[test]
fn help_flag_documents_usage() {
    let output = assert_cmd::Command::new(binary_path("berthd"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("USAGE"));
}

#[test]
fn unexpected_argument_fails() {
    let output = assert_cmd::Command::new(binary_path("berthd"))
        .arg("--bogus")
        .output()
        .unwrap();
    assert!(!output.status.success());
}

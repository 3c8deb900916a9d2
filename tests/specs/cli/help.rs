//! CLI help and version output.

use crate::prelude::*;

#[test]
fn help_lists_operator_commands() {
    let home = SpecHome::new();
    let output = home.berth(&["--help"]);
    assert!(output.status.success());

    let text = stdout_of(&output);
    for command in [
        "enqueue",
        "sessions",
        "query",
        "cancel",
        "destroy",
        "force-terminate",
        "restart",
        "show-queue",
        "drain-agent",
        "recalc-usage",
        "rescan-images",
        "daemon",
    ] {
        assert!(text.contains(command), "--help should mention '{command}'");
    }
}

#[test]
fn version_prints_and_exits_zero() {
    let home = SpecHome::new();
    let output = home.berth(&["--version"]);
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("berth"));
}

#[test]
fn subcommand_help_shows_flags() {
    let home = SpecHome::new();
    let output = home.berth(&["enqueue", "--help"]);
    assert!(output.status.success());
    let text = stdout_of(&output);
    assert!(text.contains("--slot"));
    assert!(text.contains("--image"));
    assert!(text.contains("--cluster-size"));
}

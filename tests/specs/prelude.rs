//! Test helpers for behavioral specifications.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use std::path::PathBuf;
use std::process::Output;

/// Resolve a workspace binary relative to the test binary itself.
/// The test binary lives at target/debug/deps/specs-<hash>, so its
/// grandparent is target/debug/ where berth and berthd are built.
pub fn binary_path(name: &str) -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(debug_dir) = exe.parent().and_then(|d| d.parent()) {
            let candidate = debug_dir.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from(name)
}

/// A scratch home for one spec: isolated state dir via BERTH_STATE_DIR.
pub struct SpecHome {
    pub dir: tempfile::TempDir,
}

impl SpecHome {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Run `berth` with this home's state dir.
    pub fn berth(&self, args: &[&str]) -> Output {
        assert_cmd::Command::new(binary_path("berth"))
            .env("BERTH_STATE_DIR", self.dir.path())
            .args(args)
            .output()
            .unwrap()
    }

    /// Spawn `berthd` in the background, wait for READY on stdout.
    pub fn spawn_daemon(&self) -> std::process::Child {
        use std::io::{BufRead, BufReader};

        let mut child = std::process::Command::new(binary_path("berthd"))
            .env("BERTH_STATE_DIR", self.dir.path())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap();

        let stdout = child.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if std::time::Instant::now() > deadline {
                let _ = child.kill();
                panic!("berthd did not print READY in time");
            }
            match lines.next() {
                Some(Ok(line)) if line.trim() == "READY" => break,
                Some(Ok(_)) => continue,
                _ => {
                    let _ = child.kill();
                    panic!("berthd exited before READY");
                }
            }
        }
        child
    }
}

pub fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Berth daemon (berthd)
//!
//! Background process that owns the event loop, the per-group scheduler
//! loops, the dispatch coordinator, and the lifecycle reconciler.
//!
//! Architecture:
//! - Listener task: socket I/O, turns requests into ops calls
//! - Scheduler loop: one cycle per tick/wake per resource group
//! - Reconciler: periodic check-and-transit
//! - Engine loop (this file): WAL bookkeeping, flush, checkpoints, signals

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::sync::Arc;
use std::time::Duration;

use berth_daemon::lifecycle::{self, LifecycleError, Paths, StartupResult};
use berth_daemon::listener::{ListenCtx, Listener};
use berth_storage::{CheckpointHandle, Checkpointer};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Start a background checkpoint every this many processed events.
const CHECKPOINT_EVERY: u64 = 512;

/// WAL group-commit flush cadence.
const FLUSH_TICK: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("berthd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: berthd [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let paths = Paths::load()?;
    let _log_guard = setup_logging(&paths)?;

    info!("starting berthd {}", env!("CARGO_PKG_VERSION"));

    let StartupResult {
        daemon,
        listener,
        engine_feed,
        scheduler,
        scheduler_wake,
        reconciler,
    } = match lifecycle::startup(&paths).await {
        Ok(result) => result,
        Err(LifecycleError::LockFailed(_)) => {
            let pid = std::fs::read_to_string(&paths.lock_path)
                .unwrap_or_default()
                .trim()
                .to_string();
            eprintln!("berthd is already running");
            if !pid.is_empty() {
                eprintln!("  pid: {pid}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            return Err(e.into());
        }
    };

    // Listener task.
    let shutdown = Arc::new(Notify::new());
    let listen_ctx = Arc::new(ListenCtx {
        ops: Arc::clone(&daemon.ops),
        state: Arc::clone(&daemon.state),
        event_bus: daemon.event_bus.clone(),
        start_time: daemon.start_time,
        shutdown: Arc::clone(&shutdown),
    });
    tokio::spawn(Listener::new(listener, listen_ctx).run());

    // Scheduler + reconciler tasks.
    tokio::spawn(scheduler.run(scheduler_wake));
    tokio::spawn(reconciler.run());

    // Engine loop: WAL bookkeeping, durability, checkpoints, signals.
    let checkpointer = Checkpointer::new(daemon.paths.snapshot_path.clone());
    let mut checkpoint: Option<CheckpointHandle> = None;
    let mut since_checkpoint: u64 = 0;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut flush_tick = tokio::time::interval(FLUSH_TICK);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Startup marker for whoever spawned us; explicit flush since stdout is
    // block-buffered when piped.
    println!("READY");
    {
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }

    loop {
        tokio::select! {
            entry = engine_feed.next() => {
                match entry {
                    Ok(entry) => {
                        // Every writer goes through the WalSink, which has
                        // already applied the event to live state. Here we
                        // only advance the processed watermark; re-applying
                        // would double-count ledger deltas.
                        engine_feed.mark_processed(entry.seq);
                        since_checkpoint += 1;
                    }
                    Err(e) => {
                        error!(error = %e, "event read failed");
                        break;
                    }
                }
            }
            _ = flush_tick.tick() => {
                if daemon.event_bus.needs_flush() {
                    if let Err(e) = daemon.event_bus.flush() {
                        error!(error = %e, "WAL flush failed");
                    }
                }
            }
            _ = shutdown.notified() => {
                info!("shutdown requested over IPC");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
                break;
            }
        }

        // Checkpoint bookkeeping outside the select arms.
        if let Some(handle) = checkpoint.take() {
            match handle.try_wait() {
                None => checkpoint = Some(handle),
                Some(Ok(result)) => {
                    if let Err(e) = engine_feed.compact_through(result.seq) {
                        warn!(error = %e, "WAL compaction after checkpoint failed");
                    } else {
                        info!(seq = result.seq, bytes = result.size_bytes, "checkpoint complete");
                    }
                }
                Some(Err(e)) => warn!(error = %e, "checkpoint failed"),
            }
        } else if since_checkpoint >= CHECKPOINT_EVERY {
            // (write_seq, state) must be read under one state lock so the
            // snapshot pairs exactly with its sequence number.
            let (seq, state) = {
                let state = daemon.state.lock();
                (daemon.event_bus.write_seq(), state.clone())
            };
            if let Err(e) = daemon.event_bus.flush() {
                error!(error = %e, "WAL flush before checkpoint failed");
            } else {
                checkpoint = Some(checkpointer.start(seq, &state));
                since_checkpoint = 0;
            }
        }
    }

    daemon.shutdown();
    Ok(())
}

fn print_help() {
    println!("berthd {}", env!("CARGO_PKG_VERSION"));
    println!("Berth daemon - schedules compute sessions onto worker agents");
    println!();
    println!("USAGE:");
    println!("    berthd");
    println!();
    println!("The daemon is typically started by the `berth` CLI and should not");
    println!("be invoked directly. It listens on a Unix socket for commands");
    println!("from `berth` and for worker heartbeats.");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print help information");
    println!("    -v, --version    Print version information");
}

/// Set up logging to the daemon log file.
fn setup_logging(
    paths: &Paths,
) -> Result<tracing_appender::non_blocking::WorkerGuard, std::io::Error> {
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(&paths.state_dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_env("BERTH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle management: startup, recovery, shutdown.
//!
//! Startup order matters: take the instance lock first, then recover state
//! (snapshot + WAL replay), then bind the socket last so clients only see a
//! daemon that is actually ready.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use berth_config::{Config, LeaseBackend};
use berth_core::{SystemClock, UuidIdGen};
use berth_rpc::AgentPool;
use berth_sched::{
    agent_selector_from_config, selector_from_config, CoreContext, Dispatcher, EventSink,
    FileLease, HookRegistry, LeaderLease, MemoryLease, Ops, Reconciler, SchedulerLoop,
};
use berth_storage::{MaterializedState, Snapshot, Wal};
use fs2::FileExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent_client::WireAgentClient;
use crate::event_bus::{EngineFeed, EventBus, WalSink};

/// The daemon's concrete context type.
pub type DaemonContext = CoreContext<WireAgentClient, SystemClock>;
pub type DaemonOps = Ops<WireAgentClient, SystemClock>;

/// Filesystem layout of one daemon instance.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root state directory (e.g. ~/.local/state/berth)
    pub state_dir: PathBuf,
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Path to the lock/PID file
    pub lock_path: PathBuf,
    /// Path to the daemon log file
    pub log_path: PathBuf,
    /// Path to the WAL file
    pub wal_path: PathBuf,
    /// Path to the snapshot file
    pub snapshot_path: PathBuf,
    /// Path to the manager config file
    pub config_path: PathBuf,
}

impl Paths {
    /// Resolve paths from the environment.
    ///
    /// `BERTH_STATE_DIR` takes priority (used by tests for isolation), then
    /// `XDG_STATE_HOME/berth`, then `~/.local/state/berth`.
    pub fn load() -> Result<Self, LifecycleError> {
        let state_dir = state_dir()?;
        let config_path = match std::env::var("BERTH_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => state_dir.join("berth.toml"),
        };

        Ok(Self {
            socket_path: state_dir.join("berthd.sock"),
            lock_path: state_dir.join("berthd.pid"),
            log_path: state_dir.join("berthd.log"),
            wal_path: state_dir.join("wal").join("events.wal"),
            snapshot_path: state_dir.join("snapshot.zst"),
            config_path,
            state_dir,
        })
    }
}

/// Live daemon state handed to the engine loop.
pub struct DaemonState {
    pub paths: Paths,
    // NOTE(lifetime): held to maintain the exclusive instance lock
    #[allow(dead_code)]
    lock_file: File,
    pub config: Arc<Config>,
    pub state: Arc<Mutex<MaterializedState>>,
    pub event_bus: EventBus,
    pub ops: Arc<DaemonOps>,
    pub cancel: CancellationToken,
    pub start_time: Instant,
}

/// Everything `startup` produces; the tasks get spawned by `main`.
pub struct StartupResult {
    pub daemon: DaemonState,
    pub listener: UnixListener,
    pub engine_feed: EngineFeed,
    pub scheduler: SchedulerLoop<WireAgentClient, SystemClock>,
    pub scheduler_wake: mpsc::Receiver<()>,
    pub reconciler: Reconciler<WireAgentClient, SystemClock>,
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("could not determine state directory")]
    NoStateDir,

    #[error("failed to acquire lock: daemon already running?")]
    LockFailed(#[source] std::io::Error),

    #[error("failed to bind socket at {0}: {1}")]
    BindFailed(PathBuf, std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] berth_config::ConfigError),

    #[error("WAL error: {0}")]
    Wal(#[from] berth_storage::WalError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] berth_storage::SnapshotError),

    #[error("scheduler error: {0}")]
    Sched(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Start the daemon.
pub async fn startup(paths: &Paths) -> Result<StartupResult, LifecycleError> {
    match startup_inner(paths).await {
        Ok(result) => Ok(result),
        Err(e) => {
            // Don't clean up on a lock failure; those files belong to the
            // already-running daemon.
            if !matches!(e, LifecycleError::LockFailed(_)) {
                cleanup_on_failure(paths);
            }
            Err(e)
        }
    }
}

async fn startup_inner(paths: &Paths) -> Result<StartupResult, LifecycleError> {
    std::fs::create_dir_all(&paths.state_dir)?;

    // 1. Acquire the instance lock FIRST - prevents races. Avoid truncating
    // before holding the lock, which would wipe a running daemon's PID.
    let lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&paths.lock_path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(LifecycleError::LockFailed)?;
    {
        use std::io::Write;
        let mut f = &lock_file;
        f.set_len(0)?;
        writeln!(f, "{}", std::process::id())?;
    }

    // 2. Load the manager configuration.
    let config = if paths.config_path.exists() {
        Config::load(&paths.config_path)?
    } else {
        warn!(
            path = %paths.config_path.display(),
            "no config file, starting with the built-in default resource group"
        );
        default_config()?
    };
    let config = Arc::new(config);

    // 3. Recover state: snapshot, then replay the WAL tail.
    let (mut recovered, processed_seq) =
        match berth_storage::load_snapshot(&paths.snapshot_path)? {
            Some(snapshot) => {
                info!(
                    seq = snapshot.seq,
                    sessions = snapshot.state.sessions.len(),
                    agents = snapshot.state.agents.len(),
                    "loaded snapshot"
                );
                (snapshot.state, snapshot.seq)
            }
            None => {
                info!("no snapshot found, starting with empty state");
                (MaterializedState::default(), 0)
            }
        };

    let wal = Wal::open(&paths.wal_path, processed_seq)?;
    let replay = wal.entries_after(processed_seq)?;
    let replay_count = replay.len();
    for entry in &replay {
        recovered.apply_event(&entry.event);
    }
    if replay_count > 0 {
        info!(events = replay_count, after_seq = processed_seq, "replayed WAL tail");
    }
    info!(
        sessions = recovered.sessions.len(),
        kernels = recovered.kernels.len(),
        agents = recovered.agents.len(),
        "state recovered"
    );

    let state = Arc::new(Mutex::new(recovered));
    let (event_bus, engine_feed) = EventBus::new(wal);
    let sink: Arc<dyn EventSink> =
        Arc::new(WalSink::new(event_bus.clone(), Arc::clone(&state)));

    // 4. Assemble the core context.
    let client = WireAgentClient::new(Arc::clone(&state));
    let pool = Arc::new(AgentPool::new(
        Arc::new(client),
        config.agent.default_concurrency_budget,
    ));
    let ctx = CoreContext {
        state: Arc::clone(&state),
        sink,
        config: Arc::clone(&config),
        pool,
        clock: SystemClock,
        ids: Arc::new(UuidIdGen),
    };

    // 5. Leader lease backend per configuration.
    let lease: Arc<dyn LeaderLease> = match config.lease.backend {
        LeaseBackend::File => {
            let dir = config
                .lease
                .dir
                .clone()
                .unwrap_or_else(|| paths.state_dir.join("leases"));
            Arc::new(FileLease::new(dir, SystemClock))
        }
        LeaseBackend::Memory => Arc::new(MemoryLease::new(SystemClock)),
    };

    // 6. Scheduler loop, dispatcher, reconciler, northbound ops.
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(ctx.clone(), cancel.clone());
    let (dispatch_tx, mut dispatch_rx) = mpsc::channel(256);
    let (wake_tx, scheduler_wake) = mpsc::channel(64);

    let scheduler = SchedulerLoop::new(
        ctx.clone(),
        Arc::clone(&lease),
        selector_from_config(&config),
        agent_selector_from_config(&config, &HookRegistry::new())
            .map_err(|e| LifecycleError::Sched(e.to_string()))?,
        dispatch_tx,
        cancel.clone(),
    );
    let reconciler = Reconciler::new(ctx.clone(), dispatcher.clone(), lease, cancel.clone());
    let ops = Arc::new(Ops::new(ctx.clone(), dispatcher.clone(), wake_tx));

    // Dispatch worker: drives scheduled sessions as the loop hands them over.
    {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    handed = dispatch_rx.recv() => {
                        let Some((id, token)) = handed else { return };
                        if let Err(e) = dispatcher.run_session(&id, token).await {
                            warn!(session = %id, error = %e, "dispatch failed");
                        }
                    }
                }
            }
        });
    }

    // 7. Bind the socket LAST - only after everything else is ready.
    if paths.socket_path.exists() {
        std::fs::remove_file(&paths.socket_path)?;
    }
    let listener = UnixListener::bind(&paths.socket_path)
        .map_err(|e| LifecycleError::BindFailed(paths.socket_path.clone(), e))?;

    info!("daemon started");

    Ok(StartupResult {
        daemon: DaemonState {
            paths: paths.clone(),
            lock_file,
            config,
            state,
            event_bus,
            ops,
            cancel,
            start_time: Instant::now(),
        },
        listener,
        engine_feed,
        scheduler,
        scheduler_wake,
        reconciler,
    })
}

impl DaemonState {
    /// Shutdown the daemon gracefully: stop the loops, flush the WAL, save a
    /// final snapshot so the next startup skips replay, remove IPC files.
    pub fn shutdown(&self) {
        info!("shutting down daemon...");
        self.cancel.cancel();

        if let Err(e) = self.event_bus.flush() {
            warn!(error = %e, "failed to flush WAL on shutdown");
        }

        let (seq, state_clone) = {
            let state = self.state.lock();
            (self.event_bus.write_seq(), state.clone())
        };
        if seq > 0 {
            let snapshot = Snapshot::new(seq, state_clone);
            match snapshot.save(&self.paths.snapshot_path) {
                Ok(()) => info!(seq, "saved final shutdown snapshot"),
                Err(e) => warn!(error = %e, "failed to save shutdown snapshot"),
            }
        }

        if self.paths.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.paths.socket_path) {
                warn!(error = %e, "failed to remove socket file");
            }
        }
        if self.paths.lock_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.paths.lock_path) {
                warn!(error = %e, "failed to remove PID file");
            }
        }

        info!("daemon shutdown complete");
    }
}

/// Built-in fallback config: one "default" group with cpu/mem slots.
fn default_config() -> Result<Config, berth_config::ConfigError> {
    Config::from_toml(
        r#"
[resource_groups.default.slots]
cpu = "count"
mem = "bytes"
"#,
    )
}

/// Clean up resources on startup failure
fn cleanup_on_failure(paths: &Paths) {
    if paths.socket_path.exists() {
        let _ = std::fs::remove_file(&paths.socket_path);
    }
    if paths.lock_path.exists() {
        let _ = std::fs::remove_file(&paths.lock_path);
    }
}

/// Get the state directory for berth
fn state_dir() -> Result<PathBuf, LifecycleError> {
    if let Ok(dir) = std::env::var("BERTH_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }

    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return Ok(PathBuf::from(xdg).join("berth"));
    }

    let home = std::env::var("HOME").map_err(|_| LifecycleError::NoStateDir)?;
    Ok(PathBuf::from(home).join(".local/state/berth"))
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared harness for scheduler tests: fake fleet, in-memory sink, fake
//! clock, deterministic ids, memory lease.

use crate::context::{CoreContext, EventSink};
use crate::dispatch::Dispatcher;
use crate::error::SchedError;
use crate::lease::MemoryLease;
use crate::ops::{EnqueueRequest, Ops};
use crate::queue::selector_from_config;
use crate::reconcile::Reconciler;
use crate::scheduler::SchedulerLoop;
use berth_config::Config;
use berth_core::{
    Agent, AgentStatus, Clock, ClusterMode, Event, FakeClock, Owner, ResourceGroupId, SeqIdGen,
    SessionId, SessionKind, SlotName,
};
use berth_rpc::{AgentPool, FakeAgentClient};
use berth_storage::MaterializedState;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Applies events straight to the shared state and records them, standing in
/// for the daemon's WAL-backed bus.
pub struct MemorySink {
    state: Arc<Mutex<MaterializedState>>,
    events: Mutex<Vec<Event>>,
    seq: AtomicU64,
}

impl MemorySink {
    pub fn new(state: Arc<Mutex<MaterializedState>>) -> Self {
        Self {
            state,
            events: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) -> Result<u64, SchedError> {
        self.state.lock().apply_event(&event);
        self.events.lock().push(event);
        Ok(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Default test config: one "default" group with cpu/mem, fast timings.
pub const TEST_CONFIG: &str = r#"
[scheduler]
tick_interval = "50ms"
leader_lock_ttl = "10s"
retry_cooldown = "10ms"
hol_block_threshold = 2

[rpc]
create_timeout = "2s"
destroy_timeout = "2s"
exec_timeout = "2s"
image_pull_timeout = "5s"

[reconciler]
interval = "50ms"
lost_agent_after = "30s"

[resource_groups.default.slots]
cpu = "count"
mem = "bytes"
"#;

/// Everything a scheduler test needs, wired together.
pub struct Harness {
    pub ctx: CoreContext<FakeAgentClient, FakeClock>,
    pub client: FakeAgentClient,
    pub clock: FakeClock,
    pub sink: Arc<MemorySink>,
    pub lease: MemoryLease<FakeClock>,
    pub cancel: CancellationToken,
    pub dispatch_rx: mpsc::Receiver<(SessionId, u64)>,
    pub dispatch_tx: mpsc::Sender<(SessionId, u64)>,
    pub wake_rx: mpsc::Receiver<()>,
    pub wake_tx: mpsc::Sender<()>,
}

impl Harness {
    pub fn new(config_toml: &str) -> Self {
        let config = Arc::new(
            Config::from_toml(config_toml).unwrap_or_else(|e| panic!("bad test config: {e}")),
        );
        let state = Arc::new(Mutex::new(MaterializedState::default()));
        let sink = Arc::new(MemorySink::new(Arc::clone(&state)));
        let client = FakeAgentClient::new();
        let clock = FakeClock::new();
        let pool = Arc::new(AgentPool::new(
            Arc::new(client.clone()),
            config.agent.default_concurrency_budget,
        ));
        let ctx = CoreContext {
            state,
            sink: sink.clone() as Arc<dyn EventSink>,
            config,
            pool,
            clock: clock.clone(),
            ids: Arc::new(SeqIdGen::new()),
        };
        let lease = MemoryLease::new(clock.clone());
        let (dispatch_tx, dispatch_rx) = mpsc::channel(64);
        let (wake_tx, wake_rx) = mpsc::channel(64);
        Self {
            ctx,
            client,
            clock,
            sink,
            lease,
            cancel: CancellationToken::new(),
            dispatch_rx,
            dispatch_tx,
            wake_rx,
            wake_tx,
        }
    }

    pub fn scheduler(&self) -> SchedulerLoop<FakeAgentClient, FakeClock> {
        SchedulerLoop::new(
            self.ctx.clone(),
            Arc::new(self.lease.clone()),
            selector_from_config(&self.ctx.config),
            crate::placement::selector_from_config(
                &self.ctx.config,
                &crate::placement::HookRegistry::new(),
            )
            .unwrap_or_else(|e| panic!("bad agent policy: {e}")),
            self.dispatch_tx.clone(),
            self.cancel.clone(),
        )
    }

    pub fn dispatcher(&self) -> Dispatcher<FakeAgentClient, FakeClock> {
        Dispatcher::new(self.ctx.clone(), self.cancel.clone())
    }

    pub fn reconciler(&self) -> Reconciler<FakeAgentClient, FakeClock> {
        Reconciler::new(
            self.ctx.clone(),
            self.dispatcher(),
            Arc::new(self.lease.clone()),
            self.cancel.clone(),
        )
    }

    pub fn ops(&self) -> Ops<FakeAgentClient, FakeClock> {
        Ops::new(self.ctx.clone(), self.dispatcher(), self.wake_tx.clone())
    }

    pub fn group(&self) -> ResourceGroupId {
        ResourceGroupId::new("default")
    }

    /// Register an agent with the given COUNT cpus and bytes of memory.
    pub fn join_agent(&self, id: &str, cpu_units: u64, mem_bytes: u64) {
        let agent = Agent {
            id: berth_core::AgentId::new(id),
            addr: format!("10.0.0.1:{id}"),
            resource_group: self.group(),
            architecture: "x86_64".into(),
            total_slots: berth_core::test_support::slots(&[
                ("cpu", cpu_units * 1000),
                ("mem", mem_bytes),
            ]),
            occupied_slots: Default::default(),
            status: AgentStatus::Alive,
            concurrency_budget: 4,
            plugins: Vec::new(),
            draining: false,
            last_heartbeat_ms: self.clock.epoch_ms(),
        };
        self.ops()
            .agent_joined(agent)
            .unwrap_or_else(|e| panic!("agent join failed: {e}"));
    }

    /// Enqueue an interactive session asking for `cpu` cores and `mem` bytes
    /// per kernel. Returns its id.
    pub fn enqueue(&self, name: &str, owner_key: &str, cpu: &str, mem: &str) -> SessionId {
        self.enqueue_with(name, owner_key, cpu, mem, 1, ClusterMode::SingleNode, SessionKind::Interactive { idle_timeout_ms: None })
    }

    pub fn enqueue_with(
        &self,
        name: &str,
        owner_key: &str,
        cpu: &str,
        mem: &str,
        cluster_size: u32,
        cluster_mode: ClusterMode,
        kind: SessionKind,
    ) -> SessionId {
        let receipt = self
            .ops()
            .enqueue_session(request(name, owner_key, cpu, mem, cluster_size, cluster_mode, kind))
            .unwrap_or_else(|e| panic!("enqueue failed: {e}"));
        receipt.session_id
    }

    /// Current status of a session.
    pub fn status_of(&self, id: &SessionId) -> berth_core::SessionStatus {
        self.ctx.with_state(|s| {
            s.sessions
                .get(id)
                .map(|sess| sess.status)
                .unwrap_or_else(|| panic!("session {id} missing"))
        })
    }

    /// Run one scheduling cycle and, if it placed a session, immediately run
    /// dispatch for it. Returns the placed session id, if any.
    pub async fn cycle_and_dispatch(&mut self) -> Option<SessionId> {
        let mut scheduler = self.scheduler();
        let group = self.group();
        let outcome = scheduler
            .run_cycle(&group)
            .await
            .unwrap_or_else(|e| panic!("cycle failed: {e}"));
        if let crate::scheduler::CycleOutcome::Placed(id) = outcome {
            let (dispatch_id, token) = self
                .dispatch_rx
                .try_recv()
                .unwrap_or_else(|_| panic!("placed session not handed to dispatch"));
            assert_eq!(dispatch_id, id);
            let _ = self.dispatcher().run_session(&id, token).await;
            Some(id)
        } else {
            None
        }
    }
}

/// Build an enqueue request with the standard test owner layout.
pub fn request(
    name: &str,
    owner_key: &str,
    cpu: &str,
    mem: &str,
    cluster_size: u32,
    cluster_mode: ClusterMode,
    kind: SessionKind,
) -> EnqueueRequest {
    let mut slots = IndexMap::new();
    slots.insert(SlotName::new("cpu"), cpu.to_string());
    slots.insert(SlotName::new("mem"), mem.to_string());
    EnqueueRequest {
        name: name.to_string(),
        owner: Owner {
            access_key: owner_key.to_string(),
            user: format!("user-{owner_key}"),
            group: format!("group-{owner_key}"),
            domain: "default".to_string(),
        },
        resource_group: ResourceGroupId::new("default"),
        slots,
        image: "cr.example.com/python:3.12".to_string(),
        architecture: "x86_64".to_string(),
        cluster_mode,
        cluster_size,
        kind,
        priority: 0,
        environ: Default::default(),
        bootstrap_script: None,
        mounts: Vec::new(),
        max_lifetime_ms: None,
    }
}

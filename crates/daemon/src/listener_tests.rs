// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::agent_client::WireAgentClient;
use crate::event_bus::WalSink;
use crate::protocol::ErrorCode;
use berth_config::Config;
use berth_core::{SystemClock, UuidIdGen};
use berth_rpc::AgentPool;
use berth_sched::{CoreContext, Dispatcher, EventSink, Ops};
use berth_storage::Wal;
use tokio_util::sync::CancellationToken;

fn listen_ctx(dir: &tempfile::TempDir) -> Arc<ListenCtx> {
    let config = Arc::new(
        Config::from_toml(
            r#"
[resource_groups.default.slots]
cpu = "count"
mem = "bytes"
"#,
        )
        .unwrap(),
    );
    let state = Arc::new(Mutex::new(MaterializedState::default()));
    let wal = Wal::open(&dir.path().join("events.wal"), 0).unwrap();
    let (event_bus, _feed) = EventBus::new(wal);
    let sink: Arc<dyn EventSink> =
        Arc::new(WalSink::new(event_bus.clone(), Arc::clone(&state)));
    let pool = Arc::new(AgentPool::new(
        Arc::new(WireAgentClient::new(Arc::clone(&state))),
        4,
    ));
    let ctx = CoreContext {
        state: Arc::clone(&state),
        sink,
        config,
        pool,
        clock: SystemClock,
        ids: Arc::new(UuidIdGen),
    };
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(ctx.clone(), cancel);
    let (wake_tx, _wake_rx) = tokio::sync::mpsc::channel(8);
    let ops = Arc::new(Ops::new(ctx, dispatcher, wake_tx));

    Arc::new(ListenCtx {
        ops,
        state,
        event_bus,
        start_time: Instant::now(),
        shutdown: Arc::new(Notify::new()),
    })
}

#[tokio::test]
async fn ping_pongs() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = listen_ctx(&dir);
    let response = handle_request(Request::Ping, &ctx).await;
    assert!(matches!(response, Response::Pong));
}

#[tokio::test]
async fn status_reports_counts() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = listen_ctx(&dir);
    let response = handle_request(Request::Status, &ctx).await;
    match response {
        Response::Status { status } => {
            assert_eq!(status.sessions, 0);
            assert_eq!(status.agents, 0);
            assert!(!status.version.is_empty());
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn enqueue_then_query_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = listen_ctx(&dir);

    let request = berth_sched::test_support::request(
        "train",
        "ak-a",
        "2",
        "4G",
        1,
        berth_core::ClusterMode::SingleNode,
        berth_core::SessionKind::Interactive { idle_timeout_ms: None },
    );
    let response = handle_request(Request::Enqueue { request }, &ctx).await;
    let id = match response {
        Response::Receipt { receipt } => {
            assert_eq!(receipt.status, berth_core::SessionStatus::Pending);
            receipt.session_id
        }
        other => panic!("unexpected response: {other:?}"),
    };

    let response = handle_request(Request::Query { id: id.to_string() }, &ctx).await;
    match response {
        Response::Session { session } => {
            assert_eq!(session.session.spec.name, "train");
            assert_eq!(session.kernels.len(), 1);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn bad_requests_map_to_typed_errors() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = listen_ctx(&dir);

    let response = handle_request(Request::Query { id: "missing".into() }, &ctx).await;
    match response {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("unexpected response: {other:?}"),
    }

    let mut request = berth_sched::test_support::request(
        "bad",
        "ak-a",
        "2",
        "4G",
        1,
        berth_core::ClusterMode::SingleNode,
        berth_core::SessionKind::Interactive { idle_timeout_ms: None },
    );
    request.resource_group = berth_core::ResourceGroupId::new("nope");
    let response = handle_request(Request::Enqueue { request }, &ctx).await;
    match response {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::BadRequest),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn worker_messages_update_state() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = listen_ctx(&dir);

    let agent = berth_core::Agent {
        id: berth_core::AgentId::new("agent-1"),
        addr: "127.0.0.1:6011".into(),
        resource_group: berth_core::ResourceGroupId::new("default"),
        architecture: "x86_64".into(),
        total_slots: berth_core::test_support::slots(&[("cpu", 8_000)]),
        occupied_slots: Default::default(),
        status: berth_core::AgentStatus::Alive,
        concurrency_budget: 4,
        plugins: vec![],
        draining: false,
        last_heartbeat_ms: 0,
    };
    let response = handle_request(Request::AgentJoin { agent }, &ctx).await;
    assert!(matches!(response, Response::Ok));
    assert!(ctx.state.lock().get_agent("agent-1").is_some());

    let response = handle_request(
        Request::AgentHeartbeat {
            agent_id: berth_core::AgentId::new("agent-1"),
            reported_slots: Default::default(),
            running_kernels: vec![],
        },
        &ctx,
    )
    .await;
    assert!(matches!(response, Response::Ok));
}

#[tokio::test]
async fn shutdown_notifies() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = listen_ctx(&dir);
    let notified = ctx.shutdown.clone();
    let wait = tokio::spawn(async move { notified.notified().await });

    let response = handle_request(Request::Shutdown, &ctx).await;
    assert!(matches!(response, Response::Ok));
    wait.await.unwrap();
}

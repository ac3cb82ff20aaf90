//! Connect, handshake, disconnect and transport loss

mod common;

use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use common::{InitBehavior, MockOptions, MockServer, init_tracing, wait_until};
use inspectmcp_client::{
    ChildStatus, ConnectOptions, ConnectionStatus, DispatchPolicy, ErrorKind, InspectorError,
    ServerCapability, SessionBuilder,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_connect_performs_handshake() {
    init_tracing();
    let server = MockServer::start();
    let session = SessionBuilder::new().build().unwrap();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let _subscription = session.on_status_change(move |status| sink.lock().push(*status));

    let result = server.connect(&session).await.unwrap();
    assert_eq!(result["serverInfo"]["name"], "mock-server");

    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(session.connected_at().is_some());
    assert!(session.last_error().is_none());
    let info = session.server_info().unwrap();
    assert_eq!(info.protocol_version, "2025-06-18");
    assert_eq!(info.instructions.as_deref(), Some("Scripted server for tests"));
    assert_eq!(
        *statuses.lock(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );

    assert!(session.server_supports(ServerCapability::Tools));
    assert!(session.server_supports(ServerCapability::ResourceSubscriptions));
    assert!(session.server_supports(ServerCapability::Logging));
    assert!(!session.server_supports(ServerCapability::Prompts));
    assert!(!session.server_supports(ServerCapability::Completions));

    let peer = Arc::clone(&server.peer);
    assert!(
        wait_until(Duration::from_secs(1), || {
            peer.methods() == ["initialize", "notifications/initialized"]
        })
        .await
    );
    let initialize = server.peer.received.lock()[0].clone();
    let params = &initialize["params"];
    assert_eq!(params["protocolVersion"], "2025-06-18");
    assert_eq!(params["clientInfo"]["name"], "inspectmcp-client");
    assert!(params["capabilities"]["sampling"].is_object());
    assert!(params["capabilities"]["elicitation"].is_object());
    assert_eq!(params["capabilities"]["roots"]["listChanged"], true);
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_rejected() {
    init_tracing();
    let server = MockServer::start();
    let session = SessionBuilder::new().build().unwrap();
    server.connect(&session).await.unwrap();

    let other = MockServer::start();
    let err = other.connect(&session).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(other.peer.methods().is_empty());
    session.ping().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_handshake_error_closes_transport() {
    init_tracing();
    let server = MockServer::start_with(MockOptions {
        init: InitBehavior::Fail,
        ..MockOptions::default()
    });
    let session = SessionBuilder::new().build().unwrap();

    let err = server.connect(&session).await.unwrap_err();
    assert!(matches!(&err, InspectorError::Connection { message, .. } if message == "handshake failed"));
    assert!(err.source().unwrap().to_string().contains("initialization exploded"));

    assert_eq!(session.status(), ConnectionStatus::Error);
    assert_eq!(session.last_error().map(|e| e.kind()), Some(ErrorKind::Connection));
    assert!(session.server_info().is_none());
    assert_eq!(server.transport.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_times_out_handshake() {
    init_tracing();
    let server = MockServer::start_with(MockOptions {
        init: InitBehavior::Silent,
        ..MockOptions::default()
    });
    let session = SessionBuilder::new().build().unwrap();

    let err = session
        .connect(
            server.transport(),
            ConnectOptions {
                handshake_policy: Some(DispatchPolicy::new(Duration::from_millis(1500))),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.source().unwrap().to_string().contains("timed out after 1500ms"));
    assert_eq!(session.status(), ConnectionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_transport_refusal_reported() {
    init_tracing();
    let server = MockServer::start_with(MockOptions {
        fail_connect: true,
        ..MockOptions::default()
    });
    let session = SessionBuilder::new().build().unwrap();

    let err = server.connect(&session).await.unwrap_err();
    assert!(matches!(&err, InspectorError::Connection { message, .. } if message == "transport connect failed"));
    assert_eq!(session.status(), ConnectionStatus::Error);
    assert!(server.peer.methods().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_settles_everything_once() {
    init_tracing();
    let server = MockServer::start();
    let session = SessionBuilder::new().build().unwrap();
    server.connect(&session).await.unwrap();

    let caller = session.clone();
    let call = tokio::spawn(async move {
        caller
            .call_tool(
                "sample_many",
                Some(json!({"count": 3})),
                Some(&DispatchPolicy::new(Duration::from_secs(60))),
            )
            .await
    });
    let resolver = Arc::clone(session.resolver());
    assert!(wait_until(Duration::from_secs(1), || resolver.pending_count() == 3).await);
    let children: Vec<String> = session.resolver().pending().into_iter().map(|c| c.id).collect();

    session.disconnect().await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(session.resolver().pending_count(), 0);
    for id in &children {
        assert_eq!(session.resolver().status(id), Some(ChildStatus::Rejected));
    }
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert!(session.server_info().is_none());
    assert_eq!(server.transport.disconnect_count(), 1);

    session.disconnect().await;
    assert_eq!(server.transport.disconnect_count(), 1);
    assert_eq!(session.status(), ConnectionStatus::Disconnected);

    let err = session.ping().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test(start_paused = true)]
async fn test_transport_loss_fails_in_flight_requests() {
    init_tracing();
    let server = MockServer::start();
    let session = SessionBuilder::new().build().unwrap();
    server.connect(&session).await.unwrap();

    let caller = session.clone();
    let call = tokio::spawn(async move {
        caller
            .call_tool("slow", Some(json!({"duration_ms": 30_000})), None)
            .await
    });
    let watched = session.clone();
    assert!(wait_until(Duration::from_secs(1), || watched.in_flight().len() == 1).await);

    server.transport.simulate_drop();

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let watched = session.clone();
    assert!(wait_until(Duration::from_secs(1), || watched.status() == ConnectionStatus::Error).await);
    let last = session.last_error().unwrap();
    assert!(last.to_string().contains("transport closed unexpectedly"));
    assert!(session.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_clears_error_state() {
    init_tracing();
    let server = MockServer::start();
    let session = SessionBuilder::new().build().unwrap();
    server.connect(&session).await.unwrap();

    server.transport.simulate_drop();
    let watched = session.clone();
    assert!(wait_until(Duration::from_secs(1), || watched.status() == ConnectionStatus::Error).await);

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let _subscription = session.on_status_change(move |status| sink.lock().push(*status));

    session.disconnect().await;
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert!(session.last_error().is_none());

    session.disconnect().await;
    assert_eq!(*statuses.lock(), vec![ConnectionStatus::Disconnected]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_after_failed_handshake() {
    init_tracing();
    let server = MockServer::start_with(MockOptions {
        init: InitBehavior::Fail,
        ..MockOptions::default()
    });
    let session = SessionBuilder::new().build().unwrap();
    server.connect(&session).await.unwrap_err();
    assert_eq!(session.status(), ConnectionStatus::Error);

    session.disconnect().await;
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert!(session.last_error().is_none());
    assert_eq!(server.transport.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_disconnect() {
    init_tracing();
    let session = SessionBuilder::new()
        .with_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let first = MockServer::start();
    first.connect(&session).await.unwrap();
    session.disconnect().await;

    let second = MockServer::start();
    second.connect(&session).await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Connected);
    session.ping().await.unwrap();
    assert!(second.peer.methods().contains(&"ping".to_string()));

    let initializes = session.history().list(&inspectmcp_client::HistoryFilter {
        method: Some("initialize".into()),
        ..Default::default()
    });
    assert_eq!(initializes.len(), 2);
}

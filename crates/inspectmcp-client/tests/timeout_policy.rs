//! Dispatch policy behaviour against a scripted server
//!
//! Every test runs on a paused clock, so multi-second tool runs finish
//! instantly while the deadline arithmetic stays exact.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockServer, init_tracing, wait_until};
use inspectmcp_client::{
    ClientSession, DispatchPolicy, ErrorKind, HistoryFilter, InspectorError, PolicyOptions,
    SessionBuilder,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

async fn connected_session() -> (ClientSession, MockServer) {
    init_tracing();
    let server = MockServer::start();
    let session = SessionBuilder::new().build().unwrap();
    server.connect(&session).await.unwrap();
    (session, server)
}

fn long_running(duration_ms: u64, steps: u64) -> Option<Value> {
    Some(json!({"duration_ms": duration_ms, "steps": steps}))
}

fn tools_call_history(session: &ClientSession) -> Vec<inspectmcp_client::HistoryEntry> {
    session.history().list(&HistoryFilter {
        method: Some("tools/call".into()),
        ..HistoryFilter::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_generous_timeout_completes_with_all_progress() {
    let (session, _server) = connected_session().await;
    let policy = DispatchPolicy::new(Duration::from_millis(15_000));

    let result = session
        .call_tool("long_running", long_running(5000, 5), Some(&policy))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "completed 5 steps");

    let history = tools_call_history(&session);
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    assert_eq!(history[0].progress_events, Some(5));
    assert_eq!(history[0].target.as_deref(), Some("long_running"));
}

#[tokio::test(start_paused = true)]
async fn test_short_timeout_fails_and_notifies_server() {
    let (session, server) = connected_session().await;
    let policy = DispatchPolicy::new(Duration::from_millis(100));

    let err = session
        .call_tool("long_running", long_running(5000, 5), Some(&policy))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestTimeout);
    assert!(err.is_timeout());
    assert_eq!(err.progress_events(), Some(0));
    assert!(err.to_string().contains("100ms"));

    let peer = Arc::clone(&server.peer);
    assert!(wait_until(Duration::from_secs(1), || !peer.cancellations().is_empty()).await);

    let call_id = server
        .peer
        .received
        .lock()
        .iter()
        .find(|frame| frame["method"] == "tools/call")
        .map(|frame| frame["id"].clone())
        .unwrap();
    let cancellation = &server.peer.cancellations()[0];
    assert_eq!(cancellation["requestId"], call_id);
    assert!(cancellation["reason"].as_str().unwrap().contains("timed out"));

    let history = tools_call_history(&session);
    assert!(!history[0].success);
    assert!(history[0].error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_progress_resets_deadline() {
    let (session, server) = connected_session().await;
    let options = PolicyOptions {
        request_timeout_ms: Some("2000".into()),
        reset_timeout_on_progress: Some("true".into()),
        max_total_timeout_ms: Some("30000".into()),
    };

    let result = session
        .call_tool_with_options("long_running", long_running(10_000, 10), &options)
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "completed 10 steps");
    assert!(server.peer.cancellations().is_empty());

    let history = tools_call_history(&session);
    assert_eq!(history[0].progress_events, Some(10));
    assert!(history[0].duration_ms >= 10_000);
}

#[tokio::test(start_paused = true)]
async fn test_progress_ignored_without_reset() {
    let (session, _server) = connected_session().await;
    let policy = DispatchPolicy::new(Duration::from_millis(2000));

    let err = session
        .call_tool("long_running", long_running(10_000, 10), Some(&policy))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        InspectorError::RequestTimeout {
            progress_events: 1,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_wins_over_progress() {
    let (session, server) = connected_session().await;
    let policy = DispatchPolicy::new(Duration::from_millis(600))
        .reset_on_progress(true)
        .max_total(Duration::from_millis(2000));

    let started = tokio::time::Instant::now();
    let err = session
        .call_tool("long_running", long_running(5000, 10), Some(&policy))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MaxTotalTimeoutExceeded);
    assert!(err.to_string().contains("2000ms"));
    assert!(err.progress_events().unwrap() >= 3);
    assert!(started.elapsed() < Duration::from_millis(2100));

    let peer = Arc::clone(&server.peer);
    assert!(wait_until(Duration::from_secs(1), || peer.cancellations().len() == 1).await);
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_below_timeout_fires_first() {
    let (session, _server) = connected_session().await;
    let options = PolicyOptions {
        request_timeout_ms: Some("2000".into()),
        reset_timeout_on_progress: Some("true".into()),
        max_total_timeout_ms: Some("1000".into()),
    };

    let started = tokio::time::Instant::now();
    let err = session
        .call_tool_with_options("long_running", long_running(10_000, 10), &options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MaxTotalTimeoutExceeded);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(elapsed < Duration::from_millis(1100));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_option_never_reaches_server() {
    let (session, server) = connected_session().await;

    let err = session
        .call_tool_with_options(
            "long_running",
            long_running(1000, 1),
            &PolicyOptions::with_request_timeout("invalid"),
        )
        .await
        .unwrap_err();
    match err {
        InspectorError::InvalidConfiguration { option, value, .. } => {
            assert_eq!(option, "requestTimeoutMs");
            assert_eq!(value, "invalid");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(!server.peer.methods().contains(&"tools/call".to_string()));
    assert!(tools_call_history(&session).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_timeout_rejected_before_send() {
    let (session, server) = connected_session().await;

    let err = session
        .call_tool("echo", None, Some(&DispatchPolicy::new(Duration::MAX)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

    let err = session
        .call_tool(
            "echo",
            None,
            Some(&DispatchPolicy::new(Duration::from_secs(1)).max_total(Duration::MAX)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

    assert!(!server.peer.methods().contains(&"tools/call".to_string()));
    assert!(session.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_local_cancel_notifies_server() {
    let (session, server) = connected_session().await;

    let caller = session.clone();
    let call = tokio::spawn(async move {
        caller
            .call_tool("slow", Some(json!({"duration_ms": 60_000})), None)
            .await
    });

    let watched = session.clone();
    assert!(wait_until(Duration::from_secs(1), || watched.in_flight().len() == 1).await);
    let request_id = session.in_flight()[0].request_id.clone();
    assert!(session.cancel_request(&request_id, "user pressed stop"));

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(&err, InspectorError::Cancelled { reason } if reason == "user pressed stop"));
    assert!(!session.cancel_request(&request_id, "too late"));

    let peer = Arc::clone(&server.peer);
    assert!(wait_until(Duration::from_secs(1), || peer.cancellations().len() == 1).await);
    assert!(session.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_progress_observer_sees_ordered_events() {
    let (session, _server) = connected_session().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = session.on_progress(move |event| {
        sink.lock().push((event.sequence, event.progress, event.message.clone()));
    });

    session
        .call_tool(
            "long_running",
            long_running(300, 3),
            Some(&DispatchPolicy::new(Duration::from_secs(5))),
        )
        .await
        .unwrap();

    let seen = seen.lock().clone();
    assert_eq!(
        seen,
        vec![
            (1, 1.0, Some("step 1/3".to_string())),
            (2, 2.0, Some("step 2/3".to_string())),
            (3, 3.0, Some("step 3/3".to_string())),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_resolve_independently() {
    let (session, _server) = connected_session().await;

    let calls = (0..8).map(|i| {
        let session = session.clone();
        async move {
            session
                .call_tool("echo", Some(json!({"text": format!("msg-{i}")})), None)
                .await
        }
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap()["content"][0]["text"], format!("msg-{i}"));
    }
    assert_eq!(tools_call_history(&session).len(), 8);
    assert!(session.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_server_error_is_protocol_error() {
    let (session, _server) = connected_session().await;
    let err = session.call_tool("fail", None, None).await.unwrap_err();
    match err {
        InspectorError::Protocol { code, message, .. } => {
            assert_eq!(code, -32000);
            assert_eq!(message, "tool exploded");
        }
        other => panic!("unexpected error: {other}"),
    }
}

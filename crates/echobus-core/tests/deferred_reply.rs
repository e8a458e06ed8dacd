//! End-to-end tests for the echo service over a loopback bus.
//!
//! Timer-sensitive tests run with `start_paused` so the clock only moves
//! when the runtime is idle, making delay assertions deterministic.

use std::time::Duration;

use echobus_core::{CallStatus, EchoConfig, EchoService, LoopbackBus};
use serde_json::json;
use tokio::time::Instant;

#[tokio::test]
async fn echo_replies_immediately_with_formatted_message() {
    let bus = LoopbackBus::host("test");
    let conn = bus.connection().unwrap();
    let service = EchoService::register(&conn, EchoConfig::default()).unwrap();

    let outcome = conn
        .call("async", "echo", json!({ "message": "hi" }))
        .await
        .unwrap();
    assert_eq!(outcome.status, CallStatus::Ok);
    assert_eq!(
        outcome.single_reply().unwrap()["message"],
        "async received a message: hi"
    );

    service.shutdown().await;
    bus.shutdown();
}

#[tokio::test]
async fn echo_substitutes_placeholder_for_missing_message() {
    let bus = LoopbackBus::host("test");
    let conn = bus.connection().unwrap();
    let service = EchoService::register(&conn, EchoConfig::default()).unwrap();

    let outcome = conn.call("async", "echo", json!({})).await.unwrap();
    assert_eq!(outcome.status, CallStatus::Ok);
    assert_eq!(
        outcome.single_reply().unwrap()["message"],
        "async received a message: (unknown)"
    );

    service.shutdown().await;
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn longecho_replies_exactly_once_after_the_configured_delay() {
    let bus = LoopbackBus::host("test");
    let conn = bus.connection().unwrap();
    let service = EchoService::register(&conn, EchoConfig::default()).unwrap();

    // Not observable before the delay elapses: a timeout one tick short of
    // the 5000 ms default must fire first.
    let early = tokio::time::timeout(
        Duration::from_millis(4_999),
        conn.call("async", "longecho", json!({ "message": "early" })),
    )
    .await;
    assert!(early.is_err(), "reply arrived before the configured delay");

    let start = Instant::now();
    let outcome = conn
        .call("async", "longecho", json!({ "message": "hi" }))
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(5_000));
    assert_eq!(outcome.status, CallStatus::Ok);
    assert_eq!(outcome.replies.len(), 1, "expected exactly one reply");
    assert_eq!(
        outcome.single_reply().unwrap()["message"],
        "async received a message: hi"
    );

    service.shutdown().await;
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn shorter_delay_completes_before_earlier_longer_call() {
    let bus = LoopbackBus::host("test");
    let conn = bus.connection().unwrap();
    let slow = EchoService::register(
        &conn,
        EchoConfig::new("slow", Duration::from_millis(5_000)),
    )
    .unwrap();
    let quick = EchoService::register(
        &conn,
        EchoConfig::new("quick", Duration::from_millis(100)),
    )
    .unwrap();

    // Issue the slow call first; the quick one must still finish first.
    let slow_call = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let outcome = conn.call("slow", "longecho", json!({})).await.unwrap();
            (Instant::now(), outcome)
        })
    };
    let quick_call = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let outcome = conn.call("quick", "longecho", json!({})).await.unwrap();
            (Instant::now(), outcome)
        })
    };

    let (slow_done, slow_outcome) = slow_call.await.unwrap();
    let (quick_done, quick_outcome) = quick_call.await.unwrap();
    assert_eq!(slow_outcome.status, CallStatus::Ok);
    assert_eq!(quick_outcome.status, CallStatus::Ok);
    assert!(
        quick_done < slow_done,
        "replies must follow timer order, not arrival order"
    );

    slow.shutdown().await;
    quick.shutdown().await;
    bus.shutdown();
}

#[tokio::test]
async fn shutdown_fails_pending_deferred_calls_instead_of_leaking_them() {
    let bus = LoopbackBus::host("test");
    let conn = bus.connection().unwrap();
    let service = EchoService::register(
        &conn,
        EchoConfig::new("async", Duration::from_secs(3600)),
    )
    .unwrap();

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.call("async", "longecho", json!({})).await })
    };
    // Let the call reach the service and its timer get scheduled.
    tokio::time::sleep(Duration::from_millis(50)).await;

    service.shutdown().await;

    // Liveness: the accepted call still completes, as Aborted, well before
    // its one-hour timer.
    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome.status, CallStatus::Aborted);
    assert!(outcome.replies.is_empty());

    // The object is gone after shutdown.
    let outcome = conn.call("async", "echo", json!({})).await.unwrap();
    assert_eq!(outcome.status, CallStatus::ObjectNotFound);

    bus.shutdown();
}

#[tokio::test]
async fn duplicate_registration_leaves_first_service_working() {
    let bus = LoopbackBus::host("test");
    let conn = bus.connection().unwrap();
    let service = EchoService::register(&conn, EchoConfig::default()).unwrap();

    let err = EchoService::register(&conn, EchoConfig::default()).unwrap_err();
    assert!(!err.is_fatal());

    let outcome = conn
        .call("async", "echo", json!({ "message": "still here" }))
        .await
        .unwrap();
    assert_eq!(outcome.status, CallStatus::Ok);
    assert_eq!(
        outcome.single_reply().unwrap()["message"],
        "async received a message: still here"
    );

    service.shutdown().await;
    bus.shutdown();
}

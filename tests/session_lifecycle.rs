//! Session open/close behaviour: engine ownership, teardown, event wiring.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use veplane::api::commands;
use veplane::engine::{EngineError, Level};
use veplane::protocol::RequestEnvelope;
use veplane::session::{self, EngineSource, Ownership};
use veplane::testing::{MockEngine, MockEngineFactory};

#[tokio::test]
async fn exclusive_last_connection_stops_then_terminates() {
    let (server, _) = test_server();
    let factory = Arc::new(MockEngineFactory::default());
    let mut ts = open_exclusive(&server, factory).await;
    assert_eq!(ts.session.ownership(), Ownership::Exclusive);

    let resp = ts.request(json!(1), "start framework", start_params()).await;
    assert_eq!(resp.error, None);
    assert!(ts.mock.framework.is_started());

    ts.session.close().await;
    assert_eq!(ts.mock.framework.stop_calls(), 1);
    assert_eq!(ts.mock.framework.terminate_calls(), 1);
    assert!(ts.mock.engine.is_terminated());
}

#[tokio::test]
async fn exclusive_with_other_connections_terminates_without_stopping() {
    let (server, _) = test_server();
    let factory = Arc::new(MockEngineFactory::default());
    let mut ts = open_exclusive(&server, factory).await;
    let _other = server.connections.connect();

    ts.request(json!(1), "start framework", start_params()).await;
    ts.session.close().await;

    assert_eq!(ts.mock.framework.stop_calls(), 0);
    assert_eq!(ts.mock.framework.terminate_calls(), 1);
}

#[tokio::test]
async fn exclusive_unstarted_framework_is_not_stopped() {
    let (server, _) = test_server();
    let factory = Arc::new(MockEngineFactory::default());
    let ts = open_exclusive(&server, factory).await;

    ts.session.close().await;
    assert_eq!(ts.mock.framework.stop_calls(), 0);
    assert!(ts.mock.engine.is_terminated());
}

#[tokio::test]
async fn shared_session_never_terminates_engine() {
    let (server, _) = test_server();
    let mock = MockEngine::ready();
    mock.framework.set_started(true);

    let ts = open_shared(&server, &mock).await;
    assert_eq!(ts.session.ownership(), Ownership::Shared);
    ts.session.close().await;

    assert_eq!(mock.framework.stop_calls(), 0);
    assert_eq!(mock.framework.terminate_calls(), 0);
    assert!(!mock.engine.is_terminated());
}

#[tokio::test]
async fn shared_attach_waits_for_initialization() {
    let (server, _) = test_server();
    let mock = MockEngine::initializing();
    let (outbound, _frames) = session::Outbound::channel();

    let opening = tokio::spawn(session::open(
        "late",
        EngineSource::Shared(mock.engine.clone()),
        server.clone(),
        outbound,
        server.connections.connect(),
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!opening.is_finished());

    mock.engine.mark_ready();
    let session = opening.await.unwrap().unwrap();
    assert_eq!(session.ownership(), Ownership::Shared);
}

#[tokio::test]
async fn initialization_failure_terminates_exclusive_engine() {
    let (server, _) = test_server();
    let factory = Arc::new(MockEngineFactory::failing("no device farm"));
    let (outbound, _frames) = session::Outbound::channel();

    let err = session::open(
        "doomed",
        EngineSource::New(factory.clone()),
        server.clone(),
        outbound,
        server.connections.connect(),
    )
    .await
    .unwrap_err();

    assert_eq!(err, EngineError::Init("no device farm".into()));
    let mock = factory.last().unwrap();
    assert!(mock.engine.is_terminated());
    assert_eq!(server.connections.active(), 0);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (server, _) = test_server();
    let factory = Arc::new(MockEngineFactory::default());
    let ts = open_exclusive(&server, factory).await;

    ts.session.close().await;
    ts.session.close().await;
    assert_eq!(ts.mock.framework.terminate_calls(), 1);
    assert!(ts.session.registry().is_cleared());
    assert!(!ts.session.is_alive());
}

#[tokio::test]
async fn shared_attach_watches_running_framework_process() {
    let (server, _) = test_server();
    let mock = MockEngine::ready();
    mock.framework.spawn_process();

    let mut ts = open_shared(&server, &mock).await;
    assert!(ts.session.registry().process().is_some());

    assert!(mock.framework.kill_process(137));
    assert_eq!(ts.event("framework died").await, json!(null));
}

#[tokio::test]
async fn engine_output_is_forwarded_while_active() {
    let (server, _) = test_server();
    let factory = Arc::new(MockEngineFactory::default());
    let mut ts = open_exclusive(&server, factory).await;

    ts.mock.engine.console().info("hello");
    let data = ts.event("stdout").await;
    assert_eq!(data, json!({"level": "info", "message": "hello"}));

    ts.mock.runner.start_test(json!({"name": "login"}));
    assert_eq!(ts.event("start test").await, json!({"name": "login"}));

    ts.mock.engine.console().log(Level::Error, "late");
    let _ = ts.event("stdout").await;

    ts.session.close().await;
    ts.mock.engine.console().info("after close");
    ts.mock.engine.config().set("after", json!(true));
    let events = ts.events_within(Duration::from_millis(100)).await;
    assert!(events.is_empty(), "unexpected events {events:?}");
}

#[tokio::test]
async fn config_changes_are_pushed_as_full_config() {
    let (server, _) = test_server();
    let factory = Arc::new(MockEngineFactory::default());
    let mut ts = open_exclusive(&server, factory).await;

    ts.mock.engine.config().set("platform", json!("web"));
    let config = ts.event("config update").await;
    assert_eq!(config["platform"], json!("web"));
    assert_eq!(config["userHome"], json!("/home/tester"));
}

#[tokio::test]
async fn port_is_published_to_engine_config() {
    let (mut server, _) = test_server();
    server.port = 4711;
    let factory = Arc::new(MockEngineFactory::default());
    let ts = open_exclusive(&server, factory).await;
    assert_eq!(ts.mock.engine.config().get("port"), Some(json!(4711)));
}

#[tokio::test]
async fn corrupt_favorites_read_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let favorites = dir.path().join("favorites.json");
    std::fs::write(&favorites, "{{ definitely not json").unwrap();

    let (server, _) = test_server();
    let factory = Arc::new(MockEngineFactory::new(seed_with_prefs(dir.path())));
    let mut ts = open_exclusive(&server, factory).await;

    let resp = ts.request(json!("fav"), "get favorites", json!(null)).await;
    assert_eq!(resp.error, None);
    assert_eq!(resp.data, json!([]));
    assert_eq!(std::fs::read_to_string(&favorites).unwrap(), "[]");
}

#[tokio::test]
async fn favorites_and_settings_persist() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = test_server();
    let factory = Arc::new(MockEngineFactory::new(seed_with_prefs(dir.path())));
    let mut ts = open_exclusive(&server, factory.clone()).await;

    let resp = ts
        .request(json!(1), "save favorites", json!([{"action": "tap"}]))
        .await;
    assert_eq!(resp.data, json!(true));
    let resp = ts
        .request(json!(2), "save settings", json!({"theme": "dark"}))
        .await;
    assert_eq!(resp.data, json!(true));
    ts.session.close().await;

    let mut again = open_exclusive(&server, factory).await;
    let resp = again.request(json!(3), "get favorites", json!(null)).await;
    assert_eq!(resp.data, json!([{"action": "tap"}]));
    let resp = again.request(json!(4), "get settings", json!(null)).await;
    assert_eq!(resp.data, json!({"theme": "dark"}));
}

#[tokio::test]
async fn departed_session_with_work_in_flight_does_not_count_as_connected() {
    let (server, _) = test_server();
    let mut first = open_exclusive(&server, Arc::new(MockEngineFactory::default())).await;
    first
        .mock
        .engine
        .config()
        .set("timeToWaitForScreenShot", json!(300));
    let capture = tokio::spawn(commands::handle(
        Arc::clone(&first.session),
        RequestEnvelope {
            id: json!("shot"),
            command: "get latest screen".into(),
            data: json!(null),
        },
    ));
    first.session.close().await;
    drop(first);
    assert_eq!(server.connections.active(), 0);

    let mut last = open_exclusive(&server, Arc::new(MockEngineFactory::default())).await;
    last.request(json!(1), "start framework", start_params()).await;
    last.session.close().await;
    assert_eq!(last.mock.framework.stop_calls(), 1);
    assert_eq!(last.mock.framework.terminate_calls(), 1);

    capture.await.unwrap();
}

//! End-to-end integration: discovery, built-ins, the health loop, and the
//! log stream.
//!
//! # Coverage
//! - Element registration/teardown visibility via `get_all_elements`.
//! - The `version` and `command_list` built-ins.
//! - `wait_for_elements_healthy` in strict and non-strict modes.
//! - Healthcheck override reporting unhealthy.
//! - Log frames on the shared `log` stream.

use std::sync::Arc;
use std::time::Duration;

use atom::protocol::{code, LogLevel, LANG};
use atom::{Element, ElementConfig, Response, Value, SERIALIZATION_MSGPACK, SERIALIZATION_NONE};
use atom_test_utils::MockRedisServer;
use redis::streams::StreamRangeReply;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_backend() -> (MockRedisServer, ElementConfig) {
    let server = MockRedisServer::start().await.unwrap();
    let config = ElementConfig::tcp("127.0.0.1", server.port());
    (server, config)
}

fn spawn_loop(responder: &Arc<Element>) -> tokio::task::JoinHandle<()> {
    let responder = responder.clone();
    tokio::spawn(async move {
        let _ = responder.command_loop().await;
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// E2E test: a constructed element is visible to peers; a closed element
/// is not.
#[tokio::test]
async fn discovery_follows_lifecycle() {
    let (_server, config) = start_backend().await;
    let caller = Element::new("test_caller", config.clone()).await.unwrap();
    let responder = Element::new("test_responder", config.clone()).await.unwrap();

    let mut seen = caller.get_all_elements().await.unwrap();
    seen.sort();
    assert_eq!(seen, vec!["test_caller".to_owned(), "test_responder".to_owned()]);
    assert!(responder
        .get_all_elements()
        .await
        .unwrap()
        .contains(&"test_caller".to_owned()));

    responder.close().await.unwrap();
    assert_eq!(
        caller.get_all_elements().await.unwrap(),
        vec!["test_caller".to_owned()]
    );
}

/// E2E test: `version` reports this binding's language and major.minor
/// version as a float.
#[tokio::test]
async fn version_builtin() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();
    let serving = spawn_loop(&responder);

    let response = caller.get_element_version("test_responder").await.unwrap();
    assert_eq!(response.err_code, code::NO_ERROR);
    let Some(Value::Map(entries)) = response.data else {
        panic!("expected a map, got {:?}", response.data);
    };
    let language = entries
        .iter()
        .find(|(k, _)| k.as_str() == Some("language"))
        .and_then(|(_, v)| v.as_str());
    assert_eq!(language, Some(LANG));
    let version = entries
        .iter()
        .find(|(k, _)| k.as_str() == Some("version"))
        .and_then(|(_, v)| v.as_f64());
    assert!(version.is_some_and(|v| v > 0.0));

    assert!(caller
        .check_element_version("test_responder", Some(&[LANG]), Some(0.2))
        .await
        .unwrap());
    assert!(!caller
        .check_element_version("test_responder", Some(&["Python"]), None)
        .await
        .unwrap());

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

/// E2E test: `command_list` returns the user commands with built-ins
/// filtered out, and `get_all_commands` prefixes the element name.
#[tokio::test]
async fn command_list_builtin() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();

    responder
        .command_add("beta", |_| async { Ok(Response::ok()) }, None, SERIALIZATION_NONE)
        .unwrap();
    responder
        .command_add("alpha", |_| async { Ok(Response::ok()) }, None, SERIALIZATION_NONE)
        .unwrap();
    let serving = spawn_loop(&responder);

    let response = caller
        .command_send(
            "test_responder",
            "command_list",
            Value::Nil,
            true,
            1000,
            SERIALIZATION_MSGPACK,
        )
        .await
        .unwrap();
    assert_eq!(response.err_code, code::NO_ERROR);
    assert_eq!(
        response.data,
        Some(Value::Array(vec![Value::from("alpha"), Value::from("beta")]))
    );

    let commands = caller
        .get_all_commands(Some("test_responder"), true)
        .await
        .unwrap();
    assert_eq!(
        commands,
        vec!["test_responder:alpha".to_owned(), "test_responder:beta".to_owned()]
    );

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

/// E2E test: the health wait passes once every probed element answers its
/// healthcheck.
#[tokio::test]
async fn wait_for_elements_healthy_strict() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();
    let serving = spawn_loop(&responder);

    caller
        .wait_for_elements_healthy(&["test_responder"], Duration::from_millis(100), true)
        .await
        .unwrap();

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

/// E2E test: in non-strict mode an unreachable element is assumed healthy;
/// the wait returns instead of spinning.
#[tokio::test]
async fn wait_for_elements_healthy_non_strict_skips_unreachable() {
    let (_server, config) = start_backend().await;
    // Constructed but not serving: version probes will time out.
    let _responder = Element::new("test_responder", config.clone()).await.unwrap();
    let caller = Element::new("test_caller", config).await.unwrap();

    caller
        .wait_for_elements_healthy(&["test_responder"], Duration::from_millis(100), false)
        .await
        .unwrap();
}

/// E2E test: an overridden healthcheck reporting unhealthy surfaces as a
/// shifted user error code.
#[tokio::test]
async fn healthcheck_override_reports_unhealthy() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();

    responder.healthcheck_set(|| async { Ok(Response::error(5, "sensor offline")) });
    let serving = spawn_loop(&responder);

    let response = caller
        .command_send(
            "test_responder",
            "healthcheck",
            Value::Nil,
            true,
            1000,
            SERIALIZATION_NONE,
        )
        .await
        .unwrap();
    assert_eq!(response.err_code, code::USER_ERRORS_BEGIN + 5);
    assert_eq!(response.err_str, "sensor offline");

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

/// E2E test: one log frame per severity lands on the shared stream with
/// element, host, level, and message fields.
#[tokio::test]
async fn log_frames_reach_the_shared_stream() {
    let (server, config) = start_backend().await;
    let caller = Element::new("test_caller", config).await.unwrap();

    let levels = [
        LogLevel::Emerg,
        LogLevel::Alert,
        LogLevel::Crit,
        LogLevel::Err,
        LogLevel::Warning,
        LogLevel::Notice,
        LogLevel::Info,
        LogLevel::Timing,
        LogLevel::Debug,
    ];
    for (i, level) in levels.iter().enumerate() {
        caller.log(*level, &format!("severity {}", i), false).await;
    }

    // The log stream is shared infrastructure, not an element stream, so
    // inspect it directly.
    let client = redis::Client::open(format!("redis://127.0.0.1:{}/", server.port())).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let reply: StreamRangeReply = redis::AsyncCommands::xrevrange_count(&mut conn, "log", "+", "-", 9)
        .await
        .unwrap();
    assert_eq!(reply.ids.len(), 9, "one frame per severity");

    // Newest first: severity 8 down to severity 0.
    for (i, entry) in reply.ids.iter().enumerate() {
        let msg: Vec<u8> = entry.get("msg").unwrap();
        assert_eq!(msg, format!("severity {}", 8 - i).into_bytes());
        let level: Vec<u8> = entry.get("level").unwrap();
        assert_eq!(level, (8 - i).to_string().into_bytes());
        let element: Vec<u8> = entry.get("element").unwrap();
        assert_eq!(element, b"test_caller");
        assert!(entry.get::<Vec<u8>>("host").is_some());
    }
}

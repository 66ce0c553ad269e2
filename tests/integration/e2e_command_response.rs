//! End-to-end integration: the command/response protocol.
//!
//! Each test runs against its own in-process mock Redis server:
//!   1. A responder element registers handlers and serves `command_loop`
//!      on a spawned task.
//!   2. A caller element issues `command_send` and asserts on the
//!      error-coded reply.
//!
//! # Coverage
//! - Happy path: registered command returns its payload.
//! - Unsupported command, missing ack, missing response, handler failure.
//! - User error codes shifted into the user range.
//! - Cross-talk: concurrent calls on one shared response stream each match
//!   their own reply.

use std::sync::Arc;
use std::time::Duration;

use atom::protocol::code;
use atom::{Element, ElementConfig, Response, Value, SERIALIZATION_NONE};
use atom_test_utils::MockRedisServer;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_backend() -> (MockRedisServer, ElementConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
    let server = MockRedisServer::start().await.unwrap();
    let config = ElementConfig::tcp("127.0.0.1", server.port());
    (server, config)
}

/// Register the classic `add_1` handler: parse the ASCII payload, add one.
fn add_1(element: &Element) {
    element
        .command_add(
            "add_1",
            |request| async move {
                let n = match &request {
                    Value::Binary(bytes) => String::from_utf8_lossy(bytes)
                        .parse::<i64>()
                        .map_err(|e| e.to_string())?,
                    other => return Err(format!("unexpected payload: {:?}", other)),
                };
                Ok(Response::with_data(Value::from(n + 1)))
            },
            None,
            SERIALIZATION_NONE,
        )
        .unwrap();
}

/// Spawn `command_loop` for the responder; returns the task handle.
fn spawn_loop(responder: &Arc<Element>) -> tokio::task::JoinHandle<()> {
    let responder = responder.clone();
    tokio::spawn(async move {
        let _ = responder.command_loop().await;
    })
}

async fn send_none(
    caller: &Element,
    callee: &str,
    cmd: &str,
    data: Value,
) -> atom::CommandResponse {
    caller
        .command_send(callee, cmd, data, true, 1000, SERIALIZATION_NONE)
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// E2E test: responder registers `add_1`, caller sends "0", reply is
/// `{err_code: 0, data: b"1"}`.
#[tokio::test]
async fn command_response_happy_path() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();

    add_1(&responder);
    let serving = spawn_loop(&responder);

    let response = send_none(&caller, "test_responder", "add_1", Value::from("0")).await;
    assert_eq!(response.err_code, code::NO_ERROR);
    assert_eq!(response.data, Some(Value::Binary(b"1".to_vec())));

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

/// E2E test: a command the responder never registered yields
/// UNSUPPORTED_COMMAND.
#[tokio::test]
async fn unsupported_command() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();

    let serving = spawn_loop(&responder);

    let response = send_none(&caller, "test_responder", "add_1", Value::from("0")).await;
    assert_eq!(response.err_code, code::UNSUPPORTED_COMMAND);

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

/// E2E test: responder exists but its loop is not running; the caller
/// times out waiting for the acknowledge.
#[tokio::test]
async fn no_ack_when_loop_not_running() {
    let (_server, config) = start_backend().await;
    let responder = Element::new("test_responder", config.clone()).await.unwrap();
    add_1(&responder);
    let caller = Element::new("test_caller", config).await.unwrap();

    let response = send_none(&caller, "test_responder", "add_1", Value::from("0")).await;
    assert_eq!(response.err_code, code::NO_ACK);
}

/// E2E test: an ack timeout of zero fails immediately, before any read.
#[tokio::test]
async fn zero_ack_timeout_fails_fast() {
    let (_server, config) = start_backend().await;
    let _responder = Element::new("test_responder", config.clone()).await.unwrap();
    let caller = Element::new("test_caller", config).await.unwrap();

    let started = std::time::Instant::now();
    let response = caller
        .command_send(
            "test_responder",
            "add_1",
            Value::Nil,
            true,
            0,
            SERIALIZATION_NONE,
        )
        .await
        .unwrap();
    assert_eq!(response.err_code, code::NO_ACK);
    assert!(started.elapsed() < Duration::from_millis(500));
}

/// E2E test: a handler that never finishes within its registered timeout
/// yields NO_RESPONSE after the acknowledged deadline.
#[tokio::test]
async fn handler_timeout_yields_no_response() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();

    responder
        .command_add(
            "loop",
            |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Response::ok())
            },
            Some(10),
            SERIALIZATION_NONE,
        )
        .unwrap();
    let serving = spawn_loop(&responder);

    let response = send_none(&caller, "test_responder", "loop", Value::Nil).await;
    assert_eq!(response.err_code, code::NO_RESPONSE);

    // The handler is still sleeping; tear the task down hard.
    serving.abort();
}

/// E2E test: a handler that fails (the typed analogue of returning a
/// non-Response) comes back as CALLBACK_FAILED.
#[tokio::test]
async fn failing_handler_yields_callback_failed() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();

    responder
        .command_add(
            "ret_not_response",
            |_| async { Err("returned 0 instead of a Response".to_owned()) },
            None,
            SERIALIZATION_NONE,
        )
        .unwrap();
    let serving = spawn_loop(&responder);

    let response = send_none(&caller, "test_responder", "ret_not_response", Value::Nil).await;
    assert_eq!(response.err_code, code::CALLBACK_FAILED);
    assert!(!response.err_str.is_empty());

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

/// E2E test: a handler's own error code 42 arrives shifted into the user
/// range as 1042.
#[tokio::test]
async fn user_error_codes_shift_into_user_range() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();

    responder
        .command_add(
            "fails",
            |_| async { Ok(Response::error(42, "user-level failure")) },
            None,
            SERIALIZATION_NONE,
        )
        .unwrap();
    let serving = spawn_loop(&responder);

    let response = send_none(&caller, "test_responder", "fails", Value::Nil).await;
    assert_eq!(response.err_code, code::USER_ERRORS_BEGIN + 42);
    assert_eq!(response.err_str, "user-level failure");

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

/// E2E test: registering a handler under a built-in name is rejected.
#[tokio::test]
async fn reserved_command_names_rejected() {
    let (_server, config) = start_backend().await;
    let responder = Element::new("test_responder", config).await.unwrap();

    let result = responder.command_add(
        "healthcheck",
        |_| async { Ok(Response::ok()) },
        None,
        SERIALIZATION_NONE,
    );
    assert!(matches!(result, Err(atom::Error::ReservedCommand(_))));
}

/// E2E test: two concurrent calls on the same caller share one response
/// stream; each matches only its own `(element, cmd_id)` reply even though
/// the replies interleave.
#[tokio::test]
async fn concurrent_calls_disambiguate_cross_talk() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Arc::new(Element::new("test_caller", config).await.unwrap());

    add_1(&responder);
    responder
        .command_add(
            "slow_echo",
            |request| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Response::with_data(request))
            },
            Some(2000),
            SERIALIZATION_NONE,
        )
        .unwrap();
    let serving = spawn_loop(&responder);

    let slow_caller = caller.clone();
    let slow = tokio::spawn(async move {
        slow_caller
            .command_send(
                "test_responder",
                "slow_echo",
                Value::from("marker"),
                true,
                2000,
                SERIALIZATION_NONE,
            )
            .await
            .unwrap()
    });
    // Let the slow command get picked up first.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast_caller = caller.clone();
    let fast = tokio::spawn(async move {
        fast_caller
            .command_send(
                "test_responder",
                "add_1",
                Value::from("10"),
                true,
                2000,
                SERIALIZATION_NONE,
            )
            .await
            .unwrap()
    });

    let (slow, fast) = (slow.await.unwrap(), fast.await.unwrap());
    assert_eq!(slow.err_code, code::NO_ERROR);
    assert_eq!(slow.data, Some(Value::Binary(b"marker".to_vec())));
    assert_eq!(fast.err_code, code::NO_ERROR);
    assert_eq!(fast.data, Some(Value::Binary(b"11".to_vec())));

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

/// E2E test: fire-and-forget mode returns an empty success without
/// consuming the ack or response.
#[tokio::test]
async fn non_blocking_send_returns_immediately() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();

    add_1(&responder);
    let serving = spawn_loop(&responder);

    let response = caller
        .command_send(
            "test_responder",
            "add_1",
            Value::from("0"),
            false,
            1000,
            SERIALIZATION_NONE,
        )
        .await
        .unwrap();
    assert_eq!(response.err_code, code::NO_ERROR);
    assert_eq!(response.data, None);

    responder.command_loop_shutdown();
    serving.await.unwrap();
}

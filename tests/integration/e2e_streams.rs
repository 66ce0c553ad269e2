//! End-to-end integration: the stream engine.
//!
//! # Coverage
//! - Publish + newest-first reads, with the entry-id invariant.
//! - Reserved field rejection.
//! - Codec round trips through entries (none and msgpack).
//! - `entry_read_since` cursor semantics, counts, and `$`.
//! - Fan-in: two publishers, one reader loop, nothing lost.
//! - Length-cap trimming.
//! - Stream cleanup.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use atom::{
    Element, ElementConfig, StreamHandler, Value, SERIALIZATION_MSGPACK, SERIALIZATION_NONE,
};
use atom_test_utils::MockRedisServer;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_backend() -> (MockRedisServer, ElementConfig) {
    let server = MockRedisServer::start().await.unwrap();
    let config = ElementConfig::tcp("127.0.0.1", server.port());
    (server, config)
}

fn data_field(value: Value) -> Vec<(String, Value)> {
    vec![("data".to_owned(), value)]
}

fn entry_int(entry: &atom::StreamEntry) -> i64 {
    match &entry.fields["data"] {
        Value::Binary(bytes) => String::from_utf8_lossy(bytes).parse().unwrap(),
        other => panic!("expected raw bytes, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// E2E test: write ten entries, read the five most recent in reverse time
/// order.
#[tokio::test]
async fn write_then_read_n_most_recent() {
    let (_server, config) = start_backend().await;
    let responder = Element::new("test_responder", config.clone()).await.unwrap();
    let caller = Element::new("test_caller", config).await.unwrap();

    for i in 0..10 {
        responder
            .entry_write("test_stream", data_field(Value::from(i)), 1024, SERIALIZATION_NONE)
            .await
            .unwrap();
    }

    let entries = caller
        .entry_read_n("test_responder", "test_stream", 5, SERIALIZATION_NONE, false)
        .await
        .unwrap();
    assert_eq!(entries.len(), 5);
    assert_eq!(entry_int(&entries[0]), 9);
    assert_eq!(entry_int(&entries[4]), 5);
}

/// E2E test: the id returned by a write names the entry a subsequent read
/// delivers, and the payload round-trips under the same codec.
#[tokio::test]
async fn write_id_matches_read_id() {
    let (_server, config) = start_backend().await;
    let element = Element::new("test_responder", config).await.unwrap();

    let id = element
        .entry_write(
            "test_stream",
            data_field(Value::Binary(b"payload".to_vec())),
            1024,
            SERIALIZATION_NONE,
        )
        .await
        .unwrap();

    let entries = element
        .entry_read_n("test_responder", "test_stream", 1, SERIALIZATION_NONE, false)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert_eq!(entries[0].ser.as_deref(), Some(SERIALIZATION_NONE));
    assert_eq!(entries[0].fields["data"], Value::Binary(b"payload".to_vec()));
}

/// E2E test: runtime-owned field names cannot appear in user payloads.
#[tokio::test]
async fn reserved_fields_rejected() {
    let (_server, config) = start_backend().await;
    let element = Element::new("test_responder", config).await.unwrap();

    for reserved in [
        "element", "cmd", "cmd_id", "err_code", "err_str", "timeout", "ser", "data", "id",
    ] {
        let result = element
            .entry_write(
                "test_stream",
                vec![(reserved.to_owned(), Value::from(1))],
                1024,
                SERIALIZATION_NONE,
            )
            .await;
        assert!(
            matches!(result, Err(atom::Error::ReservedField(_))),
            "{} should be rejected",
            reserved
        );
    }
}

/// E2E test: structured values survive an entry round trip under msgpack,
/// with the tag stamped on the wire.
#[tokio::test]
async fn msgpack_entry_round_trip() {
    let (_server, config) = start_backend().await;
    let element = Element::new("test_responder", config).await.unwrap();

    let pose = Value::Map(vec![
        (Value::from("x"), Value::F64(1.5)),
        (Value::from("y"), Value::F64(-2.25)),
    ]);
    element
        .entry_write(
            "pose",
            vec![("pose".to_owned(), pose.clone())],
            1024,
            SERIALIZATION_MSGPACK,
        )
        .await
        .unwrap();

    // The reader's own tag does not matter: the entry's stamped tag wins.
    let entries = element
        .entry_read_n("test_responder", "pose", 1, SERIALIZATION_NONE, false)
        .await
        .unwrap();
    assert_eq!(entries[0].ser.as_deref(), Some(SERIALIZATION_MSGPACK));
    assert_eq!(entries[0].fields["pose"], pose);
}

/// E2E test: `entry_read_since` honors the cursor, the count bound, and
/// `"0"` (from the beginning).
#[tokio::test]
async fn read_since_cursor_and_count() {
    let (_server, config) = start_backend().await;
    let responder = Element::new("test_responder", config.clone()).await.unwrap();
    let caller = Element::new("test_caller", config).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            responder
                .entry_write("test_stream", data_field(Value::from(i)), 1024, SERIALIZATION_NONE)
                .await
                .unwrap(),
        );
    }

    let all = caller
        .entry_read_since(
            "test_responder",
            "test_stream",
            "0",
            None,
            None,
            SERIALIZATION_NONE,
            false,
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 5);

    // After the third entry: exactly the last two remain.
    let tail = caller
        .entry_read_since(
            "test_responder",
            "test_stream",
            &ids[2],
            None,
            None,
            SERIALIZATION_NONE,
            false,
        )
        .await
        .unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(entry_int(&tail[0]), 3);

    // A count bound delivers the earliest n.
    let first_two = caller
        .entry_read_since(
            "test_responder",
            "test_stream",
            "0",
            Some(2),
            None,
            SERIALIZATION_NONE,
            false,
        )
        .await
        .unwrap();
    assert_eq!(first_two.len(), 2);
    assert_eq!(entry_int(&first_two[1]), 1);
}

/// E2E test: `"$"` delivers only entries written strictly after the call
/// begins.
#[tokio::test]
async fn read_since_dollar_sees_only_new_entries() {
    let (_server, config) = start_backend().await;
    let responder = Arc::new(Element::new("test_responder", config.clone()).await.unwrap());
    let caller = Element::new("test_caller", config).await.unwrap();

    responder
        .entry_write("test_stream", data_field(Value::from(-1)), 1024, SERIALIZATION_NONE)
        .await
        .unwrap();

    let writer = responder.clone();
    let write_later = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer
            .entry_write("test_stream", data_field(Value::from(7)), 1024, SERIALIZATION_NONE)
            .await
            .unwrap();
    });

    let entries = caller
        .entry_read_since(
            "test_responder",
            "test_stream",
            "$",
            None,
            Some(2000),
            SERIALIZATION_NONE,
            false,
        )
        .await
        .unwrap();
    write_later.await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entry_int(&entries[0]), 7);
}

/// E2E test: two responders publish ten entries each on their own streams;
/// one fan-in loop with a handler per stream collects every value exactly
/// once.
#[tokio::test]
async fn fan_in_collects_both_streams() {
    let (_server, config) = start_backend().await;
    let responder_0 = Arc::new(Element::new("responder_0", config.clone()).await.unwrap());
    let responder_1 = Arc::new(Element::new("responder_1", config.clone()).await.unwrap());
    let caller = Arc::new(Element::new("test_caller", config).await.unwrap());

    let collected: Arc<Mutex<HashSet<i64>>> = Arc::new(Mutex::new(HashSet::new()));
    let sink_0 = collected.clone();
    let sink_1 = collected.clone();
    let mut handlers = vec![
        StreamHandler::new("responder_0", "stream_0", move |entry| {
            sink_0.lock().unwrap().insert(entry_int(&entry));
            Ok(())
        }),
        StreamHandler::new("responder_1", "stream_1", move |entry| {
            sink_1.lock().unwrap().insert(entry_int(&entry));
            Ok(())
        }),
    ];

    let reader = caller.clone();
    let read_loop = tokio::spawn(async move {
        reader
            .entry_read_loop(&mut handlers, None, 500, SERIALIZATION_NONE, false)
            .await
    });
    // Cursors pin to the server clock at loop start; write after that.
    tokio::time::sleep(Duration::from_millis(50)).await;

    for (responder, stream, offset) in [(&responder_0, "stream_0", 0), (&responder_1, "stream_1", 1)] {
        for i in 0..10 {
            responder
                .entry_write(stream, data_field(Value::from(offset + 2 * i)), 1024, SERIALIZATION_NONE)
                .await
                .unwrap();
        }
    }

    // The loop returns once a full block elapses with no new entries.
    read_loop.await.unwrap().unwrap();

    let collected = collected.lock().unwrap();
    for i in 0..20 {
        assert!(collected.contains(&i), "missing value {}", i);
    }
}

/// E2E test: publishing past the length cap drops the oldest entry while
/// the newest is always present.
#[tokio::test]
async fn length_cap_trims_oldest() {
    let (_server, config) = start_backend().await;
    let element = Element::new("test_responder", config).await.unwrap();

    for i in 0..9 {
        element
            .entry_write("capped", data_field(Value::from(i)), 8, SERIALIZATION_NONE)
            .await
            .unwrap();
    }

    let entries = element
        .entry_read_n("test_responder", "capped", 9, SERIALIZATION_NONE, false)
        .await
        .unwrap();
    assert_eq!(entries.len(), 8);
    assert_eq!(entry_int(&entries[0]), 8, "newest entry must survive");
    assert!(
        entries.iter().all(|e| entry_int(e) != 0),
        "oldest entry should have been trimmed"
    );
}

/// E2E test: cleaning up a stream removes it from the server and from the
/// published set; unknown streams error.
#[tokio::test]
async fn clean_up_stream_removes_key() {
    let (_server, config) = start_backend().await;
    let element = Element::new("test_responder", config).await.unwrap();

    element
        .entry_write("clean_me", data_field(Value::from(0)), 1024, SERIALIZATION_NONE)
        .await
        .unwrap();
    assert!(element
        .get_all_streams("*")
        .await
        .unwrap()
        .contains(&"stream:test_responder:clean_me".to_owned()));

    element.clean_up_stream("clean_me").await.unwrap();
    assert!(element.get_all_streams("*").await.unwrap().is_empty());

    assert!(matches!(
        element.clean_up_stream("clean_me").await,
        Err(atom::Error::NoSuchStream(_))
    ));
}

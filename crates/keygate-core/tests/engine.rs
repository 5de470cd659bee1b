mod common;

use std::time::Duration;

use bytes::Bytes;
use keygate_channel::{HttpMethod, InboundParts, TransportError, TransportErrorKind};
use keygate_common::{ErrorCode, GroupConfig, SystemSettings};
use keygate_core::{EngineResponse, InboundRequest};
use keygate_store::KeyStatus;

use common::{Harness, Scripted, group_record, harness, key_record};

fn chat_request(group: &str) -> InboundRequest {
    InboundRequest {
        group_name: group.to_string(),
        parts: InboundParts {
            method: HttpMethod::Post,
            path: "/v1/chat/completions".to_string(),
            query: None,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Bytes::from_static(br#"{"model":"gpt-4","messages":[]}"#),
        },
        source_ip: "10.0.0.1".to_string(),
    }
}

fn overrides(max_retries: u32, blacklist_threshold: u32) -> GroupConfig {
    GroupConfig {
        max_retries: Some(max_retries),
        blacklist_threshold: Some(blacklist_threshold),
        ..GroupConfig::default()
    }
}

async fn wait_for_logs(h: &Harness, expected: usize) {
    for _ in 0..50 {
        if h.log_store.rows.lock().unwrap().len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {expected} log rows, have {}",
        h.log_store.rows.lock().unwrap().len()
    );
}

#[tokio::test]
async fn happy_path_rotates_keys_in_order() {
    let h = harness(
        vec![group_record(1, "g1", GroupConfig::default())],
        vec![
            key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active),
            key_record(2, 1, "sk-bbbbbbbbbbbb", KeyStatus::Active),
        ],
        SystemSettings::default(),
        vec![
            Ok(Scripted::json(200, r#"{"id":"cmpl-1"}"#)),
            Ok(Scripted::json(200, r#"{"id":"cmpl-2"}"#)),
        ],
    )
    .await;

    for _ in 0..2 {
        match h.engine.handle(chat_request("g1")).await {
            EngineResponse::Buffered { status, .. } => assert_eq!(status, 200),
            _ => panic!("expected buffered success"),
        }
    }

    let sent = h.client.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].authorization.as_deref(), Some("Bearer sk-aaaaaaaaaaaa"));
    assert_eq!(sent[1].authorization.as_deref(), Some("Bearer sk-bbbbbbbbbbbb"));

    wait_for_logs(&h, 2).await;
    let rows = h.log_store.rows.lock().unwrap().clone();
    assert!(rows.iter().all(|row| row.status_code == 200 && row.attempt == 1));
    assert!(rows.iter().all(|row| !row.key_value.contains("aaaaaaaa")));
}

#[tokio::test]
async fn retries_once_then_succeeds() {
    let h = harness(
        vec![group_record(1, "g1", overrides(1, 3))],
        vec![key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active)],
        SystemSettings::default(),
        vec![
            Ok(Scripted::json(500, r#"{"error":{"message":"upstream exploded"}}"#)),
            Ok(Scripted::json(200, r#"{"id":"cmpl-1"}"#)),
        ],
    )
    .await;

    match h.engine.handle(chat_request("g1")).await {
        EngineResponse::Buffered { status, .. } => assert_eq!(status, 200),
        _ => panic!("expected buffered success"),
    }
    assert_eq!(h.client.sent().len(), 2);

    // The success reset the streak; the key is still active.
    let pool = h.pools.pool(1).unwrap();
    assert_eq!(pool.snapshot().active.len(), 1);

    wait_for_logs(&h, 1).await;
    let rows = h.log_store.rows.lock().unwrap().clone();
    assert_eq!(rows[0].attempt, 2);
    assert_eq!(rows[0].status_code, 200);
}

#[tokio::test]
async fn exhausting_bad_keys_demotes_them_all() {
    let invalid = r#"{"error":{"message":"Incorrect API key provided","code":"invalid_api_key"}}"#;
    let h = harness(
        vec![group_record(1, "g1", overrides(3, 1))],
        vec![
            key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active),
            key_record(2, 1, "sk-bbbbbbbbbbbb", KeyStatus::Active),
            key_record(3, 1, "sk-cccccccccccc", KeyStatus::Active),
        ],
        SystemSettings::default(),
        vec![
            Ok(Scripted::json(401, invalid)),
            Ok(Scripted::json(401, invalid)),
            Ok(Scripted::json(401, invalid)),
        ],
    )
    .await;

    match h.engine.handle(chat_request("g1")).await {
        EngineResponse::Error(err) => {
            assert_eq!(err.code, ErrorCode::MaxRetriesExceeded);
            assert!(err.message.contains("Incorrect API key"));
        }
        _ => panic!("expected max retries error"),
    }
    assert_eq!(h.client.sent().len(), 3);

    let pool = h.pools.pool(1).unwrap();
    assert!(pool.snapshot().active.is_empty());
    assert_eq!(pool.snapshot().inactive.len(), 3);

    // The next request finds nothing to rotate through.
    match h.engine.handle(chat_request("g1")).await {
        EngineResponse::Error(err) => assert_eq!(err.code, ErrorCode::NoActiveKeys),
        _ => panic!("expected no active keys"),
    }
}

#[tokio::test]
async fn dispatches_at_most_retry_budget_plus_one() {
    let h = harness(
        vec![group_record(1, "g1", overrides(2, 0))],
        vec![key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active)],
        SystemSettings::default(),
        (0..10)
            .map(|_| Ok(Scripted::json(503, r#"{"error":{"message":"overloaded"}}"#)))
            .collect(),
    )
    .await;

    match h.engine.handle(chat_request("g1")).await {
        EngineResponse::Error(err) => assert_eq!(err.code, ErrorCode::MaxRetriesExceeded),
        _ => panic!("expected max retries error"),
    }
    assert_eq!(h.client.sent().len(), 3);
}

#[tokio::test]
async fn client_4xx_passes_through_without_retry() {
    let h = harness(
        vec![group_record(1, "g1", GroupConfig::default())],
        vec![key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active)],
        SystemSettings::default(),
        vec![Ok(Scripted::json(
            422,
            r#"{"error":{"message":"unknown field"}}"#,
        ))],
    )
    .await;

    match h.engine.handle(chat_request("g1")).await {
        EngineResponse::Buffered { status, body, .. } => {
            assert_eq!(status, 422);
            assert!(std::str::from_utf8(&body).unwrap().contains("unknown field"));
        }
        _ => panic!("expected passthrough"),
    }
    assert_eq!(h.client.sent().len(), 1);
    assert_eq!(h.pools.pool(1).unwrap().snapshot().active.len(), 1);
}

#[tokio::test]
async fn transport_errors_are_retried() {
    let h = harness(
        vec![group_record(1, "g1", overrides(1, 3))],
        vec![key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active)],
        SystemSettings::default(),
        vec![
            Err(TransportError::new(
                TransportErrorKind::Connect,
                "connection refused",
            )),
            Ok(Scripted::json(200, r#"{"id":"cmpl-1"}"#)),
        ],
    )
    .await;

    match h.engine.handle(chat_request("g1")).await {
        EngineResponse::Buffered { status, .. } => assert_eq!(status, 200),
        _ => panic!("expected buffered success"),
    }
    assert_eq!(h.client.sent().len(), 2);
}

#[tokio::test]
async fn unknown_group_is_not_found() {
    let h = harness(vec![], vec![], SystemSettings::default(), vec![]).await;
    match h.engine.handle(chat_request("nope")).await {
        EngineResponse::Error(err) => assert_eq!(err.code, ErrorCode::NotFound),
        _ => panic!("expected not found"),
    }
    assert!(h.client.sent().is_empty());
}

#[tokio::test]
async fn group_without_active_keys_is_unavailable() {
    let h = harness(
        vec![group_record(1, "g1", GroupConfig::default())],
        vec![key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Inactive)],
        SystemSettings::default(),
        vec![],
    )
    .await;
    match h.engine.handle(chat_request("g1")).await {
        EngineResponse::Error(err) => assert_eq!(err.code, ErrorCode::NoActiveKeys),
        _ => panic!("expected no active keys"),
    }
}

#[tokio::test]
async fn sse_bytes_relay_unmodified() {
    let frames = vec![
        Bytes::from_static(b"data: {\"delta\":\"hel\"}\n\n"),
        Bytes::from_static(b"data: {\"delta\":\"lo\"}\n\n"),
        Bytes::from_static(b"data: [DONE]\n\n"),
    ];
    let h = harness(
        vec![group_record(1, "g1", GroupConfig::default())],
        vec![key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active)],
        SystemSettings::default(),
        vec![Ok(Scripted::sse(frames.clone()))],
    )
    .await;

    let mut inbound = chat_request("g1");
    inbound.parts.body = Bytes::from_static(br#"{"model":"gpt-4","stream":true}"#);

    match h.engine.handle(inbound).await {
        EngineResponse::Stream { headers, mut body } => {
            assert!(
                headers
                    .iter()
                    .any(|(name, value)| name == "Content-Type" && value == "text/event-stream")
            );
            let mut received = Vec::new();
            while let Some(chunk) = body.recv().await {
                received.extend_from_slice(&chunk);
            }
            let expected: Vec<u8> = frames.concat();
            assert_eq!(received, expected);
        }
        _ => panic!("expected stream response"),
    }

    // Full delivery logs a 200 with the final attempt number.
    wait_for_logs(&h, 1).await;
    let rows = h.log_store.rows.lock().unwrap().clone();
    assert_eq!(rows[0].status_code, 200);
    assert_eq!(rows[0].attempt, 1);
}

#[tokio::test]
async fn stream_aborted_by_client_still_logs_without_key_penalty() {
    let frames: Vec<Bytes> = (0..64)
        .map(|i| Bytes::from(format!("data: frame-{i}\n\n")))
        .collect();
    let h = harness(
        vec![group_record(1, "g1", GroupConfig::default())],
        vec![key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active)],
        SystemSettings::default(),
        vec![Ok(Scripted::sse(frames))],
    )
    .await;

    let mut inbound = chat_request("g1");
    inbound.parts.body = Bytes::from_static(br#"{"model":"gpt-4","stream":true}"#);

    match h.engine.handle(inbound).await {
        EngineResponse::Stream { mut body, .. } => {
            // Read three frames, then hang up.
            for _ in 0..3 {
                body.recv().await.unwrap();
            }
            drop(body);
        }
        _ => panic!("expected stream response"),
    }

    wait_for_logs(&h, 1).await;
    let rows = h.log_store.rows.lock().unwrap().clone();
    assert_eq!(rows[0].status_code, 200);
    assert_eq!(h.pools.pool(1).unwrap().snapshot().active.len(), 1);
}

#[tokio::test]
async fn deleting_a_group_drops_its_pool_after_invalidation() {
    let h = harness(
        vec![group_record(1, "g1", GroupConfig::default())],
        vec![key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active)],
        SystemSettings::default(),
        vec![],
    )
    .await;
    assert!(h.pools.pool(1).is_some());

    h.storage.groups.lock().unwrap().clear();
    h.groups.invalidate().await.unwrap();

    for _ in 0..100 {
        if h.pools.pool(1).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.pools.pool(1).is_none());

    match h.engine.handle(chat_request("g1")).await {
        EngineResponse::Error(err) => assert_eq!(err.code, ErrorCode::NotFound),
        _ => panic!("expected not found after group deletion"),
    }
}

#[tokio::test]
async fn streaming_upstream_error_is_buffered_and_retried() {
    // A stream-intent request that hits a 429 first: the error arrives as a
    // buffered body, the retry uses the next key, and only then does the
    // stream open.
    let frames = vec![Bytes::from_static(b"data: ok\n\n")];
    let h = harness(
        vec![group_record(1, "g1", overrides(1, 3))],
        vec![
            key_record(1, 1, "sk-aaaaaaaaaaaa", KeyStatus::Active),
            key_record(2, 1, "sk-bbbbbbbbbbbb", KeyStatus::Active),
        ],
        SystemSettings::default(),
        vec![
            Ok(Scripted::json(429, r#"{"error":{"message":"slow down"}}"#)),
            Ok(Scripted::sse(frames)),
        ],
    )
    .await;

    let mut inbound = chat_request("g1");
    inbound.parts.body = Bytes::from_static(br#"{"model":"gpt-4","stream":true}"#);

    match h.engine.handle(inbound).await {
        EngineResponse::Stream { .. } => {}
        _ => panic!("expected stream response after retry"),
    }
    assert_eq!(h.client.sent().len(), 2);
}

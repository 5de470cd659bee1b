use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use keygate_channel::{
    ChannelRegistry, FailureKind, Group, Headers, InboundParts, ResponseClass, UpstreamBody,
    header_get, parse_upstream_error, strip_hop_by_hop,
};
use keygate_common::{ApiError, ErrorCode, SystemSettings, mask_key, redact_snippet};
use keygate_store::{RequestLogRecord, RequestLogSink};

use crate::client::{DispatchOptions, UpstreamClient};
use crate::groups::GroupMap;
use crate::pool::{AcquireError, PoolManager};
use crate::syncer::CacheSyncer;

const STREAM_RELAY_BUFFER: usize = 16;
/// Relay write size: larger reads are forwarded as back-to-back writes of at
/// most this many bytes, never held back for coalescing.
const STREAM_RELAY_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub group_name: String,
    pub parts: InboundParts,
    pub source_ip: String,
}

pub enum EngineResponse {
    Buffered {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    /// Always 200; headers are the SSE set. Chunks are relayed as received.
    Stream {
        headers: Headers,
        body: mpsc::Receiver<Bytes>,
    },
    Error(ApiError),
}

/// The request pipeline: group resolution, key rotation, dispatch,
/// classification-driven retries, and response relay.
pub struct ProxyEngine {
    groups: Arc<CacheSyncer<GroupMap>>,
    settings: Arc<CacheSyncer<SystemSettings>>,
    pools: Arc<PoolManager>,
    registry: Arc<ChannelRegistry>,
    client: Arc<dyn UpstreamClient>,
    logs: RequestLogSink,
    upstream_cursors: Mutex<HashMap<i64, Arc<AtomicU64>>>,
}

/// Request-scoped fields copied into every emitted log row.
#[derive(Clone)]
struct LogContext {
    group_id: i64,
    group_name: String,
    source_ip: String,
    request_path: String,
    body_snippet: String,
}

impl ProxyEngine {
    pub fn new(
        groups: Arc<CacheSyncer<GroupMap>>,
        settings: Arc<CacheSyncer<SystemSettings>>,
        pools: Arc<PoolManager>,
        registry: Arc<ChannelRegistry>,
        client: Arc<dyn UpstreamClient>,
        logs: RequestLogSink,
    ) -> Self {
        Self {
            groups,
            settings,
            pools,
            registry,
            client,
            logs,
            upstream_cursors: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, inbound: InboundRequest) -> EngineResponse {
        let started = Instant::now();
        let settings = self.settings.get();

        let Some(group) = self.groups.get().get(&inbound.group_name) else {
            return EngineResponse::Error(ApiError::new(
                ErrorCode::NotFound,
                format!("unknown group {:?}", inbound.group_name),
            ));
        };
        let Some(channel) = self.registry.get(&group.channel_type) else {
            tracing::error!(group = %group.name, channel_type = %group.channel_type, "no channel strategy registered");
            return EngineResponse::Error(ApiError::new(
                ErrorCode::InternalServerError,
                "channel type not supported",
            ));
        };

        let effective = settings.merged(&group.config);
        let opts = DispatchOptions::from_effective(&effective);
        let max_attempts = effective.max_retries.saturating_add(1);

        let ctx = LogContext {
            group_id: group.id,
            group_name: group.name.clone(),
            source_ip: inbound.source_ip.clone(),
            request_path: inbound.parts.path.clone(),
            body_snippet: redact_snippet(&inbound.parts.body),
        };

        let Some(pool) = self.pools.pool(group.id) else {
            let err = ApiError::new(
                ErrorCode::NoActiveKeys,
                format!("group {} has no active keys", group.name),
            );
            self.emit_log(&ctx, "", "", err.status(), 0, started, Some(err.message.clone()));
            return EngineResponse::Error(err);
        };

        let mut last_message: Option<String> = None;
        let mut attempt: u32 = 0;

        while attempt < max_attempts {
            attempt += 1;

            let key = match pool.acquire() {
                Ok(key) => key,
                Err(AcquireError::NoActiveKeys) => {
                    if attempt == 1 {
                        let err = ApiError::new(
                            ErrorCode::NoActiveKeys,
                            format!("group {} has no active keys", group.name),
                        );
                        self.emit_log(&ctx, "", "", err.status(), 0, started, Some(err.message.clone()));
                        return EngineResponse::Error(err);
                    }
                    // The pool drained mid-retry; report what the upstream said.
                    attempt -= 1;
                    break;
                }
            };
            let masked_key = mask_key(&key.value);
            let upstream = self.pick_upstream(&group);
            let outbound =
                channel.build_upstream_request(&inbound.parts, &group, &upstream, &key.value);

            let sent = tokio::time::timeout(
                effective.request_timeout,
                self.client.send(outbound, &opts),
            )
            .await;

            let resp = match sent {
                Err(_) => {
                    last_message = Some(format!(
                        "upstream timed out after {}s",
                        effective.request_timeout.as_secs()
                    ));
                    pool.report_failure(key.id, FailureKind::Retriable, effective.blacklist_threshold);
                    continue;
                }
                Ok(Err(transport)) => {
                    if transport.is_disconnect() {
                        tracing::debug!(group = %group.name, "client disconnected before response");
                        self.emit_log(
                            &ctx,
                            &masked_key,
                            &upstream,
                            0,
                            attempt,
                            started,
                            Some("client disconnected".to_string()),
                        );
                        return EngineResponse::Error(ApiError::new(
                            ErrorCode::BadGateway,
                            "client disconnected",
                        ));
                    }
                    last_message = Some(transport.message.clone());
                    pool.report_failure(key.id, FailureKind::Retriable, effective.blacklist_threshold);
                    continue;
                }
                Ok(Ok(resp)) => resp,
            };

            let status = resp.status;
            match resp.body {
                UpstreamBody::Bytes(body) => match channel.classify(status, &body) {
                    ResponseClass::Success => {
                        pool.report_success(key.id);
                        self.emit_log(&ctx, &masked_key, &upstream, status, attempt, started, None);
                        let mut headers = resp.headers;
                        strip_hop_by_hop(&mut headers);
                        return EngineResponse::Buffered {
                            status,
                            headers,
                            body,
                        };
                    }
                    ResponseClass::Passthrough => {
                        let message = parse_upstream_error(&resp.headers, &body);
                        self.emit_log(
                            &ctx,
                            &masked_key,
                            &upstream,
                            status,
                            attempt,
                            started,
                            Some(message),
                        );
                        let mut headers = resp.headers;
                        strip_hop_by_hop(&mut headers);
                        return EngineResponse::Buffered {
                            status,
                            headers,
                            body,
                        };
                    }
                    class @ (ResponseClass::Retriable | ResponseClass::CredentialFailure) => {
                        let message = parse_upstream_error(&resp.headers, &body);
                        tracing::debug!(
                            group = %group.name,
                            status,
                            attempt,
                            message = %message,
                            "upstream attempt failed"
                        );
                        last_message = Some(message);
                        let kind = if class == ResponseClass::CredentialFailure {
                            FailureKind::CredentialFailure
                        } else {
                            FailureKind::Retriable
                        };
                        pool.report_failure(key.id, kind, effective.blacklist_threshold);
                        continue;
                    }
                },
                UpstreamBody::Stream(upstream_rx) => {
                    // Stream bodies only exist for 2xx responses.
                    pool.report_success(key.id);
                    if response_is_streaming(&resp.headers) {
                        return self.relay_stream(
                            ctx,
                            masked_key,
                            upstream,
                            attempt,
                            started,
                            upstream_rx,
                        );
                    }
                    let body = collect_stream(upstream_rx).await;
                    self.emit_log(&ctx, &masked_key, &upstream, status, attempt, started, None);
                    let mut headers = resp.headers;
                    strip_hop_by_hop(&mut headers);
                    return EngineResponse::Buffered {
                        status,
                        headers,
                        body,
                    };
                }
            }
        }

        let message = last_message.unwrap_or_else(|| "all upstream attempts failed".to_string());
        let err = ApiError::new(ErrorCode::MaxRetriesExceeded, message);
        self.emit_log(&ctx, "", "", err.status(), attempt, started, Some(err.message.clone()));
        EngineResponse::Error(err)
    }

    /// Independent round-robin over the group's upstream list; separate
    /// cursor from key rotation.
    fn pick_upstream(&self, group: &Group) -> String {
        if group.upstreams.len() == 1 {
            return group.upstreams[0].clone();
        }
        let cursor = {
            let mut cursors = self.upstream_cursors.lock().expect("upstream cursor lock");
            cursors
                .entry(group.id)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        let index = cursor.fetch_add(1, Ordering::Relaxed) as usize % group.upstreams.len();
        group.upstreams[index].clone()
    }

    /// Relays SSE bytes in writes of at most [`STREAM_RELAY_CHUNK`], every
    /// non-empty read forwarded as soon as it arrives. The client going away
    /// tears down the upstream read and is never counted against the key;
    /// the log row reflects whatever was delivered.
    fn relay_stream(
        &self,
        ctx: LogContext,
        masked_key: String,
        upstream: String,
        attempt: u32,
        started: Instant,
        mut upstream_rx: mpsc::Receiver<Bytes>,
    ) -> EngineResponse {
        let (tx, client_rx) = mpsc::channel::<Bytes>(STREAM_RELAY_BUFFER);
        let logs = self.logs.clone();

        tokio::spawn(async move {
            'relay: while let Some(mut chunk) = upstream_rx.recv().await {
                while !chunk.is_empty() {
                    let piece = chunk.split_to(chunk.len().min(STREAM_RELAY_CHUNK));
                    if tx.send(piece).await.is_err() {
                        tracing::debug!(group = %ctx.group_name, "client disconnected mid-stream");
                        break 'relay;
                    }
                }
            }
            logs.push(build_log_record(
                &ctx,
                &masked_key,
                &upstream,
                200,
                attempt,
                started.elapsed().as_millis() as i64,
                None,
            ));
        });

        EngineResponse::Stream {
            headers: sse_headers(),
            body: client_rx,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_log(
        &self,
        ctx: &LogContext,
        masked_key: &str,
        upstream: &str,
        status: u16,
        attempt: u32,
        started: Instant,
        error_message: Option<String>,
    ) {
        self.logs.push(build_log_record(
            ctx,
            masked_key,
            upstream,
            status,
            attempt,
            started.elapsed().as_millis() as i64,
            error_message,
        ));
    }
}

fn build_log_record(
    ctx: &LogContext,
    masked_key: &str,
    upstream: &str,
    status: u16,
    attempt: u32,
    duration_ms: i64,
    error_message: Option<String>,
) -> RequestLogRecord {
    RequestLogRecord {
        id: Uuid::new_v4(),
        at: OffsetDateTime::now_utc(),
        group_id: ctx.group_id,
        group_name: ctx.group_name.clone(),
        key_value: masked_key.to_string(),
        source_ip: ctx.source_ip.clone(),
        status_code: status,
        request_path: ctx.request_path.clone(),
        request_body_snippet: ctx.body_snippet.clone(),
        upstream_addr: upstream.to_string(),
        attempt,
        duration_ms,
        error_message,
    }
}

fn sse_headers() -> Headers {
    vec![
        ("Content-Type".to_string(), "text/event-stream".to_string()),
        ("Cache-Control".to_string(), "no-cache".to_string()),
        ("Connection".to_string(), "keep-alive".to_string()),
        ("X-Accel-Buffering".to_string(), "no".to_string()),
    ]
}

fn response_is_streaming(headers: &Headers) -> bool {
    if let Some(content_type) = header_get(headers, "content-type")
        && content_type.to_ascii_lowercase().contains("event-stream")
    {
        return true;
    }
    header_get(headers, "transfer-encoding")
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

async fn collect_stream(mut rx: mpsc::Receiver<Bytes>) -> Bytes {
    let mut buf = BytesMut::new();
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_detection() {
        let sse = vec![(
            "Content-Type".to_string(),
            "text/event-stream; charset=utf-8".to_string(),
        )];
        assert!(response_is_streaming(&sse));

        let chunked = vec![("Transfer-Encoding".to_string(), "chunked".to_string())];
        assert!(response_is_streaming(&chunked));

        let plain = vec![("Content-Type".to_string(), "application/json".to_string())];
        assert!(!response_is_streaming(&plain));
    }

    #[test]
    fn sse_headers_override_set() {
        let headers = sse_headers();
        assert_eq!(header_get(&headers, "content-type"), Some("text/event-stream"));
        assert_eq!(header_get(&headers, "x-accel-buffering"), Some("no"));
    }
}

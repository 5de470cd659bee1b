use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::headers::{Headers, header_get, header_set, strip_client_auth, strip_hop_by_hop};
use crate::types::{Group, InboundParts, UpstreamRequest};

/// Assembles the channel-independent part of an outbound request: URL join,
/// hop-by-hop and downstream-auth stripping, operator header rewrites, and
/// the `param_overrides` body merge. Channels inject their own auth after.
pub fn base_outbound(inbound: &InboundParts, group: &Group, upstream: &str) -> UpstreamRequest {
    let mut headers = inbound.headers.clone();
    strip_hop_by_hop(&mut headers);
    strip_client_auth(&mut headers);

    if let Some(rewrites) = &group.config.header_rewrites {
        for rewrite in rewrites {
            header_set(&mut headers, rewrite.name.clone(), rewrite.value.clone());
        }
    }

    let body = apply_param_overrides(inbound, group, &headers);
    let query = inbound
        .query
        .as_deref()
        .map(strip_key_param)
        .filter(|query| !query.is_empty());

    UpstreamRequest {
        method: inbound.method,
        url: join_url(upstream, &inbound.path, query.as_deref()),
        headers,
        body,
        is_stream: false,
    }
}

/// `?key=` carries downstream auth (the proxy key, or a caller's own Gemini
/// key); it never goes upstream.
pub fn strip_key_param(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.starts_with("key=") && !pair.is_empty())
        .collect::<Vec<_>>()
        .join("&")
}

pub fn join_url(upstream: &str, path: &str, query: Option<&str>) -> String {
    let base = upstream.trim_end_matches('/');
    match query {
        Some(q) if !q.is_empty() => format!("{base}{path}?{q}"),
        _ => format!("{base}{path}"),
    }
}

/// Shallow JSON merge of the group's `param_overrides` into the body.
/// Applies only when overrides exist, the content type is JSON, and the body
/// parses as a JSON object; otherwise the body passes through unchanged.
fn apply_param_overrides(
    inbound: &InboundParts,
    group: &Group,
    headers: &Headers,
) -> Option<Bytes> {
    if inbound.body.is_empty() {
        return None;
    }
    let Some(overrides) = group
        .config
        .param_overrides
        .as_ref()
        .filter(|map| !map.is_empty())
    else {
        return Some(inbound.body.clone());
    };

    let is_json = header_get(headers, "content-type")
        .map(|ct| ct.split(';').next().unwrap_or("").trim().ends_with("json"))
        .unwrap_or(false);
    if !is_json {
        return Some(inbound.body.clone());
    }

    match serde_json::from_slice::<JsonValue>(&inbound.body) {
        Ok(JsonValue::Object(mut object)) => {
            for (field, value) in overrides {
                object.insert(field.clone(), value.clone());
            }
            match serde_json::to_vec(&JsonValue::Object(object)) {
                Ok(merged) => Some(Bytes::from(merged)),
                Err(_) => Some(inbound.body.clone()),
            }
        }
        _ => Some(inbound.body.clone()),
    }
}

/// `stream: true` in a JSON body, or an SSE accept header.
pub fn stream_hint(inbound: &InboundParts) -> bool {
    if let Some(accept) = header_get(&inbound.headers, "accept")
        && accept.to_ascii_lowercase().contains("text/event-stream")
    {
        return true;
    }
    if inbound.body.is_empty() {
        return false;
    }
    serde_json::from_slice::<JsonValue>(&inbound.body)
        .ok()
        .and_then(|value| value.get("stream").and_then(JsonValue::as_bool))
        .unwrap_or(false)
}

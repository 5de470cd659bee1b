use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::Value as JsonValue;

use crate::headers::{Headers, header_get};

const ERROR_SNIPPET_CAP: usize = 2048;

/// Extracts a human-readable message from an upstream error body.
///
/// Recognized envelopes, in order: `{"error":{"message":...}}`,
/// `{"error_msg":...}`, `{"error":"..."}`, `{"message":...}`. Anything else
/// falls back to the raw body, truncated. Gzip-encoded bodies are inflated
/// here only; the success path forwards original bytes untouched.
pub fn parse_upstream_error(headers: &Headers, body: &[u8]) -> String {
    let decoded = maybe_gunzip(headers, body);
    let capped = cap(&decoded);

    if let Ok(value) = serde_json::from_slice::<JsonValue>(capped) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(JsonValue::as_str)
        {
            return message.to_string();
        }
        if let Some(message) = value.get("error_msg").and_then(JsonValue::as_str) {
            return message.to_string();
        }
        if let Some(message) = value.get("error").and_then(JsonValue::as_str) {
            return message.to_string();
        }
        if let Some(message) = value.get("message").and_then(JsonValue::as_str) {
            return message.to_string();
        }
        // Gemini wraps errors in an array of envelopes.
        if let Some(message) = value
            .as_array()
            .and_then(|items| items.first())
            .and_then(|e| e.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(JsonValue::as_str)
        {
            return message.to_string();
        }
    }

    String::from_utf8_lossy(capped).trim().to_string()
}

fn maybe_gunzip(headers: &Headers, body: &[u8]) -> Vec<u8> {
    let gzipped = header_get(headers, "content-encoding")
        .map(|enc| enc.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);
    if !gzipped {
        return body.to_vec();
    }
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => body.to_vec(),
    }
}

fn cap(body: &[u8]) -> &[u8] {
    &body[..body.len().min(ERROR_SNIPPET_CAP)]
}

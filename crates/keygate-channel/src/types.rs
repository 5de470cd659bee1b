use bytes::Bytes;
use tokio::sync::mpsc;

use keygate_common::GroupConfig;

use crate::headers::Headers;

/// A named routing target: one channel family, one or more upstream base
/// URLs, and the credential pool the proxy rotates through.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub channel_type: String,
    pub upstreams: Vec<String>,
    pub config: GroupConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            "HEAD" => Some(HttpMethod::Head),
            "OPTIONS" => Some(HttpMethod::Options),
            _ => None,
        }
    }
}

/// The inbound request after the router has peeled off `/proxy/{group}`.
#[derive(Debug, Clone)]
pub struct InboundParts {
    pub method: HttpMethod,
    /// Remainder path, always with a leading slash.
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Dns,
    Connect,
    Tls,
    Disconnect,
    Other,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

const DISCONNECT_MARKERS: [&str; 5] = [
    "context canceled",
    "broken pipe",
    "connection reset by peer",
    "use of closed network connection",
    "request canceled",
];

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The client went away; never counted against the credential.
    pub fn is_disconnect(&self) -> bool {
        if self.kind == TransportErrorKind::Disconnect {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        DISCONNECT_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

/// Verdict over one upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// Transient; retry with the next credential.
    Retriable,
    /// The credential itself is bad; full threshold weight.
    CredentialFailure,
    /// A client mistake (other 4xx); returned as-is, never retried.
    Passthrough,
}

/// What the pool is told after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retriable,
    CredentialFailure,
    Ignorable,
}

/// Per-provider-family strategy: where the credential goes, how streaming is
/// detected, and how upstream responses are classified.
pub trait Channel: Send + Sync {
    fn channel_type(&self) -> &'static str;

    fn build_upstream_request(
        &self,
        inbound: &InboundParts,
        group: &Group,
        upstream: &str,
        key: &str,
    ) -> UpstreamRequest;

    fn is_stream_request(&self, inbound: &InboundParts) -> bool;

    fn classify(&self, status: u16, body: &[u8]) -> ResponseClass;

    /// Minimal, cheap request used by the validator.
    fn validation_probe(&self, upstream: &str, key: &str) -> UpstreamRequest;
}

/// Status-only classification shared by the concrete channels; body-aware
/// quirks are layered on per channel.
pub fn classify_by_status(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        401 | 403 => ResponseClass::CredentialFailure,
        408 | 429 => ResponseClass::Retriable,
        500..=599 => ResponseClass::Retriable,
        _ => ResponseClass::Passthrough,
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method};

use keygate_channel::{
    HttpMethod, TransportError, TransportErrorKind, UpstreamBody, UpstreamRequest,
    UpstreamResponse,
};
use keygate_common::EffectiveSettings;

/// Connection parameters for one dispatch; derived from the group's
/// effective settings, so a settings change selects a different pooled
/// client and the old one ages out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchOptions {
    pub connect_timeout: Duration,
    pub response_header_timeout: Duration,
    pub idle_conn_timeout: Duration,
    pub max_idle_conns_per_host: u32,
}

impl DispatchOptions {
    pub fn from_effective(effective: &EffectiveSettings) -> Self {
        Self {
            connect_timeout: effective.connect_timeout,
            response_header_timeout: effective.response_header_timeout,
            idle_conn_timeout: effective.idle_conn_timeout,
            max_idle_conns_per_host: effective.max_idle_conns_per_host,
        }
    }
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
        opts: &'a DispatchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>>;
}

/// The subset of [`DispatchOptions`] baked into a pooled client. The
/// header-wait bound is applied per send, not here, so it never leaks into
/// body reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    connect_timeout: Duration,
    idle_conn_timeout: Duration,
    max_idle_conns_per_host: u32,
}

impl ClientKey {
    fn from_opts(opts: &DispatchOptions) -> Self {
        Self {
            connect_timeout: opts.connect_timeout,
            idle_conn_timeout: opts.idle_conn_timeout,
            max_idle_conns_per_host: opts.max_idle_conns_per_host,
        }
    }
}

/// wreq-backed dispatcher with one pooled client per parameter set.
pub struct WreqClient {
    clients: Mutex<HashMap<ClientKey, Client>>,
}

impl WreqClient {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<dyn UpstreamClient> {
        Arc::new(Self::new())
    }

    fn client_for(&self, opts: &DispatchOptions) -> Result<Client, TransportError> {
        let key = ClientKey::from_opts(opts);
        let mut guard = self.clients.lock().map_err(|_| {
            TransportError::new(TransportErrorKind::Other, "upstream client cache lock failed")
        })?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&key).map_err(map_wreq_error)?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for WreqClient {
    fn default() -> Self {
        Self::new()
    }
}

fn build_client(key: &ClientKey) -> Result<Client, wreq::Error> {
    Client::builder()
        .connect_timeout(key.connect_timeout)
        .pool_idle_timeout(key.idle_conn_timeout)
        .pool_max_idle_per_host(key.max_idle_conns_per_host as usize)
        .build()
}

impl UpstreamClient for WreqClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
        opts: &'a DispatchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client_for(opts)?;
            let method = http_method_to_wreq(req.method);
            let mut builder = client.request(method, &req.url);

            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            // response_header_timeout bounds the wait for headers only; once
            // headers have arrived a stream may stay open indefinitely.
            let sent = tokio::time::timeout(opts.response_header_timeout, builder.send()).await;
            let resp = match sent {
                Ok(resp) => resp.map_err(map_wreq_error)?,
                Err(_) => {
                    return Err(TransportError::new(
                        TransportErrorKind::Timeout,
                        "timed out waiting for response headers",
                    ));
                }
            };
            convert_response(resp, req.is_stream).await
        })
    }
}

fn http_method_to_wreq(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Options => Method::OPTIONS,
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
) -> Result<UpstreamResponse, TransportError> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    // Error responses are always buffered so the retry loop can read them.
    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    // No per-chunk deadline: a slow but healthy stream stays open until the
    // upstream finishes, errors, or the receiver side goes away.
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> TransportError {
    let kind = classify_wreq_error(&err);
    TransportError::new(kind, err.to_string())
}

fn classify_wreq_error(err: &wreq::Error) -> TransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return TransportErrorKind::ReadTimeout;
        }
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return TransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return TransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return TransportErrorKind::Tls;
    }
    TransportErrorKind::Other
}

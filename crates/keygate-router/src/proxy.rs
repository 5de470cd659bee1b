use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use futures_util::FutureExt;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use keygate_channel::{Headers, HttpMethod, InboundParts};
use keygate_common::{ApiError, ErrorCode, proxy_key_matches};
use keygate_core::{EngineResponse, InboundRequest, ProxyEngine};

/// Inbound bodies are buffered for retry replay; anything larger is refused.
const MAX_INBOUND_BODY: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<ProxyEngine>,
    pub auth_key_hash: Option<String>,
}

pub fn proxy_router(engine: Arc<ProxyEngine>, auth_key_hash: Option<String>) -> Router {
    let state = ProxyState {
        engine,
        auth_key_hash,
    };
    Router::new()
        .route("/proxy/{group}", any(proxy_root))
        .route("/proxy/{group}/{*path}", any(proxy_rest))
        .layer(middleware::from_fn_with_state(state.clone(), proxy_auth))
        .with_state(state)
}

pub fn health_router() -> Router {
    Router::new().route("/health", get(|| async { StatusCode::NO_CONTENT }))
}

async fn proxy_auth(
    State(state): State<ProxyState>,
    req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let Some(expected_hash) = &state.auth_key_hash else {
        return next.run(req).await;
    };

    let presented = extract_proxy_key(req.headers(), req.uri().query());
    match presented {
        Some(key) if proxy_key_matches(expected_hash, &key) => next.run(req).await,
        _ => envelope(ApiError::new(ErrorCode::Unauthorized, "invalid proxy key")),
    }
}

/// Bearer token, then `X-Api-Key`, then `?key=`.
fn extract_proxy_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
    {
        let value = value.trim();
        let prefix = "Bearer ";
        if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = value[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(value) = headers.get("x-api-key")
        && let Ok(value) = value.to_str()
    {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    let query = query?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    pairs
        .into_iter()
        .find(|(name, _)| name == "key")
        .map(|(_, value)| value)
}

async fn proxy_root(
    state: State<ProxyState>,
    Path(group): Path<String>,
    method: Method,
    query: RawQuery,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    dispatch(state, group, String::new(), method, query, connect, headers, body).await
}

async fn proxy_rest(
    state: State<ProxyState>,
    Path((group, path)): Path<(String, String)>,
    method: Method,
    query: RawQuery,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    dispatch(state, group, path, method, query, connect, headers, body).await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    State(state): State<ProxyState>,
    group: String,
    path: String,
    method: Method,
    RawQuery(query): RawQuery,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(method) = HttpMethod::parse(method.as_str()) else {
        return envelope(ApiError::new(
            ErrorCode::MethodNotAllowed,
            "method not supported",
        ));
    };

    let body = match axum::body::to_bytes(body, MAX_INBOUND_BODY).await {
        Ok(body) => body,
        Err(_) => {
            return envelope(ApiError::new(
                ErrorCode::BadRequest,
                "request body too large or unreadable",
            ));
        }
    };

    let inbound = InboundRequest {
        group_name: group,
        parts: InboundParts {
            method,
            path: format!("/{path}"),
            query,
            headers: headers_to_vec(&headers),
            body,
        },
        source_ip: addr.ip().to_string(),
    };

    // Invariant violations inside the pipeline must not tear the listener
    // down or leak a backtrace to the caller.
    let handled = AssertUnwindSafe(state.engine.handle(inbound))
        .catch_unwind()
        .await;
    match handled {
        Ok(engine_response) => into_response(engine_response),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(panic = %message, "proxy handler panicked");
            envelope(ApiError::new(
                ErrorCode::InternalServerError,
                "internal server error",
            ))
        }
    }
}

fn into_response(engine_response: EngineResponse) -> Response {
    match engine_response {
        EngineResponse::Buffered {
            status,
            headers,
            body,
        } => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers_from_vec(&headers);
            response
        }
        EngineResponse::Stream { headers, body } => {
            let stream = ReceiverStream::new(body).map(Ok::<_, Infallible>);
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = StatusCode::OK;
            *response.headers_mut() = headers_from_vec(&headers);
            response
        }
        EngineResponse::Error(err) => envelope(err),
    }
}

fn envelope(err: ApiError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        err.to_body(),
    )
        .into_response()
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    let mut out = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

fn headers_from_vec(headers: &Headers) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        out.append(name, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_common::hash_proxy_key;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn key_extraction_order() {
        let headers = header_map(&[
            ("authorization", "Bearer from-bearer"),
            ("x-api-key", "from-header"),
        ]);
        assert_eq!(
            extract_proxy_key(&headers, Some("key=from-query")),
            Some("from-bearer".to_string())
        );

        let headers = header_map(&[("x-api-key", "from-header")]);
        assert_eq!(
            extract_proxy_key(&headers, Some("key=from-query")),
            Some("from-header".to_string())
        );

        let headers = HeaderMap::new();
        assert_eq!(
            extract_proxy_key(&headers, Some("alt=json&key=from-query")),
            Some("from-query".to_string())
        );
        assert_eq!(extract_proxy_key(&headers, None), None);
    }

    #[test]
    fn hash_compare_accepts_exact_key_only() {
        let hash = hash_proxy_key("kg-proxy-key");
        assert!(proxy_key_matches(&hash, "kg-proxy-key"));
        assert!(!proxy_key_matches(&hash, "kg-proxy-keyx"));
        assert!(!proxy_key_matches(&hash, ""));
    }

    #[test]
    fn header_round_trip_skips_invalid_names() {
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("bad name".to_string(), "x".to_string()),
        ];
        let map = headers_from_vec(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("content-type").unwrap(), "application/json");
    }
}

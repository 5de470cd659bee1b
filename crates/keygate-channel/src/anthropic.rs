use crate::build::{base_outbound, join_url, stream_hint};
use crate::headers::{header_get, header_set};
use crate::types::{
    Channel, Group, HttpMethod, InboundParts, ResponseClass, UpstreamRequest, classify_by_status,
};

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic-like family: `x-api-key` plus a mandatory `anthropic-version`.
#[derive(Debug, Default)]
pub struct AnthropicChannel;

impl Channel for AnthropicChannel {
    fn channel_type(&self) -> &'static str {
        "anthropic"
    }

    fn build_upstream_request(
        &self,
        inbound: &InboundParts,
        group: &Group,
        upstream: &str,
        key: &str,
    ) -> UpstreamRequest {
        let version = header_get(&inbound.headers, "anthropic-version")
            .unwrap_or(DEFAULT_ANTHROPIC_VERSION)
            .to_string();
        let mut out = base_outbound(inbound, group, upstream);
        header_set(&mut out.headers, "x-api-key", key);
        header_set(&mut out.headers, "anthropic-version", version);
        out.is_stream = self.is_stream_request(inbound);
        out
    }

    fn is_stream_request(&self, inbound: &InboundParts) -> bool {
        stream_hint(inbound)
    }

    fn classify(&self, status: u16, _body: &[u8]) -> ResponseClass {
        classify_by_status(status)
    }

    fn validation_probe(&self, upstream: &str, key: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: HttpMethod::Get,
            url: join_url(upstream, "/v1/models", None),
            headers: vec![
                ("x-api-key".to_string(), key.to_string()),
                (
                    "anthropic-version".to_string(),
                    DEFAULT_ANTHROPIC_VERSION.to_string(),
                ),
            ],
            body: None,
            is_stream: false,
        }
    }
}

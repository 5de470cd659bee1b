use crate::build::{base_outbound, join_url, stream_hint};
use crate::headers::header_set;
use crate::types::{
    Channel, Group, HttpMethod, InboundParts, ResponseClass, UpstreamRequest, classify_by_status,
};

/// Gemini family: `x-goog-api-key` header, `v1beta` paths, `:streamGenerateContent`.
#[derive(Debug, Default)]
pub struct GeminiChannel;

impl Channel for GeminiChannel {
    fn channel_type(&self) -> &'static str {
        "gemini"
    }

    fn build_upstream_request(
        &self,
        inbound: &InboundParts,
        group: &Group,
        upstream: &str,
        key: &str,
    ) -> UpstreamRequest {
        // Callers pass their own key as `?key=`; base_outbound drops it and
        // the pool's key goes in the header instead.
        let mut out = base_outbound(inbound, group, upstream);
        header_set(&mut out.headers, "x-goog-api-key", key);
        out.is_stream = self.is_stream_request(inbound);
        out
    }

    fn is_stream_request(&self, inbound: &InboundParts) -> bool {
        if inbound.path.contains(":streamGenerateContent") {
            return true;
        }
        if let Some(query) = &inbound.query
            && query.split('&').any(|pair| pair == "alt=sse")
        {
            return true;
        }
        stream_hint(inbound)
    }

    fn classify(&self, status: u16, body: &[u8]) -> ResponseClass {
        // Google reports a revoked or malformed key as 400 INVALID_ARGUMENT.
        if status == 400 {
            let text = String::from_utf8_lossy(body);
            if text.contains("API_KEY_INVALID") || text.contains("API key not valid") {
                return ResponseClass::CredentialFailure;
            }
        }
        classify_by_status(status)
    }

    fn validation_probe(&self, upstream: &str, key: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: HttpMethod::Get,
            url: join_url(upstream, "/v1beta/models", None),
            headers: vec![("x-goog-api-key".to_string(), key.to_string())],
            body: None,
            is_stream: false,
        }
    }
}

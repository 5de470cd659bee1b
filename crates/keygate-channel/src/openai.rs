use crate::build::{base_outbound, join_url, stream_hint};
use crate::headers::header_set;
use crate::types::{
    Channel, Group, HttpMethod, InboundParts, ResponseClass, UpstreamRequest, classify_by_status,
};

/// OpenAI-compatible family: `Authorization: Bearer`, `/v1/...` paths.
#[derive(Debug, Default)]
pub struct OpenAiChannel;

/// Body markers that mean the key itself is exhausted or revoked even when
/// the status alone would read as retriable.
const KEY_FAILURE_MARKERS: [&str; 3] = ["insufficient_quota", "invalid_api_key", "account_deactivated"];

impl Channel for OpenAiChannel {
    fn channel_type(&self) -> &'static str {
        "openai"
    }

    fn build_upstream_request(
        &self,
        inbound: &InboundParts,
        group: &Group,
        upstream: &str,
        key: &str,
    ) -> UpstreamRequest {
        let mut out = base_outbound(inbound, group, upstream);
        header_set(&mut out.headers, "Authorization", format!("Bearer {key}"));
        out.is_stream = self.is_stream_request(inbound);
        out
    }

    fn is_stream_request(&self, inbound: &InboundParts) -> bool {
        stream_hint(inbound)
    }

    fn classify(&self, status: u16, body: &[u8]) -> ResponseClass {
        let class = classify_by_status(status);
        if class == ResponseClass::Retriable || class == ResponseClass::Passthrough {
            let text = String::from_utf8_lossy(body);
            if KEY_FAILURE_MARKERS.iter().any(|marker| text.contains(marker)) {
                return ResponseClass::CredentialFailure;
            }
        }
        class
    }

    fn validation_probe(&self, upstream: &str, key: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: HttpMethod::Get,
            url: join_url(upstream, "/v1/models", None),
            headers: vec![("Authorization".to_string(), format!("Bearer {key}"))],
            body: None,
            is_stream: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use keygate_common::GroupConfig;

    fn group() -> Group {
        Group {
            id: 1,
            name: "g1".to_string(),
            display_name: "Group 1".to_string(),
            channel_type: "openai".to_string(),
            upstreams: vec!["https://api.openai.com".to_string()],
            config: GroupConfig::default(),
        }
    }

    #[test]
    fn injects_bearer_auth() {
        let inbound = InboundParts {
            method: HttpMethod::Post,
            path: "/v1/chat/completions".to_string(),
            query: None,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), "Bearer proxy-key".to_string()),
            ],
            body: Bytes::from_static(br#"{"model":"gpt-4"}"#),
        };
        let out =
            OpenAiChannel.build_upstream_request(&inbound, &group(), "https://api.openai.com", "sk-real");
        assert_eq!(out.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            crate::headers::header_get(&out.headers, "authorization"),
            Some("Bearer sk-real")
        );
    }

    #[test]
    fn quota_exhaustion_is_credential_failure() {
        let body = br#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota"}}"#;
        assert_eq!(
            OpenAiChannel.classify(429, body),
            ResponseClass::CredentialFailure
        );
        assert_eq!(
            OpenAiChannel.classify(429, br#"{"error":{"message":"slow down"}}"#),
            ResponseClass::Retriable
        );
        assert_eq!(OpenAiChannel.classify(401, b""), ResponseClass::CredentialFailure);
    }

    #[test]
    fn probe_lists_models() {
        let probe = OpenAiChannel.validation_probe("https://api.openai.com", "sk-x");
        assert_eq!(probe.method, HttpMethod::Get);
        assert_eq!(probe.url, "https://api.openai.com/v1/models");
        assert!(!probe.is_stream);
    }
}

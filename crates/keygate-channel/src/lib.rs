pub mod anthropic;
pub mod build;
pub mod envelope;
pub mod gemini;
pub mod headers;
pub mod openai;
pub mod registry;
pub mod types;

pub use envelope::parse_upstream_error;
pub use headers::{
    Headers, header_get, header_remove, header_set, strip_client_auth, strip_hop_by_hop,
};
pub use registry::ChannelRegistry;
pub use types::{
    Channel, FailureKind, Group, HttpMethod, InboundParts, ResponseClass, TransportError,
    TransportErrorKind, UpstreamBody, UpstreamRequest, UpstreamResponse,
};

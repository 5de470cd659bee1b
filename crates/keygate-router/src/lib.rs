pub mod proxy;

pub use proxy::{health_router, proxy_router};

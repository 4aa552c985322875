//! Network transports for cai-mcp (stdio lives in the router)

pub mod http;
pub mod websocket;

pub use http::HttpTransport;

//! Per-tunnel forwarding proxy
//!
//! Relays raw TCP between a public listener and a private local port. The
//! first bytes of each connection are inspected for an HTTP request line
//! purely for logging; forwarding never depends on the result.

mod log_format;
mod server;
pub mod sniff;

pub use log_format::{tunnel_log_subscriber, TunnelLogFormat, PROXY_LOG_ENV, TIMESTAMP_FORMAT};
pub use server::{
    ForwardingProxy, ProxyConfig, ProxyError, DEFAULT_MAX_PEEK_BYTES, DEFAULT_PEEK_TIMEOUT,
};
pub use sniff::{sniff_request, SniffedRequest};

/// Exit status of the proxy process when the public port is already bound
pub const EXIT_BIND_FAILED: i32 = 98;

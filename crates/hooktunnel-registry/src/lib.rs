//! Tunnel registry and lifecycle manager
//!
//! Persists tunnels in a JSON registry under the data directory, spawns one
//! `hooktunnel-proxy` process per tunnel and optionally a localtunnel helper
//! for public exposure. Liveness is re-probed from the OS on every query.

pub mod config;
mod error;
pub mod logs;
mod manager;
pub mod paths;
pub mod ports;
pub mod process;
pub mod record;
pub mod store;

pub use config::GlobalConfig;
pub use error::{RegistryError, Result};
pub use manager::{
    find_proxy_binary, CreateTunnel, CreatedTunnel, ManagerOptions, TunnelManager, TunnelStats,
    MAX_BIND_ATTEMPTS, PROXY_BINARY, START_GRACE,
};
pub use paths::{DataDir, HOME_ENV};
pub use record::{ProcessInfo, PublicProvider, TunnelRecord, TunnelStatus};

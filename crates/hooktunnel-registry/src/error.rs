use hooktunnel_runtime::RuntimeError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid tunnel name '{name}': use only letters, digits, '-' and '_'")]
    InvalidName { name: String },

    #[error("Tunnel '{name}' already exists")]
    DuplicateName { name: String },

    #[error("Tunnel '{name}' not found")]
    NotFound { name: String },

    #[error("Local port {port} is not in use. Start your service first.")]
    LocalServiceNotRunning { port: u16 },

    #[error("Public port {port} is already in use or reserved by another tunnel")]
    PortUnavailable { port: u16 },

    #[error("No available port found in {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("Could not find the {name} binary next to this executable or in PATH")]
    ProxyBinaryNotFound { name: String },

    #[error("Failed to start proxy ({reason}). See log: {log_path:?}")]
    ProxyStartFailed { log_path: PathBuf, reason: String },

    #[error("Proxy could not bind public port {port}: address in use. See log: {log_path:?}")]
    ProxyBindFailed { port: u16, log_path: PathBuf },

    #[error("Local proxy of tunnel '{name}' is not running. Restart the tunnel before exposing it publicly.")]
    ProxyNotRunning { name: String },

    #[error("Could not determine home directory")]
    HomeDirNotFound,

    #[error("Failed to lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tunnel registry {path:?} is unreadable ({source}). Fix or move it aside; running proxies are not tracked until then.")]
    CorruptRegistry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

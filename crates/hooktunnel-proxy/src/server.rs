//! Forwarding proxy implementation
//!
//! Listens on the tunnel's public port and relays every accepted connection
//! to the private target. Each connection gets one task per direction.

use crate::sniff::{has_complete_head, sniff_request};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Default window for classifying the opening bytes of a connection
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on bytes buffered while looking for a header block
pub const DEFAULT_MAX_PEEK_BYTES: usize = 64 * 1024;

const RELAY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: address already in use\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try a different public port")]
    AddrInUse { address: String, port: u16 },

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },
}

impl ProxyError {
    /// Whether the listener failed because the port was already taken
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ProxyError::AddrInUse { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Tunnel name, used only for log context
    pub name: String,
    pub bind_addr: SocketAddr,
    pub target_host: String,
    pub target_port: u16,
    pub peek_timeout: Duration,
    pub max_peek_bytes: usize,
}

impl ProxyConfig {
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr, target_port: u16) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            target_host: "127.0.0.1".to_string(),
            target_port,
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            max_peek_bytes: DEFAULT_MAX_PEEK_BYTES,
        }
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Per-connection settings copied into each connection task
#[derive(Debug, Clone)]
struct ConnectionSettings {
    target_host: String,
    target_port: u16,
    peek_timeout: Duration,
    max_peek_bytes: usize,
}

pub struct ForwardingProxy {
    config: ProxyConfig,
    listener: TcpListener,
}

impl ForwardingProxy {
    /// Bind the public listener.
    ///
    /// An occupied port is reported as [`ProxyError::AddrInUse`] so the
    /// owning registry can tell it apart from other start-up failures.
    pub async fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        let listener = match TcpListener::bind(config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(ProxyError::AddrInUse {
                    address: config.bind_addr.to_string(),
                    port: config.bind_addr.port(),
                });
            }
            Err(e) => {
                return Err(ProxyError::BindError {
                    address: config.bind_addr.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// In-flight connections are not drained; their tasks keep running until
    /// the runtime is dropped.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let settings = ConnectionSettings {
            target_host: self.config.target_host.clone(),
            target_port: self.config.target_port,
            peek_timeout: self.config.peek_timeout,
            max_peek_bytes: self.config.max_peek_bytes,
        };

        info!("proxy ready");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let settings = settings.clone();
                        tokio::spawn(handle_connection(stream, peer_addr, settings));
                    }
                    Err(e) => {
                        error!("accept failed error={}", e);
                    }
                }
            }
        }

        info!("proxy stopped");
        Ok(())
    }
}

async fn handle_connection(client: TcpStream, peer_addr: SocketAddr, settings: ConnectionSettings) {
    info!("conn accepted from {}", peer_addr);

    let (mut client_read, client_write) = client.into_split();

    let initial = peek_head(&mut client_read, settings.peek_timeout, settings.max_peek_bytes).await;

    if let Some(req) = sniff_request(&initial) {
        let host = if req.host.is_empty() { "-" } else { req.host.as_str() };
        info!("http {} {} host={} from {}", req.method, req.path, host, peer_addr);
    }

    let upstream = match TcpStream::connect((settings.target_host.as_str(), settings.target_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            info!(
                "upstream connect failed to {}:{} error={}",
                settings.target_host, settings.target_port, e
            );
            // Dropping both halves closes the client connection
            return;
        }
    };

    let (upstream_read, mut upstream_write) = upstream.into_split();

    // Replay whatever was consumed while peeking
    if !initial.is_empty() {
        if let Err(e) = upstream_write.write_all(&initial).await {
            debug!("failed to replay {} peeked bytes: {}", initial.len(), e);
            info!("conn closed from {}", peer_addr);
            return;
        }
    }

    let client_to_upstream = tokio::spawn(pipe(client_read, upstream_write));
    let upstream_to_client = tokio::spawn(pipe(upstream_read, client_write));
    let client_abort = client_to_upstream.abort_handle();
    let upstream_abort = upstream_to_client.abort_handle();

    // Whichever direction finishes first tears down its sibling
    tokio::select! {
        _ = client_to_upstream => upstream_abort.abort(),
        _ = upstream_to_client => client_abort.abort(),
    }

    info!("conn closed from {}", peer_addr);
}

/// Read until a complete header block, EOF, the size cap, or the deadline.
///
/// Returns every byte consumed so it can be replayed upstream.
async fn peek_head(reader: &mut OwnedReadHalf, timeout: Duration, max_bytes: usize) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    while buf.len() < max_bytes && !has_complete_head(&buf) {
        let want = chunk.len().min(max_bytes - buf.len());
        match tokio::time::timeout_at(deadline, reader.read(&mut chunk[..want])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                debug!("peek read failed: {}", e);
                break;
            }
            Err(_) => break,
        }
    }

    buf
}

/// Copy bytes from one half to the other until EOF or error, then close the writer.
async fn pipe(mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf) -> u64 {
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]).await {
                    debug!("relay write failed: {}", e);
                    break;
                }
                total += n as u64;
            }
            Err(e) => {
                debug!("relay read failed: {}", e);
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    total
}

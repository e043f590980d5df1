//! Hooktunnel forwarding proxy process
//!
//! Spawned once per tunnel by the registry. Writes `[timestamp] [name] message`
//! lines to the tunnel's log file and exits on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use hooktunnel_proxy::{tunnel_log_subscriber, ForwardingProxy, ProxyConfig, EXIT_BIND_FAILED};
use std::fs::OpenOptions;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};

/// Forward a public port to a local service
#[derive(Parser, Debug)]
#[command(name = "hooktunnel-proxy")]
#[command(about = "Hooktunnel embedded forwarding proxy")]
#[command(version)]
struct Args {
    /// Tunnel name (log context only)
    #[arg(long)]
    name: String,

    /// Port to listen on
    #[arg(long)]
    public_port: u16,

    /// Port of the local service to forward to
    #[arg(long)]
    local_port: u16,

    /// Log file (appended)
    #[arg(long)]
    log_file: PathBuf,

    /// Address to bind the public listener on
    #[arg(long, default_value = "127.0.0.1")]
    bind_host: String,

    /// Host of the local service
    #[arg(long, default_value = "127.0.0.1")]
    target_host: String,

    /// Seconds to wait for an HTTP header block before forwarding opaquely
    #[arg(long, default_value = "0.5")]
    http_peek_timeout: f64,
}

fn main() {
    let args = Args::parse();

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            // The subscriber may not be installed yet; stderr is redirected to the log too
            eprintln!("fatal error: {:#}", e);
            error!("fatal error: {:#}", e);
            1
        }
    };

    std::process::exit(code);
}

fn run(args: Args) -> Result<i32> {
    if let Some(parent) = args.log_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.log_file)
        .with_context(|| format!("Failed to open log file: {:?}", args.log_file))?;

    tracing::subscriber::set_global_default(tunnel_log_subscriber(&args.name, Mutex::new(log_file)))
        .context("Failed to install log subscriber")?;

    let bind_addr = resolve(&args.bind_host, args.public_port)?;
    let peek_timeout = Duration::try_from_secs_f64(args.http_peek_timeout)
        .context("Invalid --http-peek-timeout")?;

    let config = ProxyConfig {
        name: args.name.clone(),
        bind_addr,
        target_host: args.target_host.clone(),
        target_port: args.local_port,
        peek_timeout,
        max_peek_bytes: hooktunnel_proxy::DEFAULT_MAX_PEEK_BYTES,
    };

    info!(
        "starting proxy bind={} -> {}",
        config.bind_addr,
        config.target()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        let proxy = match ForwardingProxy::bind(config).await {
            Ok(proxy) => proxy,
            Err(e) if e.is_addr_in_use() => {
                error!("bind failed: {}", e);
                return Ok(EXIT_BIND_FAILED);
            }
            Err(e) => return Err(e).context("Failed to start proxy"),
        };

        proxy.run_until(shutdown_signal()).await?;
        Ok::<i32, anyhow::Error>(0)
    })
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve bind address {}:{}", host, port))?
        .next()
        .with_context(|| format!("No address found for {}:{}", host, port))
}

/// Resolves on SIGINT, or SIGTERM on Unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

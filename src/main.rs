//! Hooktunnel CLI - named local tunnels with optional public exposure
//!
//! Forwards a public port to a service already running on this machine,
//! and can publish it on the internet through localtunnel.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hooktunnel_registry::{
    CreateTunnel, DataDir, PublicProvider, RegistryError, TunnelManager, TunnelRecord,
    TunnelStatus,
};
use hooktunnel_runtime::RuntimeError;
use std::io::{IsTerminal, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::prelude::*;

/// Hooktunnel - expose local ports under stable names
#[derive(Parser, Debug)]
#[command(name = "hooktunnel")]
#[command(about = "Hooktunnel - expose local ports under stable names")]
#[command(version, long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("HOOKTUNNEL_GIT_HASH"), "\nBuilt: ", env!("HOOKTUNNEL_BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Data directory (default: ~/.hooktunnel)
    #[arg(long, global = true, env = "HOOKTUNNEL_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new tunnel to a running local service
    #[command(long_about = r#"
Start a new tunnel forwarding a public port to a service that is already
listening on LOCAL_PORT.

EXAMPLES:
  # Forward the first free port from 8000 up to localhost:3000
  hooktunnel start myapi 3000

  # Pick the subdomain and public port
  hooktunnel start myapi 3000 --subdomain api --public-port 8080

  # Also publish it on the internet through localtunnel
  hooktunnel start myapi 3000 --public
    "#)]
    Start {
        /// Tunnel name
        name: String,

        /// Port of the local service
        local_port: u16,

        /// Subdomain (defaults to the tunnel name)
        #[arg(short, long)]
        subdomain: Option<String>,

        /// Public port (defaults to the first free port from base_port)
        #[arg(short, long)]
        public_port: Option<u16>,

        /// Expose the tunnel to the internet via localtunnel (npx)
        #[arg(long)]
        public: bool,
    },

    /// Stop a tunnel and forget it
    Stop {
        name: String,
    },

    /// Stop and start a tunnel with the same settings
    Restart {
        name: String,
    },

    /// List tunnels (dead ones are removed first)
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove tunnels whose proxy is no longer running
    Cleanup,

    /// Stop all tunnels
    Stopall,

    /// Show or change global settings
    Config {
        /// Base domain for public hostnames (e.g., localhost)
        #[arg(short, long)]
        domain: Option<String>,

        /// First port tried when choosing public ports
        #[arg(long)]
        base_port: Option<u16>,
    },

    /// Show the logs of a tunnel
    Logs {
        name: String,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Keep printing new log output
        #[arg(short, long)]
        follow: bool,
    },

    /// Show details of a tunnel
    Info {
        name: String,
    },

    /// Show totals across all tunnels
    Stats,

    /// Manage public exposure of an existing tunnel
    Public {
        #[command(subcommand)]
        command: PublicCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PublicCommands {
    /// Publish a running tunnel through localtunnel
    Start { name: String },
    /// Stop public exposure, keeping the local tunnel
    Stop { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let paths = match cli.home {
        Some(home) => DataDir::new(home),
        None => DataDir::from_env()?,
    };
    let mut manager = TunnelManager::open(paths, Default::default())
        .context("Failed to open tunnel registry")?;

    match cli.command {
        Commands::Start {
            name,
            local_port,
            subdomain,
            public_port,
            public,
        } => {
            handle_start(&mut manager, name, local_port, subdomain, public_port, public).await
        }
        Commands::Stop { name } => {
            println!("🛑 Stopping tunnel '{}'...", name);
            manager.stop(&name).await?;
            println!("✅ Tunnel '{}' stopped", name);
            Ok(())
        }
        Commands::Restart { name } => {
            println!("🔄 Restarting tunnel '{}'...", name);
            let created = manager.restart(&name, is_interactive()).await?;
            println!("✅ Tunnel '{}' restarted", name);
            println!("   Public URL: {}", created.record.public_url);
            report_public(&created.record, created.public_error.as_ref());
            Ok(())
        }
        Commands::List { json } => handle_list(&mut manager, json).await,
        Commands::Cleanup => {
            let removed = manager.cleanup_dead().await?;
            if removed.is_empty() {
                println!("✨ No inactive tunnels found");
            } else {
                println!("✅ Removed {} inactive tunnel(s)", removed.len());
                for name in removed {
                    println!("  • {}", name);
                }
            }
            Ok(())
        }
        Commands::Stopall => handle_stop_all(&mut manager).await,
        Commands::Config { domain, base_port } => handle_config(&mut manager, domain, base_port),
        Commands::Logs {
            name,
            lines,
            follow,
        } => handle_logs(&mut manager, &name, lines, follow).await,
        Commands::Info { name } => handle_info(&mut manager, &name),
        Commands::Stats => {
            let stats = manager.stats()?;
            println!("📊 Statistics");
            println!();
            println!("Tunnels:");
            println!("  Total:  {}", stats.total_tunnels);
            println!("  Active: {}", stats.active_tunnels);
            println!("  Dead:   {}", stats.dead_tunnels);
            println!();
            println!("Resources:");
            println!("  Total CPU:    {}%", stats.total_cpu_percent);
            println!("  Total Memory: {:.2} MB", stats.total_memory_mb);
            Ok(())
        }
        Commands::Public { command } => match command {
            PublicCommands::Start { name } => {
                println!("🌍 Publishing tunnel '{}'...", name);
                let record = manager.start_public(&name, is_interactive()).await?;
                report_public(&record, None);
                Ok(())
            }
            PublicCommands::Stop { name } => {
                manager.stop_public(&name).await?;
                println!("✅ Public exposure of '{}' stopped", name);
                Ok(())
            }
        },
    }
}

async fn handle_start(
    manager: &mut TunnelManager,
    name: String,
    local_port: u16,
    subdomain: Option<String>,
    public_port: Option<u16>,
    public: bool,
) -> Result<()> {
    println!("🚀 Starting tunnel '{}'...", name);

    let mut request = CreateTunnel::new(name, local_port).interactive(is_interactive());
    if let Some(subdomain) = subdomain {
        request = request.subdomain(subdomain);
    }
    if let Some(port) = public_port {
        request = request.public_port(port);
    }
    if public {
        request = request.public(PublicProvider::Localtunnel);
    }

    let created = manager.create(request).await?;
    let record = &created.record;

    println!("✅ Tunnel created");
    println!();
    println!("   Name:         {}", record.name);
    println!("   Local Port:   {}", record.local_port);
    println!("   Public Port:  {}", record.public_port);
    println!("   Hostname URL: {}", record.public_url);
    println!("   Local URL:    {} (always works)", record.local_url);
    println!();
    println!("   If the hostname does not resolve, test without DNS changes:");
    println!("   {}", record.curl_resolve_example);
    report_public(record, created.public_error.as_ref());
    println!();
    println!("💡 Use 'hooktunnel stop {}' to stop the tunnel", record.name);

    Ok(())
}

/// Print the external URL, or why there is none
fn report_public(record: &TunnelRecord, error: Option<&RegistryError>) {
    if let Some(url) = &record.public_url_external {
        println!();
        println!("🌍 External URL: {}", url);
        println!("   Test it with: curl -v {}", url);
    }

    let Some(error) = error else {
        return;
    };
    eprintln!();
    eprintln!("⚠️  Public exposure failed: {}", error);
    match error {
        RegistryError::Runtime(RuntimeError::RunnerNotFound { .. }) => {
            eprintln!("   Install Node.js (npx), or run interactively to download a portable copy.");
        }
        RegistryError::Runtime(RuntimeError::ExternalUrlTimeout { log_path, .. })
        | RegistryError::Runtime(RuntimeError::ExposureExited { log_path, .. }) => {
            eprintln!("   See {}", log_path.display());
        }
        _ => {}
    }
    eprintln!(
        "   The local tunnel is running. Retry with 'hooktunnel public start {}'.",
        record.name
    );
}

async fn handle_list(manager: &mut TunnelManager, json: bool) -> Result<()> {
    let removed = manager.cleanup_dead().await?;
    if !removed.is_empty() && !json {
        println!("🧹 Removed {} inactive tunnel(s)", removed.len());
        println!();
    }

    let tunnels = manager.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tunnels)?);
        return Ok(());
    }

    if tunnels.is_empty() {
        println!("📭 No active tunnels");
        println!("Start one with: hooktunnel start <name> <local-port>");
        return Ok(());
    }

    println!("🚇 Active tunnels ({})", tunnels.len());
    println!();
    println!(
        "  {:<16} {:<10} {:>6} {:>6}  {:<32} {:>6} {:>9}",
        "NAME", "STATUS", "LOCAL", "PUBLIC", "URL", "CPU%", "MEMORY"
    );
    for tunnel in &tunnels {
        let (cpu, memory) = tunnel
            .process_info
            .as_ref()
            .map(|info| (info.cpu_percent, info.memory_mb))
            .unwrap_or_default();
        println!(
            "  {:<16} {:<10} {:>6} {:>6}  {:<32} {:>5.1}% {:>7.1}MB",
            tunnel.name,
            status_label(tunnel.status),
            format!(":{}", tunnel.local_port),
            format!(":{}", tunnel.public_port),
            tunnel.public_url,
            cpu,
            memory
        );
        if let Some(url) = &tunnel.public_url_external {
            println!("  {:<16} 🌍 {}", "", url);
        }
    }

    let stats = manager.stats()?;
    println!();
    println!(
        "Total: {} | Active: {} | CPU: {}% | Memory: {:.1}MB",
        stats.total_tunnels, stats.active_tunnels, stats.total_cpu_percent, stats.total_memory_mb
    );
    Ok(())
}

async fn handle_stop_all(manager: &mut TunnelManager) -> Result<()> {
    let results = manager.stop_all().await?;
    if results.is_empty() {
        println!("📭 No active tunnels");
        return Ok(());
    }

    println!("🛑 Stopping {} tunnel(s)...", results.len());
    let mut failed = 0;
    for (name, result) in results {
        match result {
            Ok(()) => println!("  ✅ {}", name),
            Err(e) => {
                failed += 1;
                println!("  ❌ {}: {}", name, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} tunnel(s) could not be stopped", failed);
    }
    println!();
    println!("✅ All tunnels stopped");
    Ok(())
}

fn handle_config(
    manager: &mut TunnelManager,
    domain: Option<String>,
    base_port: Option<u16>,
) -> Result<()> {
    if domain.is_none() && base_port.is_none() {
        println!("⚙️  Current configuration ({})", manager.paths().config_file().display());
        println!();
        let value = serde_json::to_value(manager.config())?;
        if let Some(entries) = value.as_object() {
            for (key, value) in entries {
                println!("  {:<18} {}", key, value);
            }
        }
        return Ok(());
    }

    if let Some(domain) = domain {
        manager.set_domain(&domain)?;
        println!("✅ Domain configured: {}", domain);
    }
    if let Some(port) = base_port {
        manager.update_config(|config| config.base_port = port)?;
        println!("✅ Base port configured: {}", port);
    }
    Ok(())
}

async fn handle_logs(
    manager: &mut TunnelManager,
    name: &str,
    lines: usize,
    follow: bool,
) -> Result<()> {
    let tunnel = manager.get(name)?.ok_or_else(|| RegistryError::NotFound {
        name: name.to_string(),
    })?;

    println!("📋 Logs for '{}':", name);
    println!("{}", "─".repeat(60));

    let content = manager.logs(name, lines)?;
    if content.trim().is_empty() {
        println!("(empty)");
    } else {
        print!("{}", content);
    }

    if follow {
        let provider = tunnel
            .public_provider
            .unwrap_or(PublicProvider::Localtunnel);
        let files = vec![
            FollowedLog::new(manager.paths().proxy_log(name), None),
            FollowedLog::new(
                manager.paths().public_log(name, provider),
                Some(format!("[public: {}]", provider)),
            ),
        ];

        println!();
        println!("Following logs (Ctrl+C to stop)...");
        follow_logs(files).await?;
        println!();
        println!("Stopped following logs");
    }
    Ok(())
}

/// A log file being followed and how much of it has been printed
struct FollowedLog {
    path: PathBuf,
    /// Prepended to each line; such logs are only printed in whole lines
    prefix: Option<String>,
    offset: u64,
}

impl FollowedLog {
    fn new(path: PathBuf, prefix: Option<String>) -> Self {
        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            path,
            prefix,
            offset,
        }
    }

    /// Bytes appended since the last call. A missing file reads as empty.
    fn read_appended(&mut self) -> std::io::Result<Vec<u8>> {
        let Ok(mut file) = std::fs::File::open(&self.path) else {
            return Ok(Vec::new());
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            // Truncated or replaced
            self.offset = 0;
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut appended = Vec::new();
        file.read_to_end(&mut appended)?;

        if self.prefix.is_some() {
            match appended.iter().rposition(|b| *b == b'\n') {
                Some(end) => appended.truncate(end + 1),
                None => appended.clear(),
            }
        }
        self.offset += appended.len() as u64;
        Ok(appended)
    }

    fn print_appended(&mut self, out: &mut impl Write) -> Result<()> {
        let appended = self.read_appended()?;
        match &self.prefix {
            None => out.write_all(&appended)?,
            Some(prefix) => {
                for line in String::from_utf8_lossy(&appended).lines() {
                    writeln!(out, "{} {}", prefix, line)?;
                }
            }
        }
        Ok(())
    }
}

/// Print whatever gets appended to `files` until Ctrl+C
async fn follow_logs(mut files: Vec<FollowedLog>) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let mut stdout = std::io::stdout().lock();
        for file in &mut files {
            file.print_appended(&mut stdout)?;
        }
        stdout.flush()?;
    }
}

fn handle_info(manager: &mut TunnelManager, name: &str) -> Result<()> {
    let tunnel = manager.get(name)?.ok_or_else(|| RegistryError::NotFound {
        name: name.to_string(),
    })?;

    let (cpu, memory) = tunnel
        .process_info
        .as_ref()
        .map(|info| (info.cpu_percent, info.memory_mb))
        .unwrap_or_default();

    println!("🚇 {}", tunnel.name);
    println!();
    println!("General:");
    println!("  Status:  {}", status_label(tunnel.status));
    println!("  Created: {}", tunnel.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
    println!("Ports:");
    println!("  Local Port:  {}", tunnel.local_port);
    println!("  Public Port: {}", tunnel.public_port);
    println!();
    println!("Network:");
    println!("  Host:       {}", tunnel.public_host);
    println!("  Public URL: {}", tunnel.public_url);
    println!("  Local URL:  {}", tunnel.local_url);
    if let Some(provider) = tunnel.public_provider {
        println!(
            "  External:   {} ({})",
            tunnel.public_url_external.as_deref().unwrap_or("stopped"),
            provider
        );
    }
    println!();
    println!("Process:");
    println!(
        "  PID:    {}",
        tunnel
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "N/A".to_string())
    );
    println!("  CPU:    {:.2}%", cpu);
    println!("  Memory: {:.2} MB", memory);
    if let Some(started) = tunnel.process_info.as_ref().and_then(|i| i.started_at.as_deref()) {
        println!("  Since:  {}", started);
    }
    Ok(())
}

fn status_label(status: TunnelStatus) -> String {
    match status {
        TunnelStatus::Running => format!("🟢 {}", status),
        TunnelStatus::Dead => format!("🔴 {}", status),
        TunnelStatus::Active => format!("⚪ {}", status),
    }
}

/// Downloads may only be offered when someone can answer the prompt
fn is_interactive() -> bool {
    std::io::stdin().is_terminal()
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

//! Tunnel lifecycle
//!
//! The manager owns no process handles. Proxies and exposure helpers run
//! detached and are tracked by pid only; every query re-probes the OS.

use crate::config::GlobalConfig;
use crate::error::{RegistryError, Result};
use crate::logs::tail_lines;
use crate::paths::DataDir;
use crate::ports::{find_available_port, is_port_in_use};
use crate::process::{self, detach, STOP_TIMEOUT};
use crate::record::{PublicProvider, TunnelRecord, TunnelStatus};
use crate::store::{TunnelStore, Tunnels};
use hooktunnel_proxy::EXIT_BIND_FAILED;
use hooktunnel_runtime::{Bootstrapper, ExposureLauncher, PublicExposure, DEFAULT_URL_TIMEOUT};
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the proxy executable
pub const PROXY_BINARY: &str = "hooktunnel-proxy";

/// How long a freshly spawned proxy must survive to count as started
pub const START_GRACE: Duration = Duration::from_millis(500);

/// Ports tried when the proxy loses an auto-selected port to a race
pub const MAX_BIND_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Proxy executable; searched next to the current executable and in PATH if unset
    pub proxy_bin: Option<PathBuf>,
    pub start_grace: Duration,
    pub stop_timeout: Duration,
    pub url_timeout: Duration,
    /// Node.js distribution mirror
    pub dist_url: Option<String>,
    /// Replaces PATH when looking for the runner
    pub runner_search_path: Option<OsString>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            proxy_bin: None,
            start_grace: START_GRACE,
            stop_timeout: STOP_TIMEOUT,
            url_timeout: DEFAULT_URL_TIMEOUT,
            dist_url: None,
            runner_search_path: None,
        }
    }
}

/// Parameters of [`TunnelManager::create`]
#[derive(Debug, Clone)]
pub struct CreateTunnel {
    pub name: String,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub public_port: Option<u16>,
    pub public_provider: Option<PublicProvider>,
    /// Allow prompting before a runtime download
    pub interactive: bool,
}

impl CreateTunnel {
    pub fn new(name: impl Into<String>, local_port: u16) -> Self {
        Self {
            name: name.into(),
            local_port,
            subdomain: None,
            public_port: None,
            public_provider: None,
            interactive: false,
        }
    }

    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn public_port(mut self, port: u16) -> Self {
        self.public_port = Some(port);
        self
    }

    pub fn public(mut self, provider: PublicProvider) -> Self {
        self.public_provider = Some(provider);
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

/// A created tunnel. Public exposure is best effort: when it fails the
/// local tunnel is still up and persisted, and the failure is reported here.
#[derive(Debug)]
pub struct CreatedTunnel {
    pub record: TunnelRecord,
    pub public_error: Option<RegistryError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelStats {
    pub total_tunnels: usize,
    pub active_tunnels: usize,
    pub dead_tunnels: usize,
    pub total_cpu_percent: f64,
    pub total_memory_mb: f64,
}

pub struct TunnelManager {
    paths: DataDir,
    config: GlobalConfig,
    store: TunnelStore,
    tunnels: Tunnels,
    options: ManagerOptions,
    bootstrapper: Bootstrapper,
    launcher: ExposureLauncher,
}

impl TunnelManager {
    /// Open the default data directory
    pub fn new() -> Result<Self> {
        Self::open(DataDir::from_env()?, ManagerOptions::default())
    }

    pub fn open(paths: DataDir, options: ManagerOptions) -> Result<Self> {
        paths.ensure()?;
        let config = GlobalConfig::load_or_init(&paths.config_file())?;
        let store = TunnelStore::new(&paths);

        let mut bootstrapper = Bootstrapper::new(paths.node_tools_dir());
        if let Some(url) = &options.dist_url {
            bootstrapper = bootstrapper.with_dist_url(url.clone());
        }
        if let Some(search_path) = &options.runner_search_path {
            bootstrapper = bootstrapper.with_search_path(search_path.clone());
        }
        let launcher = ExposureLauncher::new(options.url_timeout);

        debug!("Opened data directory {:?}", paths.root());

        // The registry itself is read per operation, so a damaged
        // tunnels.json does not block config changes
        Ok(Self {
            paths,
            config,
            store,
            tunnels: Tunnels::new(),
            options,
            bootstrapper,
            launcher,
        })
    }

    pub fn paths(&self) -> &DataDir {
        &self.paths
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn set_domain(&mut self, domain: &str) -> Result<()> {
        let domain = domain.to_string();
        self.update_config(move |config| config.domain = domain)
    }

    /// Apply `change` to the on-disk config and persist it
    pub fn update_config(&mut self, change: impl FnOnce(&mut GlobalConfig)) -> Result<()> {
        let path = self.paths.config_file();
        let mut config = GlobalConfig::load_or_init(&path)?;
        change(&mut config);
        config.save(&path)?;
        self.config = config;
        Ok(())
    }

    /// One record with freshly probed status and resource usage
    pub fn get(&mut self, name: &str) -> Result<Option<TunnelRecord>> {
        self.tunnels = self.store.load()?;
        let mut record = self.tunnels.get(name).cloned();
        if let Some(record) = record.as_mut() {
            refresh_status(record);
        }
        Ok(record)
    }

    pub async fn create(&mut self, request: CreateTunnel) -> Result<CreatedTunnel> {
        validate_name(&request.name)?;

        let lock = self.store.lock()?;
        self.tunnels = lock.load()?;

        if self.tunnels.contains_key(&request.name) {
            return Err(RegistryError::DuplicateName {
                name: request.name,
            });
        }
        if !is_port_in_use(request.local_port) {
            return Err(RegistryError::LocalServiceNotRunning {
                port: request.local_port,
            });
        }

        let subdomain = request
            .subdomain
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| request.name.clone());
        let reserved: HashSet<u16> = self.tunnels.values().map(|t| t.public_port).collect();

        let (public_port, pid) = match request.public_port {
            Some(port) => {
                if reserved.contains(&port) || is_port_in_use(port) {
                    return Err(RegistryError::PortUnavailable { port });
                }
                let pid = self
                    .spawn_proxy(&request.name, port, request.local_port)
                    .await?;
                (port, pid)
            }
            None => {
                self.spawn_on_free_port(&request.name, request.local_port, reserved)
                    .await?
            }
        };

        let mut record = TunnelRecord::new(
            &request.name,
            request.local_port,
            public_port,
            &subdomain,
            &self.config.domain,
        );
        record.pid = Some(pid);
        info!(
            "Tunnel {} listening on {} -> 127.0.0.1:{} (pid {})",
            record.name, record.public_url, record.local_port, pid
        );

        let mut public_error = None;
        if let Some(provider) = request.public_provider {
            match self.expose(&record, provider, request.interactive).await {
                Ok(exposure) => {
                    record.public_provider = Some(provider);
                    record.public_pid = Some(exposure.pid);
                    record.public_url_external = Some(exposure.url);
                }
                Err(e) => {
                    warn!("Public exposure of {} failed: {}", record.name, e);
                    public_error = Some(e);
                }
            }
        }

        self.tunnels.insert(record.name.clone(), record.clone());
        lock.save(&self.tunnels)?;

        Ok(CreatedTunnel {
            record,
            public_error,
        })
    }

    /// Terminate the tunnel's processes and forget it
    pub async fn stop(&mut self, name: &str) -> Result<()> {
        let lock = self.store.lock()?;
        self.tunnels = lock.load()?;

        let record = self
            .tunnels
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))?;

        self.terminate_children(&record).await?;

        self.tunnels.remove(name);
        lock.save(&self.tunnels)?;
        info!("Stopped tunnel {}", name);
        Ok(())
    }

    /// Stop, then create again with the same ports, subdomain and provider
    pub async fn restart(&mut self, name: &str, interactive: bool) -> Result<CreatedTunnel> {
        let previous = self
            .store
            .load()?
            .remove(name)
            .ok_or_else(|| not_found(name))?;

        self.stop(name).await?;

        let mut request = CreateTunnel::new(name, previous.local_port)
            .subdomain(previous.subdomain)
            .public_port(previous.public_port)
            .interactive(interactive);
        if let Some(provider) = previous.public_provider {
            request = request.public(provider);
        }
        self.create(request).await
    }

    /// Attach public exposure to a running tunnel. No-op if already exposed.
    pub async fn start_public(&mut self, name: &str, interactive: bool) -> Result<TunnelRecord> {
        let lock = self.store.lock()?;
        self.tunnels = lock.load()?;

        let mut record = self
            .tunnels
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))?;

        if !record.pid.is_some_and(process::is_alive) {
            return Err(RegistryError::ProxyNotRunning {
                name: name.to_string(),
            });
        }
        if record.public_pid.is_some_and(process::is_alive) {
            return Ok(record);
        }

        let provider = record
            .public_provider
            .unwrap_or(PublicProvider::Localtunnel);
        let exposure = self.expose(&record, provider, interactive).await?;

        record.public_provider = Some(provider);
        record.public_pid = Some(exposure.pid);
        record.public_url_external = Some(exposure.url);

        self.tunnels.insert(name.to_string(), record.clone());
        lock.save(&self.tunnels)?;
        Ok(record)
    }

    /// Stop public exposure only. The provider is kept for the next start.
    pub async fn stop_public(&mut self, name: &str) -> Result<TunnelRecord> {
        let lock = self.store.lock()?;
        self.tunnels = lock.load()?;

        let mut record = self
            .tunnels
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))?;

        if let Some(pid) = record.public_pid {
            process::terminate(pid, self.options.stop_timeout).await?;
        }
        record.clear_public_runtime();

        self.tunnels.insert(name.to_string(), record.clone());
        lock.save(&self.tunnels)?;
        Ok(record)
    }

    /// All records with freshly probed status and resource usage.
    ///
    /// The probe result is not written back to disk.
    pub fn list(&mut self) -> Result<Vec<TunnelRecord>> {
        self.tunnels = self.store.load()?;
        for record in self.tunnels.values_mut() {
            refresh_status(record);
        }
        Ok(self.tunnels.values().cloned().collect())
    }

    /// Forget tunnels whose proxy has exited. Returns the removed names.
    pub async fn cleanup_dead(&mut self) -> Result<Vec<String>> {
        let lock = self.store.lock()?;
        self.tunnels = lock.load()?;

        let dead: Vec<String> = self
            .tunnels
            .values()
            .filter(|t| t.pid.is_some_and(|pid| !process::is_alive(pid)))
            .map(|t| t.name.clone())
            .collect();
        if dead.is_empty() {
            return Ok(dead);
        }

        for name in &dead {
            // An exposure helper outliving its proxy has nothing to forward to
            if let Some(public_pid) = self.tunnels.get(name).and_then(|t| t.public_pid) {
                if let Err(e) = process::terminate(public_pid, self.options.stop_timeout).await {
                    warn!("Failed to stop public helper {} of {}: {}", public_pid, name, e);
                }
            }
            self.tunnels.remove(name);
        }
        lock.save(&self.tunnels)?;
        info!("Removed {} dead tunnel(s)", dead.len());
        Ok(dead)
    }

    /// Stop every tunnel, continuing past failures
    pub async fn stop_all(&mut self) -> Result<Vec<(String, Result<()>)>> {
        let names: Vec<String> = self.store.load()?.into_keys().collect();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.stop(&name).await;
            results.push((name, result));
        }
        Ok(results)
    }

    pub fn stats(&mut self) -> Result<TunnelStats> {
        let records = self.list()?;
        let active = records
            .iter()
            .filter(|r| r.status == TunnelStatus::Running)
            .count();
        let (cpu, memory) = records
            .iter()
            .filter_map(|r| r.process_info.as_ref())
            .fold((0.0, 0.0), |(cpu, memory), info| {
                (cpu + info.cpu_percent, memory + info.memory_mb)
            });

        Ok(TunnelStats {
            total_tunnels: records.len(),
            active_tunnels: active,
            dead_tunnels: records.len() - active,
            total_cpu_percent: round2(cpu),
            total_memory_mb: round2(memory),
        })
    }

    /// Tail of the proxy log, followed by the exposure helper's log if any.
    /// Empty when the tunnel never logged anything.
    pub fn logs(&self, name: &str, max_lines: usize) -> Result<String> {
        let mut out = match tail_lines(&self.paths.proxy_log(name), max_lines) {
            Ok(tail) => tail,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };

        let provider = self
            .store
            .load()?
            .get(name)
            .and_then(|t| t.public_provider)
            .unwrap_or(PublicProvider::Localtunnel);
        match tail_lines(&self.paths.public_log(name, provider), max_lines) {
            Ok(tail) => {
                out.push_str(&format!("\n--- [public: {}] ---\n", provider));
                out.push_str(&tail);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(out)
    }

    async fn spawn_on_free_port(
        &self,
        name: &str,
        local_port: u16,
        mut reserved: HashSet<u16>,
    ) -> Result<(u16, u32)> {
        let range = self.config.port_range();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let port = find_available_port(range.clone(), &reserved).ok_or(
                RegistryError::NoPortAvailable {
                    start: range.start,
                    end: range.end.saturating_sub(1),
                },
            )?;

            match self.spawn_proxy(name, port, local_port).await {
                Ok(pid) => return Ok((port, pid)),
                Err(RegistryError::ProxyBindFailed { .. }) if attempt < MAX_BIND_ATTEMPTS => {
                    warn!("Port {} was taken before the proxy could bind it, trying another", port);
                    reserved.insert(port);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Launch the proxy process and check it survives the grace period
    async fn spawn_proxy(&self, name: &str, public_port: u16, local_port: u16) -> Result<u32> {
        let binary = self.proxy_binary()?;
        let log_path = self.paths.proxy_log(name);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let mut command = Command::new(&binary);
        command
            .arg("--name")
            .arg(name)
            .arg("--public-port")
            .arg(public_port.to_string())
            .arg("--local-port")
            .arg(local_port.to_string())
            .arg("--log-file")
            .arg(&log_path)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        detach(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| RegistryError::ProxyStartFailed {
                log_path: log_path.clone(),
                reason: format!("could not execute {:?}: {}", binary, e),
            })?;
        let pid = child.id();
        debug!("Spawned proxy for {} on port {} (pid {})", name, public_port, pid);

        tokio::time::sleep(self.options.start_grace).await;

        match child.try_wait()? {
            None => Ok(pid),
            Some(status) if status.code() == Some(EXIT_BIND_FAILED) => {
                Err(RegistryError::ProxyBindFailed {
                    port: public_port,
                    log_path,
                })
            }
            Some(status) => Err(RegistryError::ProxyStartFailed {
                log_path,
                reason: format!("proxy exited with {}", status),
            }),
        }
    }

    fn proxy_binary(&self) -> Result<PathBuf> {
        match &self.options.proxy_bin {
            Some(path) => Ok(path.clone()),
            None => find_proxy_binary(),
        }
    }

    async fn expose(
        &mut self,
        record: &TunnelRecord,
        provider: PublicProvider,
        interactive: bool,
    ) -> Result<PublicExposure> {
        let runner = self
            .bootstrapper
            .ensure_runner(self.config.bundled_node.as_ref(), interactive)
            .await?;

        if let Some(installed) = runner.provisioned {
            info!(
                "Installed Node.js {} at {:?}",
                installed.version, installed.root
            );
            self.update_config(|config| config.bundled_node = Some(installed))?;
        }

        let log_path = self.paths.public_log(&record.name, provider);
        let exposure = self
            .launcher
            .launch(&runner.path, record.public_port, &log_path)
            .await?;
        Ok(exposure)
    }

    async fn terminate_children(&self, record: &TunnelRecord) -> Result<()> {
        if let Some(pid) = record.public_pid {
            process::terminate(pid, self.options.stop_timeout).await?;
        }
        if let Some(pid) = record.pid {
            process::terminate(pid, self.options.stop_timeout).await?;
        }
        Ok(())
    }
}

/// The proxy next to the current executable, else from PATH
pub fn find_proxy_binary() -> Result<PathBuf> {
    let file_name = format!("{}{}", PROXY_BINARY, std::env::consts::EXE_SUFFIX);
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
    {
        let candidate = dir.join(&file_name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    which::which(PROXY_BINARY).map_err(|_| RegistryError::ProxyBinaryNotFound {
        name: PROXY_BINARY.to_string(),
    })
}

/// Names end up in file names, so keep them to a safe alphabet
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName {
            name: name.to_string(),
        })
    }
}

fn refresh_status(record: &mut TunnelRecord) {
    match record.pid.filter(|pid| process::is_alive(*pid)) {
        Some(pid) => {
            record.status = TunnelStatus::Running;
            record.process_info = process::process_info(pid);
        }
        None => {
            record.status = TunnelStatus::Dead;
            record.process_info = None;
        }
    }
}

fn not_found(name: &str) -> RegistryError {
    RegistryError::NotFound {
        name: name.to_string(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> TunnelManager {
        let options = ManagerOptions {
            proxy_bin: Some(PathBuf::from("/nonexistent/hooktunnel-proxy")),
            ..ManagerOptions::default()
        };
        TunnelManager::open(DataDir::new(dir.path()), options).unwrap()
    }

    fn seed(manager: &TunnelManager, records: &[TunnelRecord]) {
        let lock = manager.store.lock().unwrap();
        let tunnels: Tunnels = records
            .iter()
            .map(|r| (r.name.clone(), r.clone()))
            .collect();
        lock.save(&tunnels).unwrap();
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("api-v2_test").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a b").is_err());
    }

    #[test]
    fn test_open_writes_default_config() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert_eq!(manager.config().domain, "localhost");
        assert!(dir.path().join("config.json").exists());
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_set_domain_persists() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        manager.set_domain("dev.test").unwrap();

        let reopened = TunnelManager::open(DataDir::new(dir.path()), ManagerOptions::default()).unwrap();
        assert_eq!(reopened.config().domain, "dev.test");
    }

    #[tokio::test]
    async fn test_create_rejects_unbound_local_port() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);

        let free = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let result = manager.create(CreateTunnel::new("api", port)).await;
        assert!(matches!(
            result,
            Err(RegistryError::LocalServiceNotRunning { port: p }) if p == port
        ));
        assert!(manager.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_and_invalid_names() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        seed(&manager, &[TunnelRecord::new("api", 3000, 8000, "api", "localhost")]);

        let result = manager.create(CreateTunnel::new("api", 3000)).await;
        assert!(matches!(result, Err(RegistryError::DuplicateName { .. })));

        let result = manager.create(CreateTunnel::new("a/b", 3000)).await;
        assert!(matches!(result, Err(RegistryError::InvalidName { .. })));
    }

    #[tokio::test]
    async fn test_create_rejects_reserved_public_port() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_port = service.local_addr().unwrap().port();
        seed(&manager, &[TunnelRecord::new("api", 3000, 8123, "api", "localhost")]);

        let result = manager
            .create(CreateTunnel::new("web", local_port).public_port(8123))
            .await;
        assert!(matches!(
            result,
            Err(RegistryError::PortUnavailable { port: 8123 })
        ));
    }

    #[tokio::test]
    async fn test_missing_proxy_binary_is_a_start_failure() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_port = service.local_addr().unwrap().port();

        let result = manager.create(CreateTunnel::new("api", local_port)).await;
        match result {
            Err(RegistryError::ProxyStartFailed { log_path, .. }) => {
                assert_eq!(log_path, dir.path().join("logs").join("api.log"));
            }
            other => panic!("expected start failure, got {:?}", other),
        }
        assert!(manager.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_tunnel() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        assert!(matches!(
            manager.stop("ghost").await,
            Err(RegistryError::NotFound { .. })
        ));
        assert!(matches!(
            manager.restart("ghost", false).await,
            Err(RegistryError::NotFound { .. })
        ));
        assert!(matches!(
            manager.stop_public("ghost").await,
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_removes_record_with_dead_pid() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        let mut record = TunnelRecord::new("api", 3000, 8000, "api", "localhost");
        record.pid = Some(u32::MAX);
        seed(&manager, &[record]);

        manager.stop("api").await.unwrap();
        assert!(manager.list().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reused_foreign_pid_does_not_block_stop() {
        let foreign = unsafe { libc::kill(1, 0) } != 0
            && io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        if !foreign {
            return;
        }

        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        let mut a = TunnelRecord::new("a", 3000, 8000, "a", "localhost");
        a.pid = Some(1);
        let mut b = TunnelRecord::new("b", 3001, 8001, "b", "localhost");
        b.pid = Some(1);
        seed(&manager, &[a, b]);

        assert_eq!(manager.get("a").unwrap().unwrap().status, TunnelStatus::Dead);
        manager.stop("a").await.unwrap();
        assert_eq!(manager.cleanup_dead().await.unwrap(), vec!["b".to_string()]);
        assert!(manager.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_and_cleanup_dead() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);

        let mut alive = TunnelRecord::new("alive", 3000, 8000, "alive", "localhost");
        alive.pid = Some(std::process::id());
        let mut dead = TunnelRecord::new("dead", 3001, 8001, "dead", "localhost");
        dead.pid = Some(u32::MAX);
        seed(&manager, &[alive, dead]);

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "alive");
        assert_eq!(listed[0].status, TunnelStatus::Running);
        assert_eq!(listed[1].status, TunnelStatus::Dead);
        assert!(listed[1].process_info.is_none());

        // list does not rewrite the file
        let on_disk = manager.store.load().unwrap();
        assert_eq!(on_disk["alive"].status, TunnelStatus::Active);

        let stats = manager.stats().unwrap();
        assert_eq!(stats.total_tunnels, 2);
        assert_eq!(stats.active_tunnels, 1);
        assert_eq!(stats.dead_tunnels, 1);

        let removed = manager.cleanup_dead().await.unwrap();
        assert_eq!(removed, vec!["dead".to_string()]);
        let names: Vec<String> = manager.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alive".to_string()]);
    }

    #[test]
    fn test_get_probes_status() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        let mut record = TunnelRecord::new("api", 3000, 8000, "api", "localhost");
        record.pid = Some(std::process::id());
        seed(&manager, &[record]);

        let found = manager.get("api").unwrap().unwrap();
        assert_eq!(found.status, TunnelStatus::Running);
        assert!(manager.get("ghost").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_registry_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let tunnels_file = dir.path().join("tunnels.json");
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(&tunnels_file, "{\"api\": {\"name\": ").unwrap();

        // Config still works
        let mut manager = manager(&dir);
        manager.set_domain("dev.test").unwrap();

        assert!(matches!(manager.list(), Err(RegistryError::CorruptRegistry { .. })));
        assert!(matches!(manager.get("api"), Err(RegistryError::CorruptRegistry { .. })));
        assert!(matches!(
            manager.cleanup_dead().await,
            Err(RegistryError::CorruptRegistry { .. })
        ));

        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_port = service.local_addr().unwrap().port();
        let result = manager.create(CreateTunnel::new("new", local_port)).await;
        assert!(matches!(result, Err(RegistryError::CorruptRegistry { .. })));

        assert_eq!(
            std::fs::read_to_string(&tunnels_file).unwrap(),
            "{\"api\": {\"name\": "
        );
    }

    #[tokio::test]
    async fn test_records_with_naive_timestamps_stay_tracked() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);

        let mut good = TunnelRecord::new("good", 3000, 8000, "good", "localhost");
        good.pid = Some(std::process::id());
        let mut legacy = serde_json::to_value(TunnelRecord::new(
            "legacy", 3001, 8001, "legacy", "localhost",
        ))
        .unwrap();
        legacy["created_at"] = "2024-01-01T12:00:00.123456".into();
        let content = serde_json::json!({
            "good": serde_json::to_value(&good).unwrap(),
            "legacy": legacy,
        });
        std::fs::write(dir.path().join("tunnels.json"), content.to_string()).unwrap();

        let names: Vec<String> = manager.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["good".to_string(), "legacy".to_string()]);

        // A later mutation keeps both records and their reserved ports
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_port = service.local_addr().unwrap().port();
        let result = manager
            .create(CreateTunnel::new("new", local_port).public_port(8000))
            .await;
        assert!(matches!(result, Err(RegistryError::PortUnavailable { port: 8000 })));

        manager.stop("legacy").await.unwrap();
        let on_disk = manager.store.load().unwrap();
        assert_eq!(on_disk.keys().collect::<Vec<_>>(), vec!["good"]);
        assert_eq!(on_disk["good"].pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_start_public_requires_running_proxy() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        let mut record = TunnelRecord::new("api", 3000, 8000, "api", "localhost");
        record.pid = Some(u32::MAX);
        seed(&manager, &[record]);

        assert!(matches!(
            manager.start_public("api", false).await,
            Err(RegistryError::ProxyNotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_public_keeps_provider() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        let mut record = TunnelRecord::new("api", 3000, 8000, "api", "localhost");
        record.pid = Some(std::process::id());
        record.public_provider = Some(PublicProvider::Localtunnel);
        record.public_url_external = Some("https://gone.loca.lt".to_string());
        record.public_pid = Some(u32::MAX);
        seed(&manager, &[record]);

        let updated = manager.stop_public("api").await.unwrap();
        assert_eq!(updated.public_provider, Some(PublicProvider::Localtunnel));
        assert_eq!(updated.public_pid, None);
        assert_eq!(updated.public_url_external, None);
        assert_eq!(manager.store.load().unwrap()["api"], updated);
    }

    #[test]
    fn test_logs() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert_eq!(manager.logs("api", 50).unwrap(), "");

        let logs = dir.path().join("logs");
        std::fs::write(logs.join("api.log"), "a\nb\nc\n").unwrap();
        assert_eq!(manager.logs("api", 2).unwrap(), "b\nc\n");

        std::fs::write(logs.join("api.public.localtunnel.log"), "your url is: https://x.loca.lt\n")
            .unwrap();
        assert_eq!(
            manager.logs("api", 2).unwrap(),
            "b\nc\n\n--- [public: localtunnel] ---\nyour url is: https://x.loca.lt\n"
        );
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.23456), 1.23);
        assert_eq!(round2(0.0), 0.0);
    }
}

//! Public exposure through localtunnel
//!
//! The helper's stdout and stderr go straight to its log file, so it keeps
//! running (and logging) after the launching process exits. The launcher
//! tails that file until the first URL shows up.

use crate::error::{Result, RuntimeError};
use regex_lite::Regex;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Name of the only supported exposure helper
pub const LOCALTUNNEL: &str = "localtunnel";

/// How long to wait for the helper to report its URL
pub const DEFAULT_URL_TIMEOUT: Duration = Duration::from_secs(20);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running exposure helper and the URL it reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicExposure {
    pub pid: u32,
    pub url: String,
}

pub struct ExposureLauncher {
    url_timeout: Duration,
    url_pattern: Regex,
}

impl Default for ExposureLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_URL_TIMEOUT)
    }
}

impl ExposureLauncher {
    pub fn new(url_timeout: Duration) -> Self {
        Self {
            url_timeout,
            url_pattern: Regex::new(r"https?://[^\s]+").expect("static URL pattern"),
        }
    }

    /// Run `<runner> localtunnel --port <port>` and wait for its public URL.
    ///
    /// The log file is truncated first. On timeout the helper is killed.
    pub async fn launch(&self, runner: &Path, port: u16, log_path: &Path) -> Result<PublicExposure> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = File::create(log_path)?;

        let mut command = Command::new(runner);
        command
            .args([LOCALTUNNEL, "--port", &port.to_string()])
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        detach(&mut command);

        let mut child = command.spawn()?;
        let pid = child.id();
        info!("Started {} (pid {}) for port {}", LOCALTUNNEL, pid, port);

        match self.wait_for_url(&mut child, log_path).await {
            Ok(url) => {
                info!("{} reported {}", LOCALTUNNEL, url);
                Ok(PublicExposure { pid, url })
            }
            Err(e) => {
                kill_tree(&mut child);
                Err(e)
            }
        }
    }

    async fn wait_for_url(&self, child: &mut Child, log_path: &Path) -> Result<String> {
        let deadline = Instant::now() + self.url_timeout;
        let mut tail = LogTail::new(log_path.to_path_buf());

        loop {
            for line in tail.read_lines()? {
                debug!("{}: {}", LOCALTUNNEL, line);
                if let Some(m) = self.url_pattern.find(&line) {
                    return Ok(m.as_str().to_string());
                }
            }

            if let Some(status) = child.try_wait()? {
                // Scan once more: the URL may have been written right before exit
                for line in tail.read_lines()? {
                    if let Some(m) = self.url_pattern.find(&line) {
                        warn!("{} exited ({}) after reporting a URL", LOCALTUNNEL, status);
                        return Ok(m.as_str().to_string());
                    }
                }
                return Err(RuntimeError::ExposureExited {
                    log_path: log_path.to_path_buf(),
                    status: status.to_string(),
                });
            }

            if Instant::now() >= deadline {
                return Err(RuntimeError::ExternalUrlTimeout {
                    log_path: log_path.to_path_buf(),
                    timeout_secs: self.url_timeout.as_secs(),
                });
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Incremental reader returning only complete lines
struct LogTail {
    path: PathBuf,
    offset: u64,
    pending: String,
}

impl LogTail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            pending: String::new(),
        }
    }

    fn read_lines(&mut self) -> Result<Vec<String>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        self.offset += bytes.len() as u64;
        self.pending.push_str(&String::from_utf8_lossy(&bytes));

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end().to_string());
        }
        Ok(lines)
    }
}

/// Start `command` as the leader of a new process group, so terminal
/// signals aimed at the caller do not reach it
pub fn detach(command: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

/// Kill the helper and anything it spawned (npx forks node)
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        // The child leads its own process group
        unsafe {
            libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

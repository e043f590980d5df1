//! On-disk layout of the data directory
//!
//! ```text
//! ~/.hooktunnel/
//!   config.json
//!   tunnels.json
//!   tunnels.lock
//!   logs/<name>.log
//!   logs/<name>.public.<provider>.log
//!   tools/node/
//! ```

use crate::error::{RegistryError, Result};
use crate::record::PublicProvider;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory
pub const HOME_ENV: &str = "HOOKTUNNEL_HOME";

const DIR_NAME: &str = ".hooktunnel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$HOOKTUNNEL_HOME` if set, otherwise `~/.hooktunnel`
    pub fn from_env() -> Result<Self> {
        if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(dir));
        }
        let home = dirs::home_dir().ok_or(RegistryError::HomeDirNotFound)?;
        Ok(Self::new(home.join(DIR_NAME)))
    }

    /// Create the root and log directories
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.log_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn tunnels_file(&self) -> PathBuf {
        self.root.join("tunnels.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("tunnels.lock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn proxy_log(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log", name))
    }

    pub fn public_log(&self, name: &str, provider: PublicProvider) -> PathBuf {
        self.log_dir()
            .join(format!("{}.public.{}.log", name, provider))
    }

    /// Install directory for the portable Node.js runtime
    pub fn node_tools_dir(&self) -> PathBuf {
        self.root.join("tools").join("node")
    }
}

//! Node.js distribution identifiers for the host platform

use crate::error::{Result, RuntimeError};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOs {
    Linux,
    Darwin,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeArch {
    X64,
    Arm64,
}

/// OS/CPU pair in the naming scheme of nodejs.org/dist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: NodeOs,
    pub arch: NodeArch,
}

impl NodeOs {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeOs::Linux => "linux",
            NodeOs::Darwin => "darwin",
            NodeOs::Windows => "win",
        }
    }
}

impl NodeArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeArch::X64 => "x64",
            NodeArch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os.as_str(), self.arch.as_str())
    }
}

impl Platform {
    /// Detect the platform this binary runs on
    pub fn detect() -> Result<Self> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Map Rust target identifiers to Node.js ones
    pub fn from_parts(os: &str, arch: &str) -> Result<Self> {
        let unsupported = || RuntimeError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };

        let node_os = match os {
            "linux" => NodeOs::Linux,
            "macos" => NodeOs::Darwin,
            "windows" => NodeOs::Windows,
            _ => return Err(unsupported()),
        };

        let node_arch = match arch {
            "x86_64" => NodeArch::X64,
            "aarch64" => NodeArch::Arm64,
            _ => return Err(unsupported()),
        };

        Ok(Self {
            os: node_os,
            arch: node_arch,
        })
    }

    /// Directory name inside the archive, e.g. `node-v20.11.1-linux-x64`
    pub fn dist_base(&self, version: &str) -> String {
        format!("node-{}-{}", version, self)
    }

    /// Archive file name published for this platform
    pub fn archive_name(&self, version: &str) -> String {
        match self.os {
            NodeOs::Windows => format!("{}.zip", self.dist_base(version)),
            _ => format!("{}.tar.gz", self.dist_base(version)),
        }
    }

    /// Location of `npx` inside an extracted distribution
    pub fn runner_path(&self, extract_dir: &Path) -> PathBuf {
        match self.os {
            NodeOs::Windows => extract_dir.join("npx.cmd"),
            _ => extract_dir.join("bin").join("npx"),
        }
    }
}

/// Name of the runner executable on the current host
pub fn runner_name() -> &'static str {
    if cfg!(windows) {
        "npx.cmd"
    } else {
        "npx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts() {
        let p = Platform::from_parts("linux", "x86_64").unwrap();
        assert_eq!(p.to_string(), "linux-x64");

        let p = Platform::from_parts("macos", "aarch64").unwrap();
        assert_eq!(p.to_string(), "darwin-arm64");

        assert!(matches!(
            Platform::from_parts("freebsd", "x86_64"),
            Err(RuntimeError::UnsupportedPlatform { .. })
        ));
        assert!(Platform::from_parts("linux", "riscv64").is_err());
    }

    #[test]
    fn test_archive_names() {
        let linux = Platform::from_parts("linux", "x86_64").unwrap();
        assert_eq!(linux.archive_name("v20.11.1"), "node-v20.11.1-linux-x64.tar.gz");

        let win = Platform::from_parts("windows", "x86_64").unwrap();
        assert_eq!(win.archive_name("v20.11.1"), "node-v20.11.1-win-x64.zip");
    }

    #[test]
    fn test_runner_path_layout() {
        let root = Path::new("/opt/node");
        let linux = Platform::from_parts("linux", "aarch64").unwrap();
        assert_eq!(linux.runner_path(root), root.join("bin").join("npx"));

        let win = Platform::from_parts("windows", "x86_64").unwrap();
        assert_eq!(win.runner_path(root), root.join("npx.cmd"));
    }
}

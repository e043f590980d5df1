use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("'{runner}' not found. Install Node.js (which ships npm/npx) or run without public exposure")]
    RunnerNotFound { runner: String },

    #[error("Portable Node.js installation was declined")]
    ConsentDeclined,

    #[error("Unsupported platform for portable Node.js: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("Failed to query version index {url}: {reason}")]
    VersionIndex { url: String, reason: String },

    #[error("No LTS release listed in {url}")]
    NoLtsRelease { url: String },

    #[error("Download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Download failed for {url}: HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Checksum manifest has no entry for {file}")]
    ChecksumNotListed { file: String },

    #[error("Failed to extract {archive:?}: {reason}")]
    Extract { archive: PathBuf, reason: String },

    #[error("Node.js installation finished but the runner was not found at {path:?}")]
    InstallIncomplete { path: PathBuf },

    #[error("Exposure helper exited early ({status}). See log: {log_path:?}")]
    ExposureExited { log_path: PathBuf, status: String },

    #[error("Timed out after {timeout_secs}s waiting for a public URL. See log: {log_path:?}")]
    ExternalUrlTimeout { log_path: PathBuf, timeout_secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

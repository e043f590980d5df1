//! Locating or provisioning `npx`
//!
//! Search order: the system `PATH`, then a previously provisioned portable
//! Node.js, then (with consent) a fresh download of the latest LTS release.

use crate::error::{Result, RuntimeError};
use crate::platform::{runner_name, NodeOs, Platform};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default Node.js distribution mirror
pub const NODE_DIST_URL: &str = "https://nodejs.org/dist";

const INDEX_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const CHECKSUM_MANIFEST: &str = "SHASUMS256.txt";

/// Metadata of a provisioned portable Node.js, persisted in the global config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundledNode {
    pub version: String,
    pub os: String,
    pub arch: String,
    /// Extracted distribution directory
    pub root: PathBuf,
    #[serde(alias = "npx_path")]
    pub runner_path: PathBuf,
}

/// Outcome of [`Bootstrapper::ensure_runner`]
#[derive(Debug, Clone)]
pub struct ResolvedRunner {
    pub path: PathBuf,
    /// Set when this call installed a new runtime the caller should persist
    pub provisioned: Option<BundledNode>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    version: String,
    /// `false` for current releases, the codename for LTS ones
    #[serde(default)]
    lts: serde_json::Value,
}

impl IndexEntry {
    fn is_lts(&self) -> bool {
        !matches!(self.lts, serde_json::Value::Bool(false) | serde_json::Value::Null)
    }
}

pub struct Bootstrapper {
    install_dir: PathBuf,
    dist_url: String,
    search_path: Option<OsString>,
    client: reqwest::Client,
}

impl Bootstrapper {
    /// Create a bootstrapper installing into `install_dir` (e.g. `~/.hooktunnel/tools/node`)
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            dist_url: NODE_DIST_URL.to_string(),
            search_path: None,
            client: reqwest::Client::new(),
        }
    }

    /// Use another distribution mirror
    pub fn with_dist_url(mut self, url: impl Into<String>) -> Self {
        self.dist_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Search this `PATH` value instead of the process environment
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Return a usable runner, provisioning one when allowed.
    ///
    /// With `interactive == false` no prompt is shown and a missing runner is
    /// an error.
    pub async fn ensure_runner(
        &self,
        cached: Option<&BundledNode>,
        interactive: bool,
    ) -> Result<ResolvedRunner> {
        if let Some(path) = self.find_on_path() {
            debug!("Using runner from PATH: {:?}", path);
            return Ok(ResolvedRunner {
                path,
                provisioned: None,
            });
        }

        if let Some(bundled) = cached {
            if bundled.runner_path.exists() {
                debug!("Using bundled Node.js {} at {:?}", bundled.version, bundled.runner_path);
                return Ok(ResolvedRunner {
                    path: bundled.runner_path.clone(),
                    provisioned: None,
                });
            }
            warn!(
                "Bundled runner {:?} is missing, ignoring cached install",
                bundled.runner_path
            );
        }

        if !interactive {
            return Err(RuntimeError::RunnerNotFound {
                runner: runner_name().to_string(),
            });
        }

        let question = "Node.js/npm (npx) not found. Download and install a portable version automatically?";
        let accepted = tokio::task::spawn_blocking(move || prompt_yes_no(question, true))
            .await
            .unwrap_or(false);
        if !accepted {
            return Err(RuntimeError::ConsentDeclined);
        }

        let installed = self.provision_runtime().await?;
        Ok(ResolvedRunner {
            path: installed.runner_path.clone(),
            provisioned: Some(installed),
        })
    }

    fn find_on_path(&self) -> Option<PathBuf> {
        let name = runner_name();
        match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().ok()?;
                which::which_in(name, Some(paths), cwd).ok()
            }
            None => which::which(name).ok(),
        }
    }

    /// Install the latest Node.js LTS for the host platform
    pub async fn provision_runtime(&self) -> Result<BundledNode> {
        let platform = Platform::detect()?;
        self.provision_for(platform).await
    }

    /// Install the latest Node.js LTS for `platform`.
    ///
    /// The archive is verified against the release's SHA-256 manifest before
    /// anything is extracted, and the extracted tree only appears under its
    /// final name once extraction has completed. A tree without the runner
    /// is removed, never reused.
    pub async fn provision_for(&self, platform: Platform) -> Result<BundledNode> {
        let version = self.latest_lts().await?;
        info!("Installing portable Node.js {} ({})", version, platform);

        let filename = platform.archive_name(&version);
        let release_url = format!("{}/{}", self.dist_url, version);
        let install_root = self.install_dir.join(&version);
        fs::create_dir_all(&install_root)?;

        let manifest_path = install_root.join(CHECKSUM_MANIFEST);
        let archive_path = install_root.join(&filename);

        self.download(&format!("{}/{}", release_url, CHECKSUM_MANIFEST), &manifest_path)
            .await?;
        let actual = self
            .download(&format!("{}/{}", release_url, filename), &archive_path)
            .await?;

        let manifest = fs::read_to_string(&manifest_path)?;
        let expected = match expected_checksum(&manifest, &filename) {
            Some(expected) => expected,
            None => {
                let _ = fs::remove_file(&archive_path);
                return Err(RuntimeError::ChecksumNotListed { file: filename });
            }
        };
        if !expected.eq_ignore_ascii_case(&actual) {
            let _ = fs::remove_file(&archive_path);
            return Err(RuntimeError::ChecksumMismatch {
                file: filename,
                expected,
                actual,
            });
        }
        debug!("Checksum verified for {}", filename);

        let extract_dir = install_root.join(platform.dist_base(&version));
        let runner_path = platform.runner_path(&extract_dir);
        if runner_path.exists() {
            debug!("{:?} already extracted", extract_dir);
        } else {
            if extract_dir.exists() {
                warn!("Removing incomplete install {:?}", extract_dir);
                fs::remove_dir_all(&extract_dir)?;
            }
            let archive = archive_path.clone();
            let root = install_root.clone();
            let dist_base = platform.dist_base(&version);
            let os = platform.os;
            tokio::task::spawn_blocking(move || extract_atomically(&archive, &root, &dist_base, os))
                .await
                .map_err(|e| RuntimeError::Extract {
                    archive: archive_path.clone(),
                    reason: e.to_string(),
                })??;
        }

        if !runner_path.exists() {
            if let Err(e) = fs::remove_dir_all(&extract_dir) {
                warn!("Failed to remove {:?}: {}", extract_dir, e);
            }
            return Err(RuntimeError::InstallIncomplete { path: runner_path });
        }

        info!("Portable Node.js {} ready at {:?}", version, extract_dir);

        Ok(BundledNode {
            version,
            os: platform.os.as_str().to_string(),
            arch: platform.arch.as_str().to_string(),
            root: extract_dir,
            runner_path,
        })
    }

    /// Newest LTS version from `index.json` (listed newest first)
    async fn latest_lts(&self) -> Result<String> {
        let url = format!("{}/index.json", self.dist_url);
        let index_err = |reason: String| RuntimeError::VersionIndex {
            url: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .timeout(INDEX_TIMEOUT)
            .send()
            .await
            .map_err(|e| index_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(index_err(format!("HTTP {}", response.status().as_u16())));
        }
        let body = response.bytes().await.map_err(|e| index_err(e.to_string()))?;

        let entries: Vec<IndexEntry> =
            serde_json::from_slice(&body).map_err(|e| index_err(e.to_string()))?;

        entries
            .into_iter()
            .find(IndexEntry::is_lts)
            .map(|e| e.version)
            .ok_or(RuntimeError::NoLtsRelease { url })
    }

    /// Stream `url` into `dest`, returning the hex SHA-256 of the body
    async fn download(&self, url: &str, dest: &Path) -> Result<String> {
        debug!("Downloading {} -> {:?}", url, dest);

        let mut response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|source| RuntimeError::Download {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(RuntimeError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut file = fs::File::create(dest)?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| RuntimeError::Download {
                url: url.to_string(),
                source,
            })?
        {
            hasher.update(&chunk);
            file.write_all(&chunk)?;
        }
        file.flush()?;

        Ok(hex::encode(hasher.finalize()))
    }
}

/// Hash listed for `filename` in a `SHASUMS256.txt` manifest
pub fn expected_checksum(manifest: &str, filename: &str) -> Option<String> {
    manifest.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        let name = parts.next()?;
        (name.trim_start_matches('*') == filename).then(|| hash.to_string())
    })
}

/// Unpack into a scratch directory next to the target, then rename into place
fn extract_atomically(archive: &Path, root: &Path, dist_base: &str, os: NodeOs) -> Result<()> {
    let extract_err = |reason: String| RuntimeError::Extract {
        archive: archive.to_path_buf(),
        reason,
    };

    let scratch = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(root)?;

    let file = fs::File::open(archive)?;
    match os {
        NodeOs::Windows => {
            let mut zip = zip::ZipArchive::new(file).map_err(|e| extract_err(e.to_string()))?;
            zip.extract(scratch.path())
                .map_err(|e| extract_err(e.to_string()))?;
        }
        _ => {
            let decoder = flate2::read::GzDecoder::new(file);
            tar::Archive::new(decoder)
                .unpack(scratch.path())
                .map_err(|e| extract_err(e.to_string()))?;
        }
    }

    let unpacked = scratch.path().join(dist_base);
    if !unpacked.is_dir() {
        return Err(extract_err(format!("archive has no top-level {} directory", dist_base)));
    }
    fs::rename(&unpacked, root.join(dist_base))?;

    Ok(())
}

/// Yes/no question on stdin; anything but a terminal answers "no"
pub fn prompt_yes_no(question: &str, default_yes: bool) -> bool {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return false;
    }

    let hint = if default_yes { "Y/n" } else { "y/N" };
    loop {
        print!("{} ({}): ", question, hint);
        let _ = std::io::stdout().flush();

        let mut answer = String::new();
        match stdin.read_line(&mut answer) {
            Ok(0) | Err(_) => return false,
            Ok(_) => {}
        }

        match answer.trim().to_lowercase().as_str() {
            "" => return default_yes,
            "y" | "yes" => return true,
            "n" | "no" => return false,
            _ => println!("Please answer with 'y' or 'n'."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_checksum() {
        let manifest = "\
aaaa  node-v20.11.1-darwin-arm64.tar.gz
bbbb  node-v20.11.1-linux-x64.tar.gz
cccc  node-v20.11.1-linux-x64.tar.xz
";
        assert_eq!(
            expected_checksum(manifest, "node-v20.11.1-linux-x64.tar.gz").as_deref(),
            Some("bbbb")
        );
        assert_eq!(expected_checksum(manifest, "node-v20.11.1-win-x64.zip"), None);
    }

    #[test]
    fn test_index_entry_lts() {
        let entries: Vec<IndexEntry> = serde_json::from_str(
            r#"[{"version":"v21.6.0","lts":false},{"version":"v20.11.1","lts":"Iron"}]"#,
        )
        .unwrap();
        assert!(!entries[0].is_lts());
        assert!(entries[1].is_lts());
    }

    #[test]
    fn test_bundled_node_accepts_legacy_field() {
        let node: BundledNode = serde_json::from_str(
            r#"{"version":"v20.11.1","os":"linux","arch":"x64","root":"/r","npx_path":"/r/bin/npx"}"#,
        )
        .unwrap();
        assert_eq!(node.runner_path, PathBuf::from("/r/bin/npx"));
    }

    #[tokio::test]
    async fn test_cached_runner_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let runner = dir.path().join("npx");
        fs::write(&runner, b"#!/bin/sh\n").unwrap();

        let cached = BundledNode {
            version: "v20.11.1".to_string(),
            os: "linux".to_string(),
            arch: "x64".to_string(),
            root: dir.path().to_path_buf(),
            runner_path: runner.clone(),
        };

        let empty = tempfile::tempdir().unwrap();
        let bootstrapper = Bootstrapper::new(dir.path().join("tools")).with_search_path(empty.path());

        let resolved = bootstrapper.ensure_runner(Some(&cached), false).await.unwrap();
        assert_eq!(resolved.path, runner);
        assert!(resolved.provisioned.is_none());
    }

    #[tokio::test]
    async fn test_missing_runner_non_interactive() {
        let empty = tempfile::tempdir().unwrap();
        let bootstrapper =
            Bootstrapper::new(empty.path().join("tools")).with_search_path(empty.path());

        let result = bootstrapper.ensure_runner(None, false).await;
        assert!(matches!(result, Err(RuntimeError::RunnerNotFound { .. })));
    }
}

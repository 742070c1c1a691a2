//! Worker binary releases: fetching the latest GitHub release, downloading
//! and verifying the binary, and recovering from a corrupted install.
//!
//! On-disk layout under the release root (`~/.localai` by default):
//!
//! ```text
//! bin/local-ai                          the binary, 0755
//! bin/checksums.txt                     checksum list of the last download
//! checksums/checksums-<version>.txt     per-version copy
//! checksums/checksums-latest.txt        copy used for verification
//! metadata/installed-version.json       VersionMetadata
//! ```

pub mod checksum;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use checksum::{verify_checksum, write_atomic};

pub const BINARY_FILE: &str = "local-ai";
const DOWNLOADED_CHECKSUMS: &str = "checksums.txt";
const LATEST_CHECKSUMS: &str = "checksums-latest.txt";
const METADATA_FILE: &str = "installed-version.json";
const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_DOWNLOAD_BASE: &str = "https://github.com";

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("latest release has no tag")]
    MissingVersion,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("no checksum entry for {0}")]
    ChecksumNotFound(String),

    #[error("no saved checksums to verify against")]
    NoSavedChecksums,

    #[error("no installed version recorded")]
    NoInstalledVersion,
}

impl ReleaseError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ReleaseError::Io { path: path.to_path_buf(), source }
    }
}

pub type ReleaseResult<T> = std::result::Result<T, ReleaseError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    #[serde(rename = "tag_name", default)]
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub body: String,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub binary_path: PathBuf,
}

/// Where the installed binary is in its lifecycle.
///
/// `Absent -> Downloading -> Verifying -> Ready`, and `Ready -> Corrupted -> Absent`
/// when a verification at startup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySlot {
    Absent,
    Downloading,
    Verifying,
    Ready,
    Corrupted,
}

pub type ProgressFn<'a> = dyn Fn(f64) + Send + Sync + 'a;

pub struct ReleaseManager {
    owner: String,
    repo: String,
    binary_dir: PathBuf,
    checksums_dir: PathBuf,
    metadata_dir: PathBuf,
    api_base: String,
    download_base: String,
    client: reqwest::Client,
    slot: ArcSwap<BinarySlot>,
}

impl ReleaseManager {
    /// A manager rooted at `~/.localai`.
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        let root = dirs::home_dir().unwrap_or_else(std::env::temp_dir).join(".localai");
        Self::with_root(owner, repo, root)
    }

    pub fn with_root(owner: impl Into<String>, repo: impl Into<String>, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let client = reqwest::Client::builder()
            .user_agent(concat!("inference-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        let manager = Self {
            owner: owner.into(),
            repo: repo.into(),
            binary_dir: root.join("bin"),
            checksums_dir: root.join("checksums"),
            metadata_dir: root.join("metadata"),
            api_base: DEFAULT_API_BASE.to_string(),
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
            client,
            slot: ArcSwap::from_pointee(BinarySlot::Absent),
        };
        if manager.binary_path().exists() {
            manager.set_slot(BinarySlot::Ready);
        }
        manager
    }

    /// Points the API and download requests somewhere other than GitHub.
    pub fn with_base_urls(mut self, api_base: impl Into<String>, download_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.download_base = download_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn binary_path(&self) -> PathBuf {
        self.binary_dir.join(BINARY_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.metadata_dir.join(METADATA_FILE)
    }

    pub fn slot(&self) -> BinarySlot {
        **self.slot.load()
    }

    fn set_slot(&self, next: BinarySlot) {
        let previous = self.slot.swap(Arc::new(next));
        if *previous != next {
            debug!("Binary slot {:?} -> {:?}", *previous, next);
        }
    }

    pub async fn get_latest_release(&self) -> ReleaseResult<Release> {
        let url = format!("{}/repos/{}/{}/releases/latest", self.api_base, self.owner, self.repo);
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ReleaseError::Status { url, status: resp.status().as_u16() });
        }
        let release: Release = resp.json().await?;
        if release.version.is_empty() {
            return Err(ReleaseError::MissingVersion);
        }
        Ok(release)
    }

    /// `local-ai-v<version>-<os>-<arch>` for the host platform.
    pub fn get_binary_name(&self, version: &str) -> String {
        binary_name_for(version, std::env::consts::OS, std::env::consts::ARCH)
    }

    fn download_url(&self, version: &str, file: &str) -> String {
        format!("{}/{}/{}/releases/download/{}/{}", self.download_base, self.owner, self.repo, version, file)
    }

    /// Streams `url` into `dst`, reporting the completed fraction when the
    /// size is known.
    async fn download_file(&self, url: &str, dst: &Path, progress: Option<&ProgressFn<'_>>) -> ReleaseResult<()> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(ReleaseError::Status { url: url.to_string(), status: resp.status().as_u16() });
        }
        let total = resp.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(dst).await.map_err(|e| ReleaseError::io(dst, e))?;
        let mut written: u64 = 0;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(|e| ReleaseError::io(dst, e))?;
            written += chunk.len() as u64;
            if let (Some(report), true) = (progress, total > 0) {
                report(written as f64 / total as f64);
            }
        }
        file.flush().await.map_err(|e| ReleaseError::io(dst, e))?;
        Ok(())
    }

    pub async fn download_release(&self, version: &str, progress: Option<&ProgressFn<'_>>) -> ReleaseResult<()> {
        std::fs::create_dir_all(&self.binary_dir).map_err(|e| ReleaseError::io(&self.binary_dir, e))?;
        let binary_name = self.get_binary_name(version);
        let binary_path = self.binary_path();
        info!("Downloading {} ({})", binary_name, version);

        self.set_slot(BinarySlot::Downloading);
        let result = self.fetch_and_install(version, &binary_name, &binary_path, progress).await;
        match &result {
            Ok(()) => {
                self.set_slot(BinarySlot::Ready);
                info!("Installed {} at {}", version, binary_path.display());
            }
            Err(e) => {
                warn!("Installing {} failed: {}", version, e);
                if binary_path.exists() {
                    std::fs::remove_file(&binary_path).ok();
                }
                self.set_slot(BinarySlot::Absent);
            }
        }
        result
    }

    async fn fetch_and_install(
        &self,
        version: &str,
        binary_name: &str,
        binary_path: &Path,
        progress: Option<&ProgressFn<'_>>,
    ) -> ReleaseResult<()> {
        self.download_file(&self.download_url(version, binary_name), binary_path, progress)
            .await?;

        let checksums_path = self.binary_dir.join(DOWNLOADED_CHECKSUMS);
        let checksums_file = format!("LocalAI-{}-checksums.txt", version);
        self.download_file(&self.download_url(version, &checksums_file), &checksums_path, None)
            .await?;

        self.set_slot(BinarySlot::Verifying);
        verify_checksum(binary_path, &checksums_path, binary_name)?;

        let checksums = std::fs::read(&checksums_path).map_err(|e| ReleaseError::io(&checksums_path, e))?;
        write_atomic(&self.checksums_dir.join(format!("checksums-{}.txt", version)), &checksums)?;
        write_atomic(&self.checksums_dir.join(LATEST_CHECKSUMS), &checksums)?;

        let metadata = VersionMetadata {
            version: version.to_string(),
            installed_at: Utc::now(),
            binary_path: binary_path.to_path_buf(),
        };
        write_atomic(&self.metadata_path(), &serde_json::to_vec_pretty(&metadata)?)?;

        make_executable(binary_path)
    }

    fn read_metadata(&self) -> Option<VersionMetadata> {
        let raw = std::fs::read(self.metadata_path()).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!("Ignoring unreadable version metadata: {}", e);
                None
            }
        }
    }

    fn clear_metadata(&self) {
        let path = self.metadata_path();
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }

    /// The installed version, from the metadata when it describes the current
    /// binary, otherwise from `local-ai --version`.
    pub async fn get_installed_version(&self) -> Option<String> {
        let binary_path = self.binary_path();
        if !binary_path.exists() {
            return None;
        }
        match self.read_metadata() {
            Some(metadata) if metadata.binary_path == binary_path => return Some(metadata.version),
            Some(metadata) => debug!(
                "Metadata describes {}, not {}",
                metadata.binary_path.display(),
                binary_path.display()
            ),
            None => {}
        }

        let output = tokio::process::Command::new(&binary_path).arg("--version").output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }

    /// Whether the latest release differs from what is installed, together
    /// with the latest version.
    pub async fn is_update_available(&self) -> ReleaseResult<(bool, String)> {
        let latest = self.get_latest_release().await?;
        let update = match self.get_installed_version().await {
            Some(installed) => installed != latest.version,
            None => true,
        };
        Ok((update, latest.version))
    }

    pub fn verify_installed_binary(&self) -> ReleaseResult<()> {
        let saved = self.checksums_dir.join(LATEST_CHECKSUMS);
        if !saved.exists() {
            return Err(ReleaseError::NoSavedChecksums);
        }
        let metadata = self.read_metadata().ok_or(ReleaseError::NoInstalledVersion)?;
        verify_checksum(&self.binary_path(), &saved, &self.get_binary_name(&metadata.version))
    }

    /// True when the binary is present and verifies. A binary that fails
    /// verification is removed along with its metadata.
    pub fn is_local_ai_installed(&self) -> bool {
        let binary_path = self.binary_path();
        if !binary_path.exists() {
            self.set_slot(BinarySlot::Absent);
            return false;
        }
        match self.verify_installed_binary() {
            Ok(()) => {
                self.set_slot(BinarySlot::Ready);
                true
            }
            Err(e) => {
                warn!("Installed binary failed verification: {}", e);
                self.set_slot(BinarySlot::Corrupted);
                self.remove_binary();
                self.clear_metadata();
                self.set_slot(BinarySlot::Absent);
                false
            }
        }
    }

    fn remove_binary(&self) {
        let path = self.binary_path();
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }

    /// Removes a binary that does not verify, its metadata, and the
    /// checksum list left by an interrupted download.
    pub fn cleanup_partial_downloads(&self) {
        if self.binary_path().exists() && self.verify_installed_binary().is_err() {
            info!("Removing unverified binary {}", self.binary_path().display());
            self.remove_binary();
            self.clear_metadata();
            self.set_slot(BinarySlot::Absent);
        }
        let leftover = self.binary_dir.join(DOWNLOADED_CHECKSUMS);
        if leftover.exists() {
            std::fs::remove_file(&leftover).ok();
        }
    }
}

fn binary_name_for(version: &str, os: &str, arch: &str) -> String {
    let version = version.strip_prefix('v').unwrap_or(version);
    let os = match os {
        "macos" => "darwin",
        other => other,
    };
    let arch = match arch {
        "aarch64" => "arm64",
        _ => "amd64",
    };
    format!("local-ai-v{}-{}-{}", version, os, arch)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> ReleaseResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|e| ReleaseError::io(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> ReleaseResult<()> {
    Ok(())
}

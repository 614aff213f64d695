//! Installer handoff.
//!
//! The core's responsibility ends when a [`VerifiedPayload`] and its
//! [`InstallManifest`] are passed to an [`InstallerHandoff`]. Unpacking,
//! privilege escalation, file replacement and relaunch belong to the
//! installer.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::UpdateError;
use crate::feed::{DownloadVariant, FeedEntry};

/// File name of the manifest written by [`StagingInstaller`].
pub const MANIFEST_FILE_NAME: &str = "install-manifest.json";

/// A payload that passed trust verification.
///
/// Only the update driver constructs these. The payload file is deleted when
/// the value is dropped unless the installer persists it.
#[derive(Debug)]
pub struct VerifiedPayload {
    file: NamedTempFile,
    sha256: [u8; 32],
    entry: FeedEntry,
    variant: DownloadVariant,
}

impl VerifiedPayload {
    pub(crate) fn new(
        file: NamedTempFile,
        sha256: [u8; 32],
        entry: FeedEntry,
        variant: DownloadVariant,
    ) -> Self {
        Self {
            file,
            sha256,
            entry,
            variant,
        }
    }

    /// Path of the payload on disk.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// SHA-256 of the downloaded bytes.
    pub fn sha256(&self) -> &[u8; 32] {
        &self.sha256
    }

    /// Entry the payload belongs to.
    pub fn entry(&self) -> &FeedEntry {
        &self.entry
    }

    /// Variant that was downloaded.
    pub fn variant(&self) -> &DownloadVariant {
        &self.variant
    }

    /// Move the payload to `dest`, keeping it on disk.
    pub fn persist(self, dest: &Path) -> Result<PathBuf, UpdateError> {
        self.file
            .persist(dest)
            .map_err(|e| UpdateError::Io(e.error))?;
        Ok(dest.to_path_buf())
    }
}

/// Instructions that accompany a payload to the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallManifest {
    /// Version being installed
    pub version: String,
    /// Entry title, if the feed gave one
    pub title: Option<String>,
    /// Application path to relaunch after installing
    pub relaunch_path: Option<PathBuf>,
    /// Whether to relaunch after installing
    pub relaunch: bool,
    /// Installer runs with the updater's install privileges
    #[serde(default)]
    pub inherit_privileges: bool,
    /// Payload was decrypted after verification
    pub decrypted: bool,
    /// Base version when the payload is a delta patch
    pub delta_from: Option<String>,
    /// Hex SHA-256 of the downloaded (pre-decryption) bytes
    pub sha256: String,
    /// Entry is flagged critical
    pub critical: bool,
}

impl InstallManifest {
    /// Whether the payload is a delta patch.
    pub fn is_delta(&self) -> bool {
        self.delta_from.is_some()
    }
}

/// Receives verified payloads.
#[async_trait]
pub trait InstallerHandoff: Send + Sync {
    /// Take ownership of `payload` and begin installation.
    async fn hand_off(
        &self,
        payload: VerifiedPayload,
        manifest: InstallManifest,
    ) -> Result<(), UpdateError>;
}

/// Installer that stages the payload and manifest in a directory for an
/// out-of-process helper to pick up.
#[derive(Debug, Clone)]
pub struct StagingInstaller {
    dir: PathBuf,
}

impl StagingInstaller {
    /// Stage into `dir`, creating it on first handoff.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the staged manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE_NAME)
    }
}

#[async_trait]
impl InstallerHandoff for StagingInstaller {
    async fn hand_off(
        &self,
        payload: VerifiedPayload,
        manifest: InstallManifest,
    ) -> Result<(), UpdateError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let dest = self.dir.join(payload_file_name(payload.variant(), &manifest.version));
        let staged = payload.persist(&dest)?;
        debug!(path = %staged.display(), "Staged payload");

        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| UpdateError::Handoff(e.to_string()))?;
        tokio::fs::write(self.manifest_path(), json).await?;

        info!(
            version = %manifest.version,
            dir = %self.dir.display(),
            "Update staged for installation"
        );
        Ok(())
    }
}

/// Last URL path segment, restricted to a safe character set.
fn payload_file_name(variant: &DownloadVariant, version: &str) -> String {
    let from_url = url::Url::parse(&variant.url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut s| s.next_back().map(str::to_string))
    });

    let name = from_url
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| format!("update-{}.bin", version));

    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // Must not collide with the manifest written beside it
    if name.eq_ignore_ascii_case(MANIFEST_FILE_NAME) {
        format!("payload-{}", name)
    } else {
        name
    }
}

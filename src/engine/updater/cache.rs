//! Bundle Cache
//!
//! Versioned on-disk layout for downloaded bundles:
//!
//! ```text
//! {root}/
//!   manifest.json              active version pointer (see `state`)
//!   versions/
//!     {version}/
//!       artifact               downloaded bytes, as published
//!       entry.json             cache entry metadata
//!       bundle/                unpacked bundle
//!     .tmp-{version}/          in-progress store, never reported
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::archive;
use super::descriptor::{BundleDescriptor, VersionId};
use super::verify::BundleVerifier;
use crate::engine::error::{Result, UpdateError};

const ARTIFACT_FILE: &str = "artifact";
const ENTRY_FILE: &str = "entry.json";
const BUNDLE_DIR: &str = "bundle";
const TEMP_PREFIX: &str = ".tmp-";

/// A stored bundle version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version_id: VersionId,
    pub package_id: String,
    pub bundle_id: String,
    /// Version directory; filled in when the entry is loaded
    #[serde(skip)]
    pub local_path: PathBuf,
    /// Entrypoint relative to the unpacked bundle directory
    pub entrypoint: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub downloaded_at: DateTime<Utc>,
    pub verified: bool,
}

impl CacheEntry {
    pub fn artifact_path(&self) -> PathBuf {
        self.local_path.join(ARTIFACT_FILE)
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.local_path.join(BUNDLE_DIR)
    }

    /// Absolute path of the file the execution engine should load
    pub fn bundle_path(&self) -> PathBuf {
        self.bundle_dir().join(&self.entrypoint)
    }
}

/// How many versions survive eviction. Pinned versions (active, previous)
/// always survive; the newest remaining entries fill up to `max_versions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_versions: usize,
}

impl Default for RetentionPolicy {
    /// Current + previous
    fn default() -> Self {
        Self { max_versions: 2 }
    }
}

/// Local bundle store keyed by version id
#[derive(Debug, Clone)]
pub struct BundleCache {
    root: PathBuf,
    /// Optional quota on total cache size
    max_bytes: Option<u64>,
}

impl BundleCache {
    /// Open (creating if needed) a cache rooted at `root` and purge any
    /// half-written versions left by an interrupted store.
    pub fn open(root: &Path) -> Result<Self> {
        let cache = Self {
            root: root.to_path_buf(),
            max_bytes: None,
        };
        fs::create_dir_all(cache.versions_dir())?;
        cache.cleanup_temp()?;
        Ok(cache)
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn version_path(&self, version: &VersionId) -> PathBuf {
        self.versions_dir().join(version.as_str())
    }

    fn temp_version_path(&self, version: &VersionId) -> PathBuf {
        self.versions_dir()
            .join(format!("{}{}", TEMP_PREFIX, version.as_str()))
    }

    /// Persist a downloaded bundle. A verified entry with the same checksum is
    /// returned as-is; nothing is rewritten.
    pub fn store(&self, descriptor: &BundleDescriptor, bytes: &[u8]) -> Result<CacheEntry> {
        let version = &descriptor.version_id;

        if let Some(existing) = self.get(version) {
            if existing.verified && existing.checksum.eq_ignore_ascii_case(&descriptor.checksum) {
                debug!(version = %version, "bundle already cached");
                return Ok(existing);
            }
        }

        BundleVerifier::verify_bytes(descriptor, bytes)?;
        self.check_quota(version, bytes.len() as u64)?;

        let temp = self.temp_version_path(version);
        if temp.exists() {
            fs::remove_dir_all(&temp)?;
        }

        let entry = match self.write_temp(descriptor, bytes, &temp) {
            Ok(entry) => entry,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&temp) {
                    warn!(path = %temp.display(), error = %cleanup, "failed to remove partial bundle");
                }
                return Err(e);
            }
        };

        let final_path = self.version_path(version);
        if final_path.exists() {
            fs::remove_dir_all(&final_path)?;
        }
        fs::rename(&temp, &final_path)?;

        info!(version = %version, size = bytes.len(), "bundle stored");
        Ok(CacheEntry {
            local_path: final_path,
            ..entry
        })
    }

    fn write_temp(&self, descriptor: &BundleDescriptor, bytes: &[u8], temp: &Path) -> Result<CacheEntry> {
        fs::create_dir_all(temp)?;

        let artifact = temp.join(ARTIFACT_FILE);
        let mut file = File::create(&artifact)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        // What landed on disk must match, not just what came off the wire
        BundleVerifier::verify_file(descriptor, &artifact)?;

        let entrypoint = archive::unpack(bytes, &temp.join(BUNDLE_DIR))?;

        let entry = CacheEntry {
            version_id: descriptor.version_id.clone(),
            package_id: descriptor.package_id.clone(),
            bundle_id: descriptor.bundle_id.clone(),
            local_path: temp.to_path_buf(),
            entrypoint,
            checksum: descriptor.checksum.to_lowercase(),
            size: bytes.len() as u64,
            downloaded_at: Utc::now(),
            verified: true,
        };

        // entry.json is the last file written; its presence marks a complete store
        let entry_tmp = temp.join("entry.json.tmp");
        let mut file = File::create(&entry_tmp)?;
        file.write_all(&serde_json::to_vec_pretty(&entry)?)?;
        file.sync_all()?;
        fs::rename(&entry_tmp, temp.join(ENTRY_FILE))?;

        Ok(entry)
    }

    fn check_quota(&self, version: &VersionId, incoming: u64) -> Result<()> {
        let Some(max) = self.max_bytes else {
            return Ok(());
        };
        let replaced = dir_size(&self.version_path(version)).unwrap_or(0);
        let used = self.usage_bytes()?.saturating_sub(replaced);
        // artifact plus unpacked copy
        let needed = incoming.saturating_mul(2);
        if used.saturating_add(needed) > max {
            return Err(UpdateError::InsufficientSpace(format!(
                "need {} bytes, {} of {} in use",
                needed, used, max
            )));
        }
        Ok(())
    }

    /// Look up a stored version. Entries with missing files are treated as
    /// corrupt and removed.
    pub fn get(&self, version: &VersionId) -> Option<CacheEntry> {
        let path = self.version_path(version);
        if !path.is_dir() {
            return None;
        }

        match Self::load_entry(&path) {
            Ok(entry) if entry.artifact_path().is_file() && entry.bundle_path().is_file() => Some(entry),
            Ok(_) => {
                warn!(version = %version, "cached bundle is incomplete, removing");
                self.discard(&path);
                None
            }
            Err(e) => {
                warn!(version = %version, error = %e, "unreadable cache entry, removing");
                self.discard(&path);
                None
            }
        }
    }

    fn load_entry(path: &Path) -> Result<CacheEntry> {
        let content = fs::read(path.join(ENTRY_FILE))?;
        let mut entry: CacheEntry = serde_json::from_slice(&content)?;
        entry.local_path = path.to_path_buf();
        Ok(entry)
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = fs::remove_dir_all(path) {
            warn!(path = %path.display(), error = %e, "failed to remove cache entry");
        }
    }

    /// Re-hash the stored artifact
    pub fn verify_integrity(&self, entry: &CacheEntry) -> Result<()> {
        let actual = BundleVerifier::calculate_sha256(&entry.artifact_path())?;
        if !actual.eq_ignore_ascii_case(&entry.checksum) {
            return Err(UpdateError::ChecksumMismatch {
                version: entry.version_id.to_string(),
                expected: entry.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// All stored versions, oldest first
    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(self.versions_dir())? {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) || !path.is_dir() {
                continue;
            }
            let Ok(version) = VersionId::new(name) else {
                continue;
            };
            if let Some(entry) = self.get(&version) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.downloaded_at);
        Ok(entries)
    }

    pub fn remove(&self, version: &VersionId) -> Result<()> {
        let path = self.version_path(version);
        if path.exists() {
            fs::remove_dir_all(&path)?;
            info!(version = %version, "bundle removed from cache");
        }
        Ok(())
    }

    /// Remove everything beyond the retention policy. Returns the evicted versions.
    pub fn evict(&self, policy: &RetentionPolicy, pinned: &[&VersionId]) -> Result<Vec<VersionId>> {
        let mut entries = self.list()?;
        entries.reverse(); // newest first

        let mut kept = entries
            .iter()
            .filter(|e| pinned.contains(&&e.version_id))
            .count();
        let mut evicted = Vec::new();

        for entry in entries {
            if pinned.contains(&&entry.version_id) {
                continue;
            }
            if kept < policy.max_versions {
                kept += 1;
                continue;
            }
            self.remove(&entry.version_id)?;
            evicted.push(entry.version_id);
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted cached bundles");
        }
        Ok(evicted)
    }

    /// Bytes used by all stored versions
    pub fn usage_bytes(&self) -> Result<u64> {
        Ok(dir_size(&self.versions_dir())?)
    }

    /// Remove half-written versions
    pub fn cleanup_temp(&self) -> Result<()> {
        for entry in fs::read_dir(self.versions_dir())? {
            let path = entry?.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(TEMP_PREFIX));
            if is_temp {
                debug!(path = %path.display(), "removing interrupted bundle store");
                fs::remove_dir_all(&path)?;
            }
        }
        Ok(())
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

//! Update State Machine
//!
//! The update cycle phases and the persisted active version pointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use super::descriptor::VersionId;
use crate::engine::error::{Result, UpdateError};

/// Phase of the (single) update cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    /// No update in progress
    #[default]
    Idle,
    /// Fetching package metadata
    Checking,
    /// Downloading the bundle artifact
    Downloading,
    /// Storing and verifying the artifact
    Verifying,
    /// Flipping the active pointer
    Activating,
    /// Cycle failed; returns to idle
    Failed,
}

impl UpdatePhase {
    /// Idle → Checking → Downloading → Verifying → Activating → Idle, with
    /// Failed reachable from the three I/O phases. Checking may jump to
    /// Verifying when the bundle is already cached, and a cached copy that
    /// fails verification goes back to Downloading. Any phase may return to
    /// Idle (no update, activation done, cancellation).
    pub fn can_transition_to(self, next: UpdatePhase) -> bool {
        use UpdatePhase::*;
        matches!(
            (self, next),
            (Idle, Checking)
                | (Checking, Downloading)
                | (Checking, Verifying)
                | (Downloading, Verifying)
                | (Verifying, Activating)
                | (Verifying, Downloading)
                | (Checking, Failed)
                | (Downloading, Failed)
                | (Verifying, Failed)
                | (_, Idle)
        ) && self != next
    }

    pub fn is_idle(self) -> bool {
        self == UpdatePhase::Idle
    }
}

/// Which cached bundle is live. Persisted as `manifest.json` in the cache root
/// and only written by the update coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivePointer {
    /// `None` means the bundle embedded in the application binary
    pub active: Option<VersionId>,
    /// Last known-good version before `active`
    pub previous: Option<VersionId>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    /// Launches of `active` not yet confirmed by the host
    #[serde(default)]
    pub launch_attempts: u32,
    /// Versions abandoned by the launch guard; checks never reinstall them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<VersionId>,
}

impl ActivePointer {
    /// Load from disk, or start from the embedded bundle if absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| UpdateError::Manifest(format!("{}: {}", path.display(), e)))
    }

    /// Save to disk atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;

        // Write to temp file first, then rename (atomic)
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Make `version` active, keeping the outgoing one as previous
    pub fn activate(&mut self, version: VersionId) {
        if self.active.as_ref() == Some(&version) {
            return;
        }
        self.failed.retain(|f| f != &version);
        if let Some(outgoing) = self.active.replace(version) {
            self.previous = Some(outgoing);
        }
        self.updated_at = Some(Utc::now());
        self.launch_attempts = 0;
    }

    /// Swap back to the previous version. Returns the version now active.
    pub fn rollback(&mut self) -> Option<&VersionId> {
        let previous = self.previous.take()?;
        self.active = Some(previous);
        self.updated_at = Some(Utc::now());
        self.launch_attempts = 0;
        self.active.as_ref()
    }

    /// Abandon the active version for the previous one, or for the embedded
    /// bundle when there is none. The abandoned version is not kept.
    pub fn fall_back(&mut self) -> Option<&VersionId> {
        self.active = self.previous.take();
        self.updated_at = Some(Utc::now());
        self.launch_attempts = 0;
        self.active.as_ref()
    }

    /// Like [`fall_back`](Self::fall_back), and remember the abandoned
    /// version as bad. Returns it.
    pub fn abandon(&mut self) -> Option<VersionId> {
        let bad = self.active.take()?;
        if !self.failed.contains(&bad) {
            self.failed.push(bad.clone());
        }
        self.active = self.previous.take();
        self.updated_at = Some(Utc::now());
        self.launch_attempts = 0;
        Some(bad)
    }

    pub fn is_failed(&self, version: &VersionId) -> bool {
        self.failed.contains(version)
    }

    /// Back to the embedded bundle
    pub fn reset(&mut self) {
        if let Some(outgoing) = self.active.take() {
            self.previous = Some(outgoing);
        }
        self.updated_at = Some(Utc::now());
        self.launch_attempts = 0;
    }

    pub fn record_check(&mut self) {
        self.last_check = Some(Utc::now());
    }

    /// Count a launch of the active bundle. Returns the unconfirmed count.
    pub fn record_launch(&mut self) -> u32 {
        self.launch_attempts += 1;
        self.launch_attempts
    }

    pub fn confirm_launch(&mut self) {
        self.launch_attempts = 0;
    }

    pub fn should_rollback(&self, max_failed_launches: u32) -> bool {
        self.active.is_some() && max_failed_launches > 0 && self.launch_attempts >= max_failed_launches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn v(s: &str) -> VersionId {
        VersionId::new(s).unwrap()
    }

    #[test]
    fn test_phase_transitions() {
        use UpdatePhase::*;
        assert!(Idle.can_transition_to(Checking));
        assert!(Checking.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(Activating));
        assert!(Activating.can_transition_to(Idle));
        assert!(Downloading.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Downloading));
        assert!(!Activating.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Checking));
        assert!(!Idle.can_transition_to(Idle));
    }

    #[test]
    fn test_pointer_default_is_embedded() {
        let pointer = ActivePointer::default();
        assert!(pointer.active.is_none());
        assert!(pointer.previous.is_none());
    }

    #[test]
    fn test_activate_and_rollback() {
        let mut pointer = ActivePointer::default();
        pointer.activate(v("v1"));
        pointer.activate(v("v2"));
        assert_eq!(pointer.active, Some(v("v2")));
        assert_eq!(pointer.previous, Some(v("v1")));

        // re-activating the same version keeps previous intact
        pointer.activate(v("v2"));
        assert_eq!(pointer.previous, Some(v("v1")));

        assert_eq!(pointer.rollback(), Some(&v("v1")));
        assert!(pointer.previous.is_none());
        assert!(pointer.rollback().is_none());
        assert_eq!(pointer.active, Some(v("v1")));
    }

    #[test]
    fn test_fall_back_drops_active() {
        let mut pointer = ActivePointer::default();
        pointer.activate(v("v1"));
        pointer.activate(v("v2"));
        assert_eq!(pointer.fall_back(), Some(&v("v1")));
        assert!(pointer.previous.is_none());
        assert!(pointer.fall_back().is_none());
        assert!(pointer.active.is_none());
    }

    #[test]
    fn test_abandon_remembers_bad_version() {
        let mut pointer = ActivePointer::default();
        pointer.activate(v("v1"));
        pointer.activate(v("v2"));
        pointer.record_launch();

        assert_eq!(pointer.abandon(), Some(v("v2")));
        assert_eq!(pointer.active, Some(v("v1")));
        assert!(pointer.previous.is_none());
        assert_eq!(pointer.launch_attempts, 0);
        assert!(pointer.is_failed(&v("v2")));

        // an explicit activation clears the mark
        pointer.activate(v("v2"));
        assert!(!pointer.is_failed(&v("v2")));

        let mut empty = ActivePointer::default();
        assert!(empty.abandon().is_none());
        assert!(empty.failed.is_empty());
    }

    #[test]
    fn test_reset_keeps_previous() {
        let mut pointer = ActivePointer::default();
        pointer.activate(v("v1"));
        pointer.reset();
        assert!(pointer.active.is_none());
        assert_eq!(pointer.previous, Some(v("v1")));
    }

    #[test]
    fn test_pointer_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let mut pointer = ActivePointer::default();
        pointer.activate(v("1.0.0"));
        pointer.record_launch();
        pointer.save(&path).unwrap();

        let loaded = ActivePointer::load(&path).unwrap();
        assert_eq!(loaded, pointer);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_manifest_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(ActivePointer::load(&path), Err(UpdateError::Manifest(_))));
    }

    #[test]
    fn test_launch_guard() {
        let mut pointer = ActivePointer::default();
        assert!(!pointer.should_rollback(3));

        pointer.activate(v("v2"));
        assert_eq!(pointer.record_launch(), 1);
        assert_eq!(pointer.record_launch(), 2);
        assert!(!pointer.should_rollback(3));
        assert_eq!(pointer.record_launch(), 3);
        assert!(pointer.should_rollback(3));

        pointer.confirm_launch();
        assert!(!pointer.should_rollback(3));
    }
}

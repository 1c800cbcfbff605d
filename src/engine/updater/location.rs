//! Storage Location
//!
//! Where package metadata, bundles, session metadata and assets are fetched from.

use serde::{Deserialize, Serialize};

use crate::engine::error::{Result, UpdateError};

/// Remote storage root plus an optional suffix appended to every URL
/// (typically a SAS token query string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    base_url: String,
    suffix: String,
}

impl StorageLocation {
    pub fn new(base_url: &str, suffix: Option<&str>) -> Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(UpdateError::InvalidLocation("base url is empty".to_string()));
        }
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(UpdateError::InvalidLocation(format!(
                "unsupported scheme in {}",
                trimmed
            )));
        }
        Ok(Self {
            base_url: trimmed.to_string(),
            suffix: suffix.unwrap_or_default().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// `{base}/{path}{suffix}`
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}{}", self.base_url, path.trim_start_matches('/'), self.suffix)
    }

    /// Path of a package's metadata document, relative to the base url
    pub fn package_metadata_path(package_id: &str) -> String {
        format!("packages/{}/metadata.json", package_id)
    }

    pub fn session_metadata_path(session_id: &str) -> String {
        format!("sessions/{}/metadata.json", session_id)
    }

    pub fn package_metadata_url(&self, package_id: &str) -> String {
        self.url_for(&Self::package_metadata_path(package_id))
    }

    pub fn bundle_url(&self, package_id: &str, bundle_id: &str) -> String {
        self.url_for(&format!("packages/{}/{}", package_id, bundle_id))
    }

    pub fn session_metadata_url(&self, session_id: &str) -> String {
        self.url_for(&Self::session_metadata_path(session_id))
    }

    /// Remote URL of a bundle asset, as resolved by an installed bundle
    pub fn asset_url(&self, hash: &str, name: &str, asset_type: &str) -> String {
        self.url_for(&format!("assets/{}/{}.{}", hash, name, asset_type))
    }
}

//! Bundle Metadata
//!
//! Package metadata as published to storage, and the descriptor of the one
//! bundle this device should run.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::location::StorageLocation;
use crate::engine::error::{Result, UpdateError};

/// Identifier of a bundle's content. Also used as its cache directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    pub fn new(id: &str) -> Result<Self> {
        let id = id.trim();
        let unsafe_component = id.is_empty()
            || id == "."
            || id == ".."
            || id.starts_with(".tmp-")
            || id.contains(['/', '\\', '\0']);
        if unsafe_component {
            return Err(UpdateError::InvalidMetadata(format!(
                "invalid version id: {:?}",
                id
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dotted numeric form (`1.2.0`, `v3`), trailing zeros dropped
    fn numeric_parts(&self) -> Option<Vec<u64>> {
        let mut parts: Vec<u64> = self
            .0
            .trim_start_matches('v')
            .split('.')
            .map(|p| p.parse().ok())
            .collect::<Option<_>>()?;
        while parts.len() > 1 && parts.last() == Some(&0) {
            parts.pop();
        }
        Some(parts)
    }

    /// Numeric versions compare numerically; any other id is newer when it differs.
    pub fn is_newer_than(&self, other: &VersionId) -> bool {
        match (self.numeric_parts(), other.numeric_parts()) {
            (Some(a), Some(b)) => a.cmp(&b) == Ordering::Greater,
            _ => self != other,
        }
    }
}

impl TryFrom<String> for VersionId {
    type Error = UpdateError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<VersionId> for String {
    fn from(v: VersionId) -> Self {
        v.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(any(target_os = "ios", target_os = "macos")) {
            Self::Ios
        } else {
            Self::Android
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Android => f.write_str("android"),
            Self::Ios => f.write_str("ios"),
        }
    }
}

/// Development bundles keep dev-mode checks and warnings, production ones are minified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleFlavor {
    Dev,
    #[default]
    Prod,
}

/// Which bundle of a package to install on request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleSelector {
    /// The bundle of this flavor for the device platform
    Flavor(BundleFlavor),
    /// A bundle by id, whatever its flavor
    Id(String),
}

/// `packages/{id}/metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub id: String,
    pub bundles: Vec<BundleMetadata>,
    /// Hex ed25519 signature over this document with an empty `signature`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub id: String,
    pub platform: Platform,
    #[serde(default)]
    pub dev: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Overrides the default `packages/{package}/{bundle}` location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl PackageMetadata {
    /// Pick the bundle for `platform`. When the package carries more than one
    /// bundle for the platform, `flavor` decides.
    pub fn select_bundle(&self, platform: Platform, flavor: BundleFlavor) -> Result<&BundleMetadata> {
        let candidates: Vec<&BundleMetadata> =
            self.bundles.iter().filter(|b| b.platform == platform).collect();

        match candidates.as_slice() {
            [] => Err(UpdateError::NotFound(format!(
                "no bundle for {} platform in package {}",
                platform, self.id
            ))),
            [only] => Ok(*only),
            many => {
                let want_dev = flavor == BundleFlavor::Dev;
                many.iter()
                    .copied()
                    .find(|b| b.dev == want_dev)
                    .ok_or_else(|| {
                        UpdateError::NotFound(format!(
                            "no {:?} bundle for {} platform in package {}",
                            flavor, platform, self.id
                        ))
                    })
            }
        }
    }

    /// Resolve an explicit request. Unlike [`select_bundle`](Self::select_bundle)
    /// a flavor must match exactly, even when the platform has a single bundle.
    pub fn find_bundle(&self, platform: Platform, selector: &BundleSelector) -> Result<&BundleMetadata> {
        let found = match selector {
            BundleSelector::Flavor(flavor) => {
                let want_dev = *flavor == BundleFlavor::Dev;
                self.bundles
                    .iter()
                    .find(|b| b.platform == platform && b.dev == want_dev)
            }
            BundleSelector::Id(id) => self.bundles.iter().find(|b| b.id == *id),
        };
        found.ok_or_else(|| {
            UpdateError::NotFound(format!("no bundle matching {:?} in package {}", selector, self.id))
        })
    }
}

/// Live session metadata, `sessions/{id}/metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Dev server host the engine should connect to (`host:port`)
    pub host: String,
}

/// Everything needed to download and verify one bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDescriptor {
    pub version_id: VersionId,
    pub package_id: String,
    pub bundle_id: String,
    pub download_url: String,
    /// Lowercase hex sha256
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl BundleDescriptor {
    pub fn from_metadata(
        location: &StorageLocation,
        package_id: &str,
        bundle: &BundleMetadata,
    ) -> Result<Self> {
        let checksum = bundle.sha256.trim().to_lowercase();
        if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(UpdateError::InvalidMetadata(format!(
                "bundle {} has a malformed sha256",
                bundle.id
            )));
        }

        let version_id = VersionId::new(bundle.version.as_deref().unwrap_or(&bundle.id))?;
        let download_url = bundle
            .url
            .clone()
            .unwrap_or_else(|| location.bundle_url(package_id, &bundle.id));

        Ok(Self {
            version_id,
            package_id: package_id.to_string(),
            bundle_id: bundle.id.clone(),
            download_url,
            checksum,
            size: bundle.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn bundle(id: &str, platform: Platform, dev: bool) -> BundleMetadata {
        BundleMetadata {
            id: id.to_string(),
            platform,
            dev,
            version: None,
            sha256: SHA.to_string(),
            size: Some(11),
            url: None,
        }
    }

    #[test]
    fn test_version_comparison() {
        let v = |s: &str| VersionId::new(s).unwrap();
        assert!(v("v2").is_newer_than(&v("v1")));
        assert!(v("1.10.0").is_newer_than(&v("1.9.3")));
        assert!(!v("1.0").is_newer_than(&v("1.0.0")));
        assert!(!v("v1").is_newer_than(&v("v2")));
        assert!(!v("v1").is_newer_than(&v("v1")));
        // opaque ids: any different id is an update
        assert!(v("a1b2").is_newer_than(&v("c3d4")));
        assert!(!v("a1b2").is_newer_than(&v("a1b2")));
    }

    #[test]
    fn test_version_id_rejects_path_components() {
        assert!(VersionId::new("../etc").is_err());
        assert!(VersionId::new("a/b").is_err());
        assert!(VersionId::new("..").is_err());
        assert!(VersionId::new(".tmp-v1").is_err());
        assert!(VersionId::new("").is_err());
        assert!(serde_json::from_str::<VersionId>("\"x/y\"").is_err());
    }

    #[test]
    fn test_select_single_platform_bundle() {
        let meta = PackageMetadata {
            id: "pkg".to_string(),
            bundles: vec![bundle("a", Platform::Android, true), bundle("i", Platform::Ios, false)],
            signature: None,
        };
        let chosen = meta.select_bundle(Platform::Android, BundleFlavor::Prod).unwrap();
        assert_eq!(chosen.id, "a");
    }

    #[test]
    fn test_select_by_flavor() {
        let meta = PackageMetadata {
            id: "pkg".to_string(),
            bundles: vec![bundle("dev", Platform::Ios, true), bundle("prod", Platform::Ios, false)],
            signature: None,
        };
        assert_eq!(meta.select_bundle(Platform::Ios, BundleFlavor::Dev).unwrap().id, "dev");
        assert_eq!(meta.select_bundle(Platform::Ios, BundleFlavor::Prod).unwrap().id, "prod");
        assert!(matches!(
            meta.select_bundle(Platform::Android, BundleFlavor::Prod),
            Err(UpdateError::NotFound(_))
        ));
    }

    #[test]
    fn test_find_bundle_on_request() {
        let meta = PackageMetadata {
            id: "pkg".to_string(),
            bundles: vec![bundle("dev", Platform::Android, true), bundle("ios", Platform::Ios, false)],
            signature: None,
        };
        let by_id = meta.find_bundle(Platform::Android, &BundleSelector::Id("ios".into())).unwrap();
        assert_eq!(by_id.id, "ios");
        let dev = meta
            .find_bundle(Platform::Android, &BundleSelector::Flavor(BundleFlavor::Dev))
            .unwrap();
        assert_eq!(dev.id, "dev");

        // the only android bundle is dev, so no prod one is found
        assert!(matches!(
            meta.find_bundle(Platform::Android, &BundleSelector::Flavor(BundleFlavor::Prod)),
            Err(UpdateError::NotFound(_))
        ));
        assert!(meta.find_bundle(Platform::Ios, &BundleSelector::Id("nope".into())).is_err());
    }

    #[test]
    fn test_descriptor_from_metadata() {
        let loc = StorageLocation::new("https://host/demo/", Some("?sig=1")).unwrap();
        let mut b = bundle("b-123", Platform::Android, false);
        b.version = Some("2.0.1".to_string());
        let d = BundleDescriptor::from_metadata(&loc, "pkg", &b).unwrap();
        assert_eq!(d.version_id.as_str(), "2.0.1");
        assert_eq!(d.download_url, "https://host/demo/packages/pkg/b-123?sig=1");
        assert_eq!(d.checksum, SHA);

        b.version = None;
        let d = BundleDescriptor::from_metadata(&loc, "pkg", &b).unwrap();
        assert_eq!(d.version_id.as_str(), "b-123");

        b.sha256 = "nothex".to_string();
        assert!(matches!(
            BundleDescriptor::from_metadata(&loc, "pkg", &b),
            Err(UpdateError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_metadata_parses_original_shape() {
        let json = r#"{
            "id": "pkg",
            "bundles": [
                {"id": "b1", "platform": "android", "dev": true, "sha256": "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9"}
            ]
        }"#;
        let meta: PackageMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.bundles.len(), 1);
        assert!(meta.bundles[0].dev);
        assert!(meta.signature.is_none());
    }
}

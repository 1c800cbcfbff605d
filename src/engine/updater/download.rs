//! Storage Client
//!
//! Fetches package metadata and bundle artifacts over HTTP with progress tracking.

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::descriptor::{
    BundleDescriptor, BundleFlavor, BundleSelector, PackageMetadata, Platform, SessionMetadata,
};
use super::location::StorageLocation;
use super::verify::BundleVerifier;
use crate::engine::error::{Result, UpdateError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Where bundles come from. Implemented over HTTP by [`StorageClient`].
pub trait BundleSource: Send + Sync {
    fn location(&self) -> &StorageLocation;

    /// Resolve the descriptor of the bundle this device should run
    fn fetch_metadata(&self) -> impl Future<Output = Result<BundleDescriptor>> + Send;

    /// Metadata of any package at this location
    fn fetch_package(&self, package_id: &str) -> impl Future<Output = Result<PackageMetadata>> + Send;

    /// Resolve an explicitly requested bundle of any package
    fn fetch_metadata_for(
        &self,
        package_id: &str,
        selector: &BundleSelector,
    ) -> impl Future<Output = Result<BundleDescriptor>> + Send;

    /// Download the artifact. The returned bytes have been checked against the
    /// descriptor's checksum; a mismatch fails the attempt.
    fn fetch_artifact<P>(
        &self,
        descriptor: &BundleDescriptor,
        on_progress: P,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send
    where
        P: FnMut(u64, Option<u64>) + Send;

    /// Resolve the dev server host of a live session
    fn fetch_session(&self, session_id: &str) -> impl Future<Output = Result<SessionMetadata>> + Send;
}

/// HTTP client for a LiveBundle storage location
pub struct StorageClient {
    client: reqwest::Client,
    location: StorageLocation,
    package_id: String,
    platform: Platform,
    flavor: BundleFlavor,
    verifier: BundleVerifier,
}

impl StorageClient {
    pub fn new(location: StorageLocation, package_id: &str) -> Result<Self> {
        if package_id.trim().is_empty() {
            return Err(UpdateError::InvalidLocation("package id is empty".to_string()));
        }
        Ok(Self {
            client: Self::build_client(DEFAULT_CONNECT_TIMEOUT)?,
            location,
            package_id: package_id.trim().to_string(),
            platform: Platform::current(),
            flavor: BundleFlavor::default(),
            verifier: BundleVerifier::new(),
        })
    }

    fn build_client(connect_timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(concat!("LiveBundle-Updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .build()
            .map_err(UpdateError::from)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Self::build_client(timeout)?;
        Ok(self)
    }

    pub fn with_selection(mut self, platform: Platform, flavor: BundleFlavor) -> Self {
        self.platform = platform;
        self.flavor = flavor;
        self
    }

    pub fn with_verifier(mut self, verifier: BundleVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    /// GET a JSON document. Errors name the path only; the suffix may carry a token.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "fetching metadata");
        let response = self.client.get(self.location.url_for(path)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(UpdateError::NotFound(path.to_string())),
            status if !status.is_success() => {
                Err(UpdateError::Network(format!("HTTP {} for {}", status, path)))
            }
            _ => {
                let body = response.bytes().await?;
                serde_json::from_slice(&body)
                    .map_err(|e| UpdateError::InvalidMetadata(format!("{}: {}", path, e)))
            }
        }
    }
}

impl BundleSource for StorageClient {
    fn location(&self) -> &StorageLocation {
        &self.location
    }

    async fn fetch_metadata(&self) -> Result<BundleDescriptor> {
        let metadata = self.fetch_package(&self.package_id).await?;
        let bundle = metadata.select_bundle(self.platform, self.flavor)?;
        BundleDescriptor::from_metadata(&self.location, &self.package_id, bundle)
    }

    /// `packages/{package}/metadata.json`, signature-checked when a key is configured
    async fn fetch_package(&self, package_id: &str) -> Result<PackageMetadata> {
        let package_id = package_id.trim();
        if package_id.is_empty() || package_id.contains(['/', '?', '#']) {
            return Err(UpdateError::InvalidLocation(format!(
                "invalid package id: {:?}",
                package_id
            )));
        }
        let path = StorageLocation::package_metadata_path(package_id);
        let metadata: PackageMetadata = self.get_json(&path).await?;
        self.verifier.verify_metadata_signature(&metadata)?;
        Ok(metadata)
    }

    async fn fetch_metadata_for(
        &self,
        package_id: &str,
        selector: &BundleSelector,
    ) -> Result<BundleDescriptor> {
        let metadata = self.fetch_package(package_id).await?;
        let bundle = metadata.find_bundle(self.platform, selector)?;
        BundleDescriptor::from_metadata(&self.location, package_id.trim(), bundle)
    }

    async fn fetch_artifact<P>(&self, descriptor: &BundleDescriptor, mut on_progress: P) -> Result<Vec<u8>>
    where
        P: FnMut(u64, Option<u64>) + Send,
    {
        let response = self.client.get(&descriptor.download_url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(UpdateError::NotFound(format!(
                    "bundle {} of package {}",
                    descriptor.bundle_id, descriptor.package_id
                )))
            }
            status if !status.is_success() => {
                return Err(UpdateError::Network(format!(
                    "HTTP {} for bundle {}",
                    status, descriptor.bundle_id
                )))
            }
            _ => {}
        }

        let total = descriptor.size.or(response.content_length());
        let capacity = total.unwrap_or(0).min(64 * 1024 * 1024) as usize;
        let mut bytes = Vec::with_capacity(capacity);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            bytes.extend_from_slice(&chunk);
            if let Some(expected) = descriptor.size {
                if bytes.len() as u64 > expected {
                    return Err(UpdateError::ChecksumMismatch {
                        version: descriptor.version_id.to_string(),
                        expected: format!("{} bytes", expected),
                        actual: format!("more than {} bytes", expected),
                    });
                }
            }
            on_progress(bytes.len() as u64, total);
        }

        BundleVerifier::verify_bytes(descriptor, &bytes)?;
        info!(version = %descriptor.version_id, bytes = bytes.len(), "bundle downloaded");
        Ok(bytes)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionMetadata> {
        self.get_json(&StorageLocation::session_metadata_path(session_id)).await
    }
}

//! Shared fixtures: an in-memory bundle source and coordinator setup.
#![allow(dead_code)]

use livebundle_lib::engine::error::{Result, UpdateError};
use livebundle_lib::engine::updater::descriptor::{BundleMetadata, PackageMetadata, SessionMetadata};
use livebundle_lib::engine::updater::{
    BundleCache, BundleDescriptor, BundleSelector, BundleSource, BundleVerifier, CoordinatorOptions,
    EventEmitter, Platform, StorageLocation, UpdateCoordinator, UpdateEvent, UpdatePhase, VersionId,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

pub const PACKAGE: &str = "demo";

#[derive(Clone)]
struct Published {
    descriptor: BundleDescriptor,
    served: Vec<u8>,
}

/// Serves whatever was last published as the configured package, plus any
/// other packages published by id. Downloads can be held open to keep a
/// cycle in flight.
pub struct FakeSource {
    location: StorageLocation,
    published: Mutex<Option<Published>>,
    packages: Mutex<HashMap<String, PackageMetadata>>,
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    hold: AtomicBool,
    release: Notify,
    downloads: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            location: StorageLocation::new("https://storage.test/livebundle", Some("?sig=1")).unwrap(),
            published: Mutex::new(None),
            packages: Mutex::new(HashMap::new()),
            artifacts: Mutex::new(HashMap::new()),
            hold: AtomicBool::new(false),
            release: Notify::new(),
            downloads: AtomicUsize::new(0),
        }
    }

    fn descriptor(version: &str, advertised: &[u8]) -> BundleDescriptor {
        BundleDescriptor {
            version_id: VersionId::new(version).unwrap(),
            package_id: PACKAGE.to_string(),
            bundle_id: format!("bundle-{}", version),
            download_url: format!("https://storage.test/livebundle/packages/{}/bundle-{}", PACKAGE, version),
            checksum: BundleVerifier::sha256_bytes(advertised),
            size: Some(advertised.len() as u64),
        }
    }

    pub fn publish(&self, version: &str, bytes: &[u8]) {
        *self.published.lock().unwrap() = Some(Published {
            descriptor: Self::descriptor(version, bytes),
            served: bytes.to_vec(),
        });
    }

    /// Advertise the checksum of `advertised` but serve `served`
    pub fn publish_corrupt(&self, version: &str, advertised: &[u8], served: &[u8]) {
        *self.published.lock().unwrap() = Some(Published {
            descriptor: Self::descriptor(version, advertised),
            served: served.to_vec(),
        });
    }

    /// Publish another package; bundles are `(id, dev, bytes)` for this platform
    pub fn publish_package(&self, package_id: &str, bundles: &[(&str, bool, &[u8])]) {
        let mut artifacts = self.artifacts.lock().unwrap();
        let bundles = bundles
            .iter()
            .map(|(id, dev, bytes)| {
                artifacts.insert(id.to_string(), bytes.to_vec());
                BundleMetadata {
                    id: id.to_string(),
                    platform: Platform::current(),
                    dev: *dev,
                    version: None,
                    sha256: BundleVerifier::sha256_bytes(bytes),
                    size: Some(bytes.len() as u64),
                    url: None,
                }
            })
            .collect();
        self.packages.lock().unwrap().insert(
            package_id.to_string(),
            PackageMetadata {
                id: package_id.to_string(),
                bundles,
                signature: None,
            },
        );
    }

    /// Serve different bytes for a bundle published with `publish_package`
    pub fn publish_package_artifact(&self, bundle_id: &str, bytes: &[u8]) {
        self.artifacts
            .lock()
            .unwrap()
            .insert(bundle_id.to_string(), bytes.to_vec());
    }

    /// Park downloads until `release_downloads`
    pub fn hold_downloads(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_downloads(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
        self.release.notify_one();
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn current(&self) -> Result<Published> {
        self.published
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| UpdateError::NotFound(format!("packages/{}/metadata.json", PACKAGE)))
    }
}

impl BundleSource for FakeSource {
    fn location(&self) -> &StorageLocation {
        &self.location
    }

    async fn fetch_metadata(&self) -> Result<BundleDescriptor> {
        Ok(self.current()?.descriptor)
    }

    async fn fetch_package(&self, package_id: &str) -> Result<PackageMetadata> {
        self.packages
            .lock()
            .unwrap()
            .get(package_id)
            .cloned()
            .ok_or_else(|| UpdateError::NotFound(StorageLocation::package_metadata_path(package_id)))
    }

    async fn fetch_metadata_for(&self, package_id: &str, selector: &BundleSelector) -> Result<BundleDescriptor> {
        let metadata = self.fetch_package(package_id).await?;
        let bundle = metadata.find_bundle(Platform::current(), selector)?;
        BundleDescriptor::from_metadata(&self.location, package_id, bundle)
    }

    async fn fetch_artifact<P>(&self, descriptor: &BundleDescriptor, mut on_progress: P) -> Result<Vec<u8>>
    where
        P: FnMut(u64, Option<u64>) + Send,
    {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let other = self.artifacts.lock().unwrap().get(&descriptor.bundle_id).cloned();
        let served = match other {
            Some(bytes) => bytes,
            None => self.current()?.served,
        };

        let half = served.len() / 2;
        on_progress(half as u64, descriptor.size);
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        on_progress(served.len() as u64, descriptor.size);

        BundleVerifier::verify_bytes(descriptor, &served)?;
        Ok(served)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionMetadata> {
        if session_id == "s1" {
            Ok(SessionMetadata {
                host: "10.0.2.2:8081".to_string(),
            })
        } else {
            Err(UpdateError::NotFound(format!("sessions/{}/metadata.json", session_id)))
        }
    }
}

pub fn open_coordinator(cache_root: &Path) -> Arc<UpdateCoordinator<FakeSource>> {
    open_coordinator_with(cache_root, Arc::new(EventEmitter::new()))
}

pub fn open_coordinator_with(
    cache_root: &Path,
    events: Arc<EventEmitter>,
) -> Arc<UpdateCoordinator<FakeSource>> {
    let cache = BundleCache::open(cache_root).unwrap();
    let coordinator =
        UpdateCoordinator::open(FakeSource::new(), cache, events, CoordinatorOptions::default()).unwrap();
    Arc::new(coordinator)
}

pub fn v(id: &str) -> VersionId {
    VersionId::new(id).unwrap()
}

/// Everything emitted so far
pub fn drain(rx: &mut broadcast::Receiver<UpdateEvent>) -> Vec<UpdateEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn phases(events: &[UpdateEvent]) -> Vec<UpdatePhase> {
    events
        .iter()
        .filter_map(|e| match e {
            UpdateEvent::PhaseChanged { phase } => Some(*phase),
            _ => None,
        })
        .collect()
}

/// Poll until `f` holds, for up to two seconds
pub async fn wait_until(mut f: impl FnMut() -> bool) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

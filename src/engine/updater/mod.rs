//! LiveBundle Update System
//!
//! Downloads, verifies and hot-swaps application bundles with rollback.
//!
//! Components:
//! - `location` - Storage location and URL building
//! - `descriptor` - Remote metadata and bundle descriptors
//! - `download` - HTTP storage client
//! - `verify` - Checksum and signature verification
//! - `archive` - Bundle archive unpacking
//! - `cache` - Versioned on-disk bundle cache
//! - `state` - Update phases and the active pointer
//! - `events` - Lifecycle event broadcasting
//! - `coordinator` - The update cycle

pub mod archive;
pub mod cache;
pub mod coordinator;
pub mod descriptor;
pub mod download;
pub mod events;
pub mod location;
pub mod state;
pub mod verify;

pub use cache::{BundleCache, CacheEntry, RetentionPolicy};
pub use coordinator::{CheckOutcome, CoordinatorOptions, UpdateCoordinator};
pub use descriptor::{BundleDescriptor, BundleFlavor, BundleSelector, Platform, VersionId};
pub use download::{BundleSource, StorageClient};
pub use events::{EventEmitter, EventKind, UpdateEvent};
pub use location::StorageLocation;
pub use state::{ActivePointer, UpdatePhase};
pub use verify::BundleVerifier;

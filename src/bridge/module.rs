//! LiveBundle Module
//!
//! Host-facing facade over the update coordinator. The host hands in its
//! execution engine and event sink; everything else is driven from here.

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dev_menu::{DevMenuBridge, DevMenuHost};
use crate::engine::api::{ApiState, CheckHook};
use crate::engine::config::{ActivationPolicy, Config, ConfigError, DevMenuConfig};
use crate::engine::error::{Result, UpdateError};
use crate::engine::updater::descriptor::PackageMetadata;
use crate::engine::updater::{
    BundleFlavor, BundleSelector, BundleSource, CheckOutcome, EventEmitter, StorageClient,
    UpdateCoordinator, UpdateEvent, VersionId,
};

/// Name under which update events reach the host
pub const EVENT_NAME: &str = "LiveBundleUpdate";

/// Runs bundles. Implemented by the host's JavaScript engine.
pub trait BundleEngine: Send + Sync {
    fn run_bundle(&self, path: &Path);

    /// Run the bundle shipped inside the application
    fn run_embedded(&self);

    /// Load from a dev server (`host:port`)
    fn run_live_session(&self, host: &str);
}

/// Host event mechanism
pub trait EventSink: Send + Sync {
    fn send_event(&self, name: &str, payload: Value);
}

/// Values exposed to the JavaScript side at startup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ModuleConstants {
    pub storage_url: String,
    pub storage_url_suffix: String,
    pub package_id: String,
    pub bundle_id: Option<String>,
    pub version: Option<VersionId>,
    pub is_bundle_installed: bool,
    pub is_session_started: bool,
}

pub struct LiveBundleModule<S> {
    coordinator: Arc<UpdateCoordinator<S>>,
    engine: Arc<dyn BundleEngine>,
    package_id: String,
    activation: ActivationPolicy,
    check_on_startup: bool,
    dev_menu: DevMenuConfig,
    /// Host of the running live session, if any
    session: Mutex<Option<String>>,
}

impl LiveBundleModule<StorageClient> {
    /// Wire the module up from a config file's contents
    pub fn from_config(
        config: &Config,
        engine: Arc<dyn BundleEngine>,
    ) -> std::result::Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let coordinator = UpdateCoordinator::open(
            config.storage_client()?,
            config.open_cache()?,
            Arc::new(EventEmitter::new()),
            config.coordinator_options(),
        )?;
        let module = Self::new(
            Arc::new(coordinator),
            engine,
            &config.storage.package_id,
            config.update.activation,
        )
        .with_startup(config.update.check_on_startup, config.dev_menu.clone());
        Ok(Arc::new(module))
    }
}

impl<S: BundleSource + 'static> LiveBundleModule<S> {
    pub fn new(
        coordinator: Arc<UpdateCoordinator<S>>,
        engine: Arc<dyn BundleEngine>,
        package_id: &str,
        activation: ActivationPolicy,
    ) -> Self {
        Self {
            coordinator,
            engine,
            package_id: package_id.to_string(),
            activation,
            check_on_startup: false,
            dev_menu: DevMenuConfig::default(),
            session: Mutex::new(None),
        }
    }

    /// Startup behaviour: a background check after launch, and the dev menu item
    pub fn with_startup(mut self, check_on_startup: bool, dev_menu: DevMenuConfig) -> Self {
        self.check_on_startup = check_on_startup;
        self.dev_menu = dev_menu;
        self
    }

    /// Application start-up: launch the UI, then check for an update in the
    /// background when configured to. Returns the running check, if any.
    pub fn start(self: &Arc<Self>, handle: &Handle) -> Result<Option<JoinHandle<Result<CheckOutcome>>>> {
        self.launch_ui()?;
        if !self.check_on_startup {
            return Ok(None);
        }
        info!("checking for update on startup");
        Ok(Some(self.spawn_check_on(handle)))
    }

    /// Build the dev menu bridge with the configured title and register it
    /// when enabled
    pub fn dev_menu(self: &Arc<Self>, host: Arc<dyn DevMenuHost>, handle: Handle) -> Arc<DevMenuBridge<S>> {
        let bridge = DevMenuBridge::new(Arc::clone(self), host, handle, &self.dev_menu.title);
        bridge.register(self.dev_menu.enabled);
        bridge
    }

    /// Dev API state whose checks follow this module's activation policy
    pub fn api_state(self: &Arc<Self>) -> ApiState<S> {
        let module = Arc::downgrade(self);
        let hook: CheckHook = Arc::new(move |outcome: &CheckOutcome| match module.upgrade() {
            Some(module) => module.apply_activation(outcome),
            None => Ok(()),
        });
        ApiState::new(Arc::clone(&self.coordinator)).with_check_hook(hook)
    }

    pub fn coordinator(&self) -> &Arc<UpdateCoordinator<S>> {
        &self.coordinator
    }

    /// Hand control to the engine: the active cached bundle, or the embedded
    /// one when nothing is installed. Launches of cached bundles count
    /// towards the launch guard until `confirm_launch`.
    pub fn launch_ui(&self) -> Result<()> {
        match self.coordinator.active_entry() {
            Some(entry) => {
                let attempts = self.coordinator.record_launch()?;
                info!(version = %entry.version_id, attempts, "launching cached bundle");
                self.engine.run_bundle(&entry.bundle_path());
            }
            None => {
                info!("launching embedded bundle");
                self.engine.run_embedded();
            }
        }
        Ok(())
    }

    /// The launched bundle came up
    pub fn confirm_launch(&self) -> Result<()> {
        self.coordinator.confirm_launch()
    }

    pub fn constants(&self) -> ModuleConstants {
        let location = self.coordinator.source().location();
        let entry = self.coordinator.active_entry();
        ModuleConstants {
            storage_url: location.base_url().to_string(),
            storage_url_suffix: location.suffix().to_string(),
            package_id: self.package_id.clone(),
            bundle_id: entry.as_ref().map(|e| e.bundle_id.clone()),
            version: entry.as_ref().map(|e| e.version_id.clone()),
            is_bundle_installed: entry.is_some(),
            is_session_started: self.session_host().is_some(),
        }
    }

    /// Run an update cycle; with the immediate policy a new bundle is
    /// launched right away.
    pub async fn check_for_update(&self) -> Result<CheckOutcome> {
        let outcome = self.coordinator.check_for_update().await?;
        self.apply_activation(&outcome)?;
        Ok(outcome)
    }

    /// Like [`check_for_update`](Self::check_for_update), on `handle`. Whether
    /// the check was admitted is decided before this returns.
    pub fn spawn_check_on(self: &Arc<Self>, handle: &Handle) -> JoinHandle<Result<CheckOutcome>> {
        let check = self.coordinator.spawn_check_on(handle);
        let this = Arc::clone(self);
        handle.spawn(async move {
            let outcome = check.await??;
            this.apply_activation(&outcome)?;
            Ok::<CheckOutcome, UpdateError>(outcome)
        })
    }

    /// Relaunch after an update under the immediate policy
    pub fn apply_activation(&self, outcome: &CheckOutcome) -> Result<()> {
        if let CheckOutcome::Updated { version } = outcome {
            if self.activation == ActivationPolicy::Immediate {
                info!(version = %version, "reloading with new bundle");
                self.launch_ui()?;
            }
        }
        Ok(())
    }

    /// Metadata of any package at the storage location
    pub async fn package_metadata(&self, package_id: &str) -> Result<PackageMetadata> {
        self.coordinator.source().fetch_package(package_id).await
    }

    /// Install a bundle of any package by id
    pub async fn install_bundle(&self, package_id: &str, bundle_id: &str) -> Result<CheckOutcome> {
        self.install(package_id, BundleSelector::Id(bundle_id.to_string()))
            .await
    }

    /// Install the dev or prod bundle of any package for this platform
    pub async fn install_flavor(&self, package_id: &str, flavor: BundleFlavor) -> Result<CheckOutcome> {
        self.install(package_id, BundleSelector::Flavor(flavor)).await
    }

    async fn install(&self, package_id: &str, selector: BundleSelector) -> Result<CheckOutcome> {
        let outcome = self.coordinator.install(package_id, selector).await?;
        self.apply_activation(&outcome)?;
        Ok(outcome)
    }

    /// Back to the embedded bundle and relaunch it
    pub fn reset(&self) -> Result<()> {
        self.coordinator.reset()?;
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.engine.run_embedded();
        Ok(())
    }

    /// Resolve a live session and point the engine at its dev server
    pub async fn launch_live_session(&self, session_id: &str) -> Result<String> {
        let session = self.coordinator.source().fetch_session(session_id).await?;
        info!(session_id, host = %session.host, "starting live session");
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.host.clone());
        self.engine.run_live_session(&session.host);
        Ok(session.host)
    }

    pub fn session_host(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn asset_url(&self, hash: &str, name: &str, asset_type: &str) -> String {
        self.coordinator
            .source()
            .location()
            .asset_url(hash, name, asset_type)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.coordinator.events().subscribe()
    }

    /// Forward every update event to the host as JSON under [`EVENT_NAME`].
    /// Runs until the emitter goes away.
    pub fn forward_events(&self, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_value(&event) {
                        Ok(payload) => sink.send_event(EVENT_NAME, payload),
                        Err(e) => warn!(error = %e, "failed to serialize update event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event forwarding lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!("event emitter closed");
                        break;
                    }
                }
            }
        })
    }
}

//! Dev Menu Bridge
//!
//! Registers a single "check for update" action in the host's developer menu.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::module::LiveBundleModule;
use crate::engine::error::Result;
use crate::engine::updater::{BundleSource, CheckOutcome};

pub type MenuAction = Arc<dyn Fn() + Send + Sync>;

/// Developer menu chrome provided by the host
pub trait DevMenuHost: Send + Sync {
    /// Add an item; `action` runs on the host's UI thread and must not block
    fn add_item(&self, title: &str, action: MenuAction);

    /// Inline feedback (toast or similar)
    fn show_message(&self, message: &str);
}

pub struct DevMenuBridge<S> {
    module: Arc<LiveBundleModule<S>>,
    host: Arc<dyn DevMenuHost>,
    handle: Handle,
    title: String,
    registered: AtomicBool,
}

impl<S: BundleSource + 'static> DevMenuBridge<S> {
    /// Triggers run on `handle`, so the menu can fire from any thread.
    /// Checks go through `module` and follow its activation policy.
    pub fn new(
        module: Arc<LiveBundleModule<S>>,
        host: Arc<dyn DevMenuHost>,
        handle: Handle,
        title: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            module,
            host,
            handle,
            title: title.to_string(),
            registered: AtomicBool::new(false),
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Add the menu item. Does nothing when disabled (release builds by
    /// default) or already registered. Returns whether an item was added.
    pub fn register(self: &Arc<Self>, enabled: bool) -> bool {
        if !enabled {
            debug!("dev menu disabled, not registering");
            return false;
        }
        if self.registered.swap(true, Ordering::SeqCst) {
            return false;
        }

        let bridge = Arc::downgrade(self);
        self.host.add_item(
            &self.title,
            Arc::new(move || {
                if let Some(bridge) = bridge.upgrade() {
                    // feedback arrives through the host
                    drop(bridge.trigger());
                }
            }),
        );
        info!(title = %self.title, "dev menu item registered");
        true
    }

    /// Start a check and report its outcome through the host. A trigger
    /// during a running cycle reports busy without starting anything.
    pub fn trigger(&self) -> JoinHandle<()> {
        let check = self.module.spawn_check_on(&self.handle);
        let host = Arc::clone(&self.host);
        self.handle.spawn(async move {
            let result = check.await.unwrap_or_else(|e| Err(e.into()));
            host.show_message(&feedback(&result));
        })
    }
}

fn feedback(result: &Result<CheckOutcome>) -> String {
    match result {
        Ok(CheckOutcome::Updated { version }) => format!("Bundle {} installed", version),
        Ok(CheckOutcome::NoUpdate) => "Already up to date".to_string(),
        Ok(CheckOutcome::Busy) => "An update is already in progress".to_string(),
        Err(e) => format!("Update failed: {}", e),
    }
}

//! Host Bridge
//!
//! The surface the host application talks to: the LiveBundle module and the
//! developer menu action. Host capabilities come in as traits.

pub mod dev_menu;
pub mod module;

pub use dev_menu::{DevMenuBridge, DevMenuHost, MenuAction};
pub use module::{BundleEngine, EventSink, LiveBundleModule, ModuleConstants, EVENT_NAME};

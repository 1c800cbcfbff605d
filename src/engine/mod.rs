// LiveBundle Engine - Core module structure
pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod updater;

pub use config::Config;
pub use error::{Result, UpdateError};
pub use updater::UpdateCoordinator;

//! LiveBundle CLI Module
//! Command-line interface for bundle update operations

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::updater::{BundleFlavor, BundleSelector};

#[derive(Parser, Debug)]
#[command(name = "livebundle")]
#[command(author = "LiveBundle Team")]
#[command(version)]
#[command(about = "Over-the-air JavaScript bundle distribution and hot-swap", long_about = None)]
pub struct Cli {
    /// Project directory holding livebundle.config.json (defaults to current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FlavorArg {
    Dev,
    Prod,
}

impl From<FlavorArg> for BundleFlavor {
    fn from(flavor: FlavorArg) -> Self {
        match flavor {
            FlavorArg::Dev => BundleFlavor::Dev,
            FlavorArg::Prod => BundleFlavor::Prod,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a livebundle.config.json for a storage location
    Init {
        /// Storage base URL
        #[arg(short, long)]
        url: String,

        /// Package id
        #[arg(short = 'k', long)]
        package: String,

        /// Suffix appended to every storage URL (e.g. a SAS token)
        #[arg(short, long)]
        suffix: Option<String>,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Check for, download and activate a newer bundle
    Check,

    /// Download and activate a chosen bundle of any package
    Install {
        /// Package id
        package: String,

        /// Bundle id within the package
        #[arg(short, long, conflicts_with = "flavor")]
        bundle: Option<String>,

        /// Bundle flavor for this platform
        #[arg(long, value_enum, default_value = "prod")]
        flavor: FlavorArg,
    },

    /// Show the active bundle and update state
    Status,

    /// List cached bundle versions
    Versions,

    /// Activate a cached version
    Activate {
        /// Version id
        version: String,
    },

    /// Re-activate the previous version
    Rollback,

    /// Go back to the embedded bundle
    Reset,

    /// Remove cached versions beyond the retention policy
    Evict,

    /// Start the dev control API server
    Serve {
        /// Port to listen on (defaults to the config)
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind to (defaults to the config)
        #[arg(long)]
        host: Option<String>,
    },
}

impl Commands {
    /// Which bundle an `install` asks for
    pub fn bundle_selector(bundle: Option<String>, flavor: FlavorArg) -> BundleSelector {
        match bundle {
            Some(id) => BundleSelector::Id(id),
            None => BundleSelector::Flavor(flavor.into()),
        }
    }
}

impl Cli {
    pub fn get_project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

//! LiveBundle CLI - Main entry point for CLI binary
//!
//! This binary provides the `livebundle` tool for driving bundle updates
//! from a terminal or CI.

use anyhow::{bail, Context, Result};
use clap::Parser;
use livebundle_lib::engine::{
    api::{create_router, ApiState},
    cli::{
        formatter::{format_size, CliFormatter},
        Cli, Commands, OutputFormat,
    },
    config::{Config, CONFIG_FILE},
    updater::{
        BundleSelector, CheckOutcome, EventEmitter, StorageClient, UpdateCoordinator, VersionId,
    },
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

/// `LIVEBUNDLE_LOG` wins over `RUST_LOG`; logs go to stderr so JSON output stays clean
fn init_logging() {
    let filter = EnvFilter::try_from_env("LIVEBUNDLE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_cli(cli: Cli) -> Result<()> {
    let project_dir = cli.get_project_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { url, package, suffix, force } => {
            cmd_init(&project_dir, &url, &package, suffix.as_deref(), force, json_output)?;
        }
        Commands::Check => {
            cmd_check(&project_dir, None, json_output)?;
        }
        Commands::Install { package, bundle, flavor } => {
            let selector = Commands::bundle_selector(bundle, flavor);
            cmd_check(&project_dir, Some((package, selector)), json_output)?;
        }
        Commands::Status => {
            cmd_status(&project_dir, json_output)?;
        }
        Commands::Versions => {
            cmd_versions(&project_dir, json_output)?;
        }
        Commands::Activate { version } => {
            cmd_activate(&project_dir, &version, json_output)?;
        }
        Commands::Rollback => {
            cmd_rollback(&project_dir, json_output)?;
        }
        Commands::Reset => {
            cmd_reset(&project_dir, json_output)?;
        }
        Commands::Evict => {
            cmd_evict(&project_dir, json_output)?;
        }
        Commands::Serve { port, host } => {
            cmd_serve(&project_dir, host, port)?;
        }
    }

    Ok(())
}

fn load_config(project_dir: &Path) -> Result<Config> {
    Config::load(project_dir)
        .with_context(|| format!("loading {} from {}", CONFIG_FILE, project_dir.display()))
}

fn open_coordinator(
    config: &Config,
    events: Arc<EventEmitter>,
) -> Result<UpdateCoordinator<StorageClient>> {
    let coordinator = UpdateCoordinator::open(
        config.storage_client()?,
        config.open_cache()?,
        events,
        config.coordinator_options(),
    )?;
    Ok(coordinator)
}

fn cmd_init(
    project_dir: &Path,
    url: &str,
    package: &str,
    suffix: Option<&str>,
    force: bool,
    json: bool,
) -> Result<()> {
    if project_dir.join(CONFIG_FILE).exists() && !force {
        bail!(
            "{} already exists in {} (use --force to overwrite)",
            CONFIG_FILE,
            project_dir.display()
        );
    }

    let config = Config::default_for_location(url, suffix, package);
    config.validate()?;
    std::fs::create_dir_all(project_dir)?;
    config.save(project_dir)?;

    if json {
        println!("{}", json!({
            "success": true,
            "config": project_dir.join(CONFIG_FILE).display().to_string(),
            "cache_dir": config.cache_dir()?.display().to_string(),
        }));
    } else {
        CliFormatter::success(&format!("Wrote {}", project_dir.join(CONFIG_FILE).display()));
        CliFormatter::kv("Storage", url);
        CliFormatter::kv("Package", package);
        CliFormatter::kv("Cache", &config.cache_dir()?.display().to_string());
    }

    Ok(())
}

/// Regular check, or an install of `request` when given
#[tokio::main]
async fn cmd_check(
    project_dir: &Path,
    request: Option<(String, BundleSelector)>,
    json: bool,
) -> Result<()> {
    let config = load_config(project_dir)?;
    let events = Arc::new(EventEmitter::new());
    let mut receiver = events.subscribe();
    let coordinator = open_coordinator(&config, events)?;

    // Ends once the coordinator (and with it the emitter) is dropped
    let printer = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) if !json => CliFormatter::event(&event),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = match request {
        Some((package, selector)) => coordinator.install(&package, selector).await,
        None => coordinator.check_for_update().await,
    };
    drop(coordinator);
    printer.await.ok();

    let outcome = result?;
    if json {
        println!("{}", serde_json::to_string(&outcome)?);
    } else if let CheckOutcome::Busy = outcome {
        bail!("another update is already in progress");
    }

    Ok(())
}

fn cmd_status(project_dir: &Path, json: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let coordinator = open_coordinator(&config, Arc::new(EventEmitter::new()))?;
    let pointer = coordinator.pointer();
    let active = coordinator.active_entry();
    let usage = coordinator.cache().usage_bytes()?;

    if json {
        println!("{}", json!({
            "storage_url": config.storage.url,
            "package_id": config.storage.package_id,
            "cache_dir": coordinator.cache().root().display().to_string(),
            "pointer": pointer,
            "active": active,
            "cache_bytes": usage,
        }));
    } else {
        CliFormatter::header("LiveBundle Status");
        CliFormatter::kv("Storage", &config.storage.url);
        CliFormatter::kv("Package", &config.storage.package_id);
        CliFormatter::kv("Cache", &coordinator.cache().root().display().to_string());
        CliFormatter::kv(
            "Active",
            &pointer
                .active
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "(embedded)".to_string()),
        );
        if let Some(previous) = &pointer.previous {
            CliFormatter::kv("Previous", previous.as_str());
        }
        if let Some(entry) = &active {
            CliFormatter::kv("Bundle", &entry.bundle_path().display().to_string());
        }
        if let Some(last_check) = pointer.last_check {
            CliFormatter::kv("Last check", &last_check.to_rfc3339());
        }
        if pointer.launch_attempts > 0 {
            CliFormatter::kv("Unconfirmed launches", &pointer.launch_attempts.to_string());
        }
        if !pointer.failed.is_empty() {
            let failed: Vec<&str> = pointer.failed.iter().map(VersionId::as_str).collect();
            CliFormatter::kv("Failed to launch", &failed.join(", "));
        }
        CliFormatter::kv("Cache size", &format_size(usage));
    }

    Ok(())
}

fn cmd_versions(project_dir: &Path, json: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let coordinator = open_coordinator(&config, Arc::new(EventEmitter::new()))?;
    let pointer = coordinator.pointer();
    let entries = coordinator.cache().list()?;

    if json {
        println!("{}", serde_json::to_string(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        CliFormatter::info("No cached versions");
        return Ok(());
    }

    CliFormatter::table_header(&["Version", "Bundle", "Size", "Downloaded", ""]);
    for entry in &entries {
        let marker = if pointer.active.as_ref() == Some(&entry.version_id) {
            "active"
        } else if pointer.previous.as_ref() == Some(&entry.version_id) {
            "previous"
        } else {
            ""
        };
        CliFormatter::table_row(&[
            entry.version_id.as_str(),
            &entry.bundle_id,
            &format_size(entry.size),
            &entry.downloaded_at.format("%Y-%m-%d %H:%M").to_string(),
            marker,
        ]);
    }

    Ok(())
}

fn cmd_activate(project_dir: &Path, version: &str, json: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let coordinator = open_coordinator(&config, Arc::new(EventEmitter::new()))?;
    let version = VersionId::new(version)?;
    coordinator.activate(&version)?;

    if json {
        println!("{}", json!({ "success": true, "active": version }));
    } else {
        CliFormatter::success(&format!("Activated {}", version));
    }
    Ok(())
}

fn cmd_rollback(project_dir: &Path, json: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let coordinator = open_coordinator(&config, Arc::new(EventEmitter::new()))?;
    let version = coordinator.rollback()?;

    if json {
        println!("{}", json!({ "success": true, "active": version }));
    } else {
        CliFormatter::success(&format!("Rolled back to {}", version));
    }
    Ok(())
}

fn cmd_reset(project_dir: &Path, json: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let coordinator = open_coordinator(&config, Arc::new(EventEmitter::new()))?;
    coordinator.reset()?;

    if json {
        println!("{}", json!({ "success": true, "active": null }));
    } else {
        CliFormatter::success("Reset to the embedded bundle");
    }
    Ok(())
}

fn cmd_evict(project_dir: &Path, json: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let coordinator = open_coordinator(&config, Arc::new(EventEmitter::new()))?;
    let removed = coordinator.evict()?;

    if json {
        println!("{}", json!({ "success": true, "removed": removed }));
    } else if removed.is_empty() {
        CliFormatter::info("Nothing to evict");
    } else {
        for version in &removed {
            CliFormatter::item(&format!("removed {}", version));
        }
        CliFormatter::success(&format!("Evicted {} version(s)", removed.len()));
    }
    Ok(())
}

#[tokio::main]
async fn cmd_serve(project_dir: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = load_config(project_dir)?;
    let coordinator = open_coordinator(&config, Arc::new(EventEmitter::new()))?;

    let state = ApiState::new(Arc::new(coordinator));
    let app = create_router(state);

    let addr = format!(
        "{}:{}",
        host.unwrap_or_else(|| config.api.host.clone()),
        port.unwrap_or(config.api.port)
    );
    CliFormatter::header("LiveBundle Dev API");
    CliFormatter::kv("Package", &config.storage.package_id);
    CliFormatter::kv("Listening", &format!("http://{}", addr));
    CliFormatter::info("Press Ctrl+C to stop");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

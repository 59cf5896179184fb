//! Cache command - inspect and reap cached resource volumes

use crate::cache::{properties, CacheState, Fingerprint, LocalVolumeStore, VolumeRecord};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::clock::SystemClock;
use crate::config::{Config, ConfigManager};
use crate::error::GantryResult;
use chrono::Utc;
use console::style;
use std::sync::Arc;
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> GantryResult<()> {
    let root = ConfigManager::volumes_dir(config);
    debug!("Volume store at {}", root.display());
    let store = LocalVolumeStore::new(root, Arc::new(SystemClock));

    match args.action {
        CacheAction::List { format } => list_volumes(&store, format).await,
        CacheAction::Gc { dry_run } => gc_volumes(&store, dry_run).await,
    }
}

/// List all cache volumes
async fn list_volumes(store: &LocalVolumeStore, format: OutputFormat) -> GantryResult<()> {
    let volumes = store.list().await?;

    if volumes.is_empty() && !matches!(format, OutputFormat::Json) {
        println!("No cache volumes found.");
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_volume_table(&volumes),
        OutputFormat::Json => print_volume_json(&volumes)?,
        OutputFormat::Plain => print_volume_plain(&volumes),
    }

    Ok(())
}

fn resource_label(record: &VolumeRecord) -> String {
    match Fingerprint::from_properties(&record.properties) {
        Some(fingerprint) => fingerprint.to_string(),
        None => record
            .properties
            .get(properties::RESOURCE_TYPE)
            .cloned()
            .unwrap_or_else(|| "-".to_string()),
    }
}

fn print_volume_table(volumes: &[VolumeRecord]) {
    let now = Utc::now();
    println!(
        "{:<38} {:<24} {:<10} {:<18} {:<18}",
        "HANDLE", "RESOURCE", "STATE", "CREATED", "EXPIRES"
    );
    println!("{}", "-".repeat(110));

    for record in volumes {
        let state_display = match record.state() {
            CacheState::Complete => style("complete").green().to_string(),
            CacheState::Building => style("building").yellow().to_string(),
            CacheState::Miss => style("miss").dim().to_string(),
        };

        let expires = if record.is_expired(now) {
            style("expired").red().to_string()
        } else {
            record.expires_at.format("%Y-%m-%d %H:%M").to_string()
        };

        println!(
            "{:<38} {:<24} {:<10} {:<18} {:<18}",
            record.handle,
            resource_label(record),
            state_display,
            record.created_at.format("%Y-%m-%d %H:%M"),
            expires
        );
    }

    println!();
    println!("Total: {} volume(s)", volumes.len());
}

fn print_volume_json(volumes: &[VolumeRecord]) -> GantryResult<()> {
    #[derive(serde::Serialize)]
    struct VolumeJson<'a> {
        handle: &'a str,
        resource: String,
        state: CacheState,
        created_at: String,
        expires_at: String,
        properties: &'a crate::cache::VolumeProperties,
    }

    let json_volumes: Vec<VolumeJson<'_>> = volumes
        .iter()
        .map(|r| VolumeJson {
            handle: &r.handle,
            resource: resource_label(r),
            state: r.state(),
            created_at: r.created_at.to_rfc3339(),
            expires_at: r.expires_at.to_rfc3339(),
            properties: &r.properties,
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json_volumes)?);
    Ok(())
}

fn print_volume_plain(volumes: &[VolumeRecord]) {
    for record in volumes {
        println!("{}", record.handle);
    }
}

/// Remove volumes whose lease ran out
async fn gc_volumes(store: &LocalVolumeStore, dry_run: bool) -> GantryResult<()> {
    let expired = store.reap_expired(dry_run).await?;

    if expired.is_empty() {
        println!("No expired volumes.");
        return Ok(());
    }

    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!("{} {} expired volume(s):", verb, expired.len());
    for record in &expired {
        println!(
            "  {} {} ({})",
            style("•").red(),
            record.handle,
            resource_label(record)
        );
    }

    if dry_run {
        println!();
        println!("Dry run - no volumes removed.");
    }

    Ok(())
}

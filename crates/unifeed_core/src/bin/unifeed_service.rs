/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use unifeed_core::config::ServiceConfig;
use unifeed_core::protocol::ProtocolRegistry;
use unifeed_core::runtime;

fn default_config_path() -> Result<PathBuf> {
    if cfg!(target_os = "windows") {
        let base = std::env::var("APPDATA")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        return Ok(PathBuf::from(base).join("Unifeed").join("config.json"));
    }
    if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        return Ok(PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join("Unifeed")
            .join("config.json"));
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Ok(PathBuf::from(home)
        .join(".config")
        .join("unifeed")
        .join("config.json"))
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

fn load_config(text: &str) -> Result<ServiceConfig> {
    serde_json::from_str(text).context("parse config json")
}

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("UNIFEED_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

/// Registered network plugins. New networks are linked in here; nothing is
/// discovered at runtime.
fn build_protocols() -> ProtocolRegistry {
    ProtocolRegistry::new()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .try_init()
        .ok();

    let cfg_path = parse_config_path()?;
    info!("unifeed service starting");
    info!("config: {}", cfg_path.display());

    let mut handle: Option<u64> = None;
    let mut last_hash: Option<u64> = None;
    let mut last_failed_hash: Option<u64> = None;
    let mut missing_logged = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break;
            }
            _ = sleep(Duration::from_secs(2)) => {}
        }

        let text = match std::fs::read_to_string(&cfg_path) {
            Ok(t) => t,
            Err(e) => {
                if !missing_logged {
                    warn!("config missing: {} ({e})", cfg_path.display());
                    missing_logged = true;
                }
                continue;
            }
        };
        missing_logged = false;

        let hash = hash_text(&text);
        if last_hash == Some(hash) || last_failed_hash == Some(hash) {
            continue;
        }

        match load_config(&text) {
            Ok(cfg) => {
                if let Some(h) = handle.take() {
                    if let Err(e) = runtime::stop(h) {
                        warn!("failed to stop previous core: {e:#}");
                    }
                }
                match runtime::start(cfg, build_protocols()) {
                    Ok(h) => {
                        handle = Some(h);
                        last_hash = Some(hash);
                        last_failed_hash = None;
                        info!("core started (handle={h})");
                    }
                    Err(e) => {
                        error!("failed to start core: {e:#}");
                        last_failed_hash = Some(hash);
                    }
                }
            }
            Err(e) => {
                warn!("invalid config: {e:#}");
                last_failed_hash = Some(hash);
            }
        }
    }

    if let Some(h) = handle.take() {
        if let Err(e) = runtime::stop(h) {
            warn!("failed to stop core: {e:#}");
        }
    }
    Ok(())
}

// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use p2a_core::{Config, JsonFilePrefStore, MetricRegistry, P2aService, ProchloDelegate};

const DEFAULT_PREF_PATH: &str = "p2a-prefs.json";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("P2A_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("hyper=off,rustls=off,{}", log_level);

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(match EnvFilter::try_new(env_filter) {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!("could not parse log level in configuration: {e}");
                return;
            }
        })
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not install tracing subscriber: {e}");
        return;
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration. Shutting down: {e}");
            return;
        }
    };

    // Comma-separated closed list of collectable metric names.
    let registry = MetricRegistry::new(
        env::var("P2A_METRICS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string),
    );
    if registry.is_empty() {
        error!("P2A_METRICS is empty; nothing to report. Shutting down.");
        return;
    }
    debug!("Collecting {} metrics", registry.len());

    let delegate = match ProchloDelegate::from_config(&config, registry) {
        Ok(delegate) => delegate,
        Err(e) => {
            error!("Invalid server keys. Shutting down: {e}");
            return;
        }
    };

    let pref_path = env::var("P2A_PREF_PATH").unwrap_or(DEFAULT_PREF_PATH.to_string());
    let prefs = JsonFilePrefStore::open(&pref_path);

    let (service, handle) = match P2aService::new(&config, prefs, delegate) {
        Ok(parts) => parts,
        Err(e) => {
            error!("Failed to start reporting service: {e}");
            return;
        }
    };
    let task = tokio::spawn(service.run());
    info!("Reporting service started; uploads go to {}", config.upload_url);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down");
    handle.shutdown();
    let _ = task.await;
}

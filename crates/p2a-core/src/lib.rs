// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! Anonymous, fixed-size metric reporting pipeline.
//!
//! The pipeline tracks a small set of usage counters, encrypts each one
//! into a fixed-size wire message with the nested hybrid scheme from the
//! [`prochlo`] crate, and uploads the messages on a jittered schedule so
//! that neither report content nor report timing correlates with client
//! behavior. Everything is best-effort: no failure in this crate ever
//! reaches the host application.
//!
//! Components:
//! - [`log_store::LogStore`] owns per-metric persistent state and selects
//!   the next report to stage.
//! - [`scheduler::Scheduler`] decides when the next upload attempt runs
//!   (geometric jitter on success, exponential backoff on failure).
//! - [`uploader::Uploader`] performs the single in-flight HTTP POST.
//! - [`service::P2aService`] wires the above together on one owning task
//!   and runs the weekly rotation that starts a new reporting epoch.

pub mod config;
pub mod log_store;
pub mod metrics;
pub mod prefs;
pub mod rotation;
pub mod scheduler;
pub mod service;
pub mod uploader;

pub use config::{Config, ConfigError};
pub use log_store::{LogEntry, LogStore, LogStoreDelegate};
pub use metrics::{metric_hash, MetricRegistry, ProchloDelegate};
pub use prefs::{JsonFilePrefStore, MemoryPrefStore, PrefStore};
pub use scheduler::Scheduler;
pub use service::{P2aService, ServiceCommand, ServiceHandle};
pub use uploader::{UploadOutcome, Uploader};

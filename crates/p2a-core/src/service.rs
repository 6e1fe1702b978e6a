// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! The orchestrating service task.
//!
//! One tokio task owns every piece of mutable state: the log store, the
//! scheduler, and the rotation clock. Histogram notifications from
//! arbitrary threads enter through a bounded channel on the cloneable
//! [`ServiceHandle`]; the channel doubles as the buffer for samples that
//! arrive before initialization completes, since `run()` loads persisted
//! state and settles the rotation before draining a single command.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::log_store::{LogStore, LogStoreDelegate};
use crate::prefs::PrefStore;
use crate::rotation::{next_rotation_delay, startup_rotation_delay, time_until_next_monday};
use crate::scheduler::Scheduler;
use crate::uploader::Uploader;

#[derive(Debug)]
pub enum ServiceCommand {
    /// A histogram changed in the host; the bucket index was computed
    /// there. Only strictly linear histograms are supported upstream, so
    /// the index is a plain offset.
    HistogramChanged {
        name: String,
        bucket: u64,
        bucket_count: u16,
    },
    Shutdown,
}

/// Cloneable, thread-safe entry point into the service task.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<ServiceCommand>,
}

impl ServiceHandle {
    /// Forwards one histogram change. Never blocks: reporting is
    /// best-effort, so a full channel drops the sample with a warning.
    pub fn on_histogram_changed(&self, name: &str, bucket: u64, bucket_count: u16) {
        let command = ServiceCommand::HistogramChanged {
            name: name.to_string(),
            bucket,
            bucket_count,
        };
        if self.tx.try_send(command).is_err() {
            warn!("Dropping histogram sample for '{name}': channel closed or full");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.try_send(ServiceCommand::Shutdown);
    }
}

pub struct P2aService<P: PrefStore> {
    rx: mpsc::Receiver<ServiceCommand>,
    log_store: LogStore<P>,
    scheduler: Scheduler,
    uploader: Uploader,
    rotation_interval: Option<Duration>,
    ignore_server_errors: bool,
}

impl<P: PrefStore> P2aService<P> {
    pub fn new(
        config: &Config,
        prefs: P,
        delegate: Arc<dyn LogStoreDelegate>,
    ) -> Result<(Self, ServiceHandle), ConfigError> {
        let upload_url = Url::parse(&config.upload_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("upload URL '{}': {e}", config.upload_url))
        })?;
        let uploader = Uploader::new(upload_url)
            .map_err(|e| ConfigError::InvalidConfig(format!("HTTP client: {e}")))?;

        let scheduler = Scheduler::new(
            config.average_upload_interval,
            config.randomize_upload_interval,
            config.initial_backoff,
            config.max_backoff,
        );

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let service = Self {
            rx,
            log_store: LogStore::new(prefs, delegate),
            scheduler,
            uploader,
            rotation_interval: config.rotation_interval,
            ignore_server_errors: config.ignore_server_errors,
        };
        Ok((service, ServiceHandle { tx }))
    }

    /// Runs the owning loop until [`ServiceHandle::shutdown`] or until
    /// every handle is dropped.
    pub async fn run(mut self) {
        self.log_store.load_persisted_unsent_logs();

        let now = OffsetDateTime::now_utc();
        let rotation_delay = match startup_rotation_delay(
            now,
            self.log_store.prefs().last_rotation(),
            self.rotation_interval,
        ) {
            Some(remaining) => remaining,
            None => self.rotate(now),
        };
        let mut next_rotation = Instant::now() + rotation_delay;
        let mut next_upload = Instant::now() + self.scheduler.start();
        debug!("Reporting service started");

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(ServiceCommand::HistogramChanged { name, bucket, bucket_count }) => {
                        self.log_store.update_value(&name, bucket, bucket_count);
                    }
                    Some(ServiceCommand::Shutdown) | None => break,
                },
                _ = sleep_until(next_upload) => {
                    let ok = self.upload_attempt().await;
                    next_upload = Instant::now() + self.scheduler.upload_finished(ok);
                }
                _ = sleep_until(next_rotation) => {
                    let now = OffsetDateTime::now_utc();
                    next_rotation = Instant::now() + self.rotate(now);
                }
            }
        }

        debug!("Reporting service stopped");
    }

    /// One scheduled attempt. With nothing to send this is a routine
    /// check-in and counts as success, keeping the upload cadence
    /// independent of whether data was pending.
    async fn upload_attempt(&mut self) -> bool {
        if !self.log_store.has_staged_log() {
            self.log_store.stage_next_log();
        }
        let Some(payload) = self.log_store.staged_log() else {
            debug!("No unsent reports; routine check-in");
            return true;
        };

        let outcome = self.uploader.upload_log(payload).await;
        let ok = outcome.is_success(self.ignore_server_errors);
        if ok {
            self.log_store.discard_staged_log();
        } else {
            // The staged ciphertext is kept and retried after backoff.
            debug!(
                "Upload attempt failed (status {:?}); report stays staged",
                outcome.status
            );
        }
        ok
    }

    /// Clears the sent flags, stamps the rotation time, and returns the
    /// delay until the next rotation.
    fn rotate(&mut self, now: OffsetDateTime) -> Duration {
        info!("Starting a new reporting epoch");
        self.log_store.reset_upload_stamps();
        self.log_store
            .prefs_mut()
            .set_last_rotation(now.unix_timestamp());
        match self.rotation_interval {
            Some(_) => next_rotation_delay(now, now, self.rotation_interval),
            None => time_until_next_monday(now),
        }
    }
}

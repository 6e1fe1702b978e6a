// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! Preference-store boundary.
//!
//! Persistence is an external collaborator: the host hands the pipeline
//! something that can durably hold a small dictionary of per-metric
//! entries plus one scalar rotation timestamp. The trait trades in
//! [`serde_json::Value`] so the log store can decide what to do with
//! entries that no longer parse.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Serialized shape of one per-metric entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedLogEntry {
    pub value: u64,
    pub bucket_count: u16,
    pub sent: bool,
    #[serde(default)]
    pub sent_timestamp: Option<i64>,
}

/// Durable key-value backend for the log store.
///
/// Mutations are expected to be synchronous and cheap; the service task
/// calls them inline. Implementations must never fail loudly: a backend
/// problem is logged and the pipeline keeps running on its in-memory
/// state.
pub trait PrefStore: Send {
    /// All persisted per-metric entries, keyed by metric name.
    fn read_entries(&self) -> BTreeMap<String, Value>;

    /// Write or overwrite one entry.
    fn write_entry(&mut self, name: &str, entry: Value);

    /// Remove one entry, if present.
    fn remove_entry(&mut self, name: &str);

    /// Wall-clock time of the last successful rotation, unix seconds.
    fn last_rotation(&self) -> Option<i64>;

    fn set_last_rotation(&mut self, unix_seconds: i64);
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, Value>,
    last_rotation: Option<i64>,
}

/// In-memory store with a shared backend.
///
/// Clones observe each other's writes, which lets tests (and embedders
/// that persist elsewhere) reload a fresh `LogStore` against the same
/// backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryPrefStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPrefStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("lock poisoned")
    }
}

impl PrefStore for MemoryPrefStore {
    fn read_entries(&self) -> BTreeMap<String, Value> {
        self.state().entries.clone()
    }

    fn write_entry(&mut self, name: &str, entry: Value) {
        self.state().entries.insert(name.to_string(), entry);
    }

    fn remove_entry(&mut self, name: &str) {
        self.state().entries.remove(name);
    }

    fn last_rotation(&self) -> Option<i64> {
        self.state().last_rotation
    }

    fn set_last_rotation(&mut self, unix_seconds: i64) {
        self.state().last_rotation = Some(unix_seconds);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FileState {
    #[serde(default)]
    entries: BTreeMap<String, Value>,
    #[serde(default)]
    last_rotation: Option<i64>,
}

/// Write-through JSON file store.
///
/// The whole state is loaded once at open and rewritten on every
/// mutation; the dictionary is tiny, so a full rewrite stays cheap.
/// I/O errors are logged and otherwise ignored.
#[derive(Debug)]
pub struct JsonFilePrefStore {
    path: PathBuf,
    state: FileState,
}

impl JsonFilePrefStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Discarding corrupt pref file {}: {e}", path.display());
                    FileState::default()
                }
            },
            Err(_) => FileState::default(),
        };
        Self { path, state }
    }

    fn flush(&self) {
        let bytes = match serde_json::to_vec_pretty(&self.state) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize pref state: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(&self.path, bytes) {
            warn!("Failed to write pref file {}: {e}", self.path.display());
        }
    }
}

impl PrefStore for JsonFilePrefStore {
    fn read_entries(&self) -> BTreeMap<String, Value> {
        self.state.entries.clone()
    }

    fn write_entry(&mut self, name: &str, entry: Value) {
        self.state.entries.insert(name.to_string(), entry);
        self.flush();
    }

    fn remove_entry(&mut self, name: &str) {
        self.state.entries.remove(name);
        self.flush();
    }

    fn last_rotation(&self) -> Option<i64> {
        self.state.last_rotation
    }

    fn set_last_rotation(&mut self, unix_seconds: i64) {
        self.state.last_rotation = Some(unix_seconds);
        self.flush();
    }
}

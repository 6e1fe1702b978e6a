// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! Per-metric persistent state and report staging.
//!
//! The store owns the mapping of metric name to [`LogEntry`], persists
//! every mutation synchronously through the injected [`PrefStore`], and
//! hands serialization and metric-recognition decisions to a
//! [`LogStoreDelegate`]. One report at a time is "staged": serialized,
//! cached, and retried across upload attempts until the uploader
//! confirms success.

use std::collections::BTreeMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, warn};

use prochlo::EncodeError;

use crate::prefs::{PersistedLogEntry, PrefStore};

/// Serialization and staleness callbacks injected by the embedder.
pub trait LogStoreDelegate: Send + Sync {
    /// Turns one metric record into its encrypted wire bytes.
    fn serialize_log(&self, name: &str, value: u64, bucket_count: u16)
        -> Result<Vec<u8>, EncodeError>;

    /// Whether `name` is still a recognized, collected metric.
    fn is_actual_metric(&self, name: &str) -> bool;
}

/// State tracked for one metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Bucket index supplied by the host's histogram subsystem.
    pub value: u64,
    pub bucket_count: u16,
    pub sent: bool,
    /// Unix seconds of the successful upload, cleared by rotation.
    pub sent_timestamp: Option<i64>,
}

#[derive(Debug)]
struct StagedLog {
    name: String,
    payload: Vec<u8>,
}

pub struct LogStore<P: PrefStore> {
    entries: BTreeMap<String, LogEntry>,
    staged: Option<StagedLog>,
    prefs: P,
    delegate: Arc<dyn LogStoreDelegate>,
}

impl<P: PrefStore> LogStore<P> {
    pub fn new(prefs: P, delegate: Arc<dyn LogStoreDelegate>) -> Self {
        Self {
            entries: BTreeMap::new(),
            staged: None,
            prefs,
            delegate,
        }
    }

    /// Upserts the entry for `name` and persists it immediately.
    ///
    /// A fresh entry starts unsent; updates overwrite the value and
    /// bucket count but never touch the sent flag. Only rotation resets
    /// that.
    pub fn update_value(&mut self, name: &str, value: u64, bucket_count: u16) {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| LogEntry {
                value,
                bucket_count,
                sent: false,
                sent_timestamp: None,
            });
        entry.value = value;
        entry.bucket_count = bucket_count;
        self.persist_entry(name);
    }

    /// Starts a new reporting epoch: every entry becomes unsent again.
    pub fn reset_upload_stamps(&mut self) {
        let names: Vec<String> = self.entries.keys().cloned().collect();
        for name in names {
            if let Some(entry) = self.entries.get_mut(&name) {
                entry.sent = false;
                entry.sent_timestamp = None;
            }
            self.persist_entry(&name);
        }
    }

    /// True iff at least one recognized metric still awaits upload.
    pub fn has_unsent_logs(&self) -> bool {
        self.entries
            .iter()
            .any(|(name, entry)| !entry.sent && self.delegate.is_actual_metric(name))
    }

    pub fn has_staged_log(&self) -> bool {
        self.staged.is_some()
    }

    /// The serialized bytes of the staged report, if any.
    pub fn staged_log(&self) -> Option<&[u8]> {
        self.staged.as_ref().map(|s| s.payload.as_slice())
    }

    pub fn staged_log_name(&self) -> Option<&str> {
        self.staged.as_ref().map(|s| s.name.as_str())
    }

    /// Picks the first unsent, recognized entry in lexicographic order
    /// and caches its ciphertext. No-op while a log is already staged.
    ///
    /// Obsolete metric names encountered on the way are purged; a
    /// serialization failure drops that single report and moves on.
    pub fn stage_next_log(&mut self) {
        if self.staged.is_some() {
            return;
        }

        let mut obsolete = Vec::new();
        let mut staged = None;
        for (name, entry) in &self.entries {
            if entry.sent {
                continue;
            }
            if !self.delegate.is_actual_metric(name) {
                obsolete.push(name.clone());
                continue;
            }
            match self
                .delegate
                .serialize_log(name, entry.value, entry.bucket_count)
            {
                Ok(payload) => {
                    staged = Some(StagedLog {
                        name: name.clone(),
                        payload,
                    });
                    break;
                }
                Err(e) => {
                    warn!("Failed to serialize report for '{name}': {e}");
                }
            }
        }

        for name in obsolete {
            self.purge(&name);
        }
        if let Some(staged) = &staged {
            debug!("Staged report for '{}'", staged.name);
        }
        self.staged = staged;
    }

    /// Marks the staged entry as sent and clears the staged cache.
    ///
    /// Call only after the uploader reported success.
    pub fn discard_staged_log(&mut self) {
        let Some(staged) = self.staged.take() else {
            return;
        };
        if let Some(entry) = self.entries.get_mut(&staged.name) {
            entry.sent = true;
            entry.sent_timestamp = Some(OffsetDateTime::now_utc().unix_timestamp());
        }
        self.persist_entry(&staged.name);
    }

    /// Rebuilds the mapping from the persistence backend.
    ///
    /// Malformed entries and names the delegate no longer recognizes are
    /// dropped from the backend as well; neither is fatal.
    pub fn load_persisted_unsent_logs(&mut self) {
        self.entries.clear();
        for (name, value) in self.prefs.read_entries() {
            if !self.delegate.is_actual_metric(&name) {
                debug!("Dropping persisted entry for obsolete metric '{name}'");
                self.prefs.remove_entry(&name);
                continue;
            }
            match serde_json::from_value::<PersistedLogEntry>(value) {
                Ok(persisted) => {
                    self.entries.insert(
                        name,
                        LogEntry {
                            value: persisted.value,
                            bucket_count: persisted.bucket_count,
                            sent: persisted.sent,
                            sent_timestamp: persisted.sent_timestamp,
                        },
                    );
                }
                Err(e) => {
                    warn!("Dropping malformed persisted entry for '{name}': {e}");
                    self.prefs.remove_entry(&name);
                }
            }
        }
    }

    /// Intentionally a no-op: every mutation persists synchronously, so
    /// there is no deferred flush step.
    pub fn persist_unsent_logs(&self) {}

    pub fn get_entry(&self, name: &str) -> Option<&LogEntry> {
        self.entries.get(name)
    }

    pub fn prefs(&self) -> &P {
        &self.prefs
    }

    pub fn prefs_mut(&mut self) -> &mut P {
        &mut self.prefs
    }

    fn persist_entry(&mut self, name: &str) {
        let Some(entry) = self.entries.get(name) else {
            return;
        };
        let persisted = PersistedLogEntry {
            value: entry.value,
            bucket_count: entry.bucket_count,
            sent: entry.sent,
            sent_timestamp: entry.sent_timestamp,
        };
        match serde_json::to_value(&persisted) {
            Ok(value) => self.prefs.write_entry(name, value),
            Err(e) => warn!("Failed to serialize entry for '{name}': {e}"),
        }
    }

    fn purge(&mut self, name: &str) {
        debug!("Purging obsolete metric '{name}'");
        self.entries.remove(name);
        self.prefs.remove_entry(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::MemoryPrefStore;
    use serde_json::json;
    use std::collections::HashSet;

    struct StubDelegate {
        accepted: HashSet<String>,
        failing: HashSet<String>,
    }

    impl StubDelegate {
        fn accepting(names: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                accepted: names.iter().map(|s| s.to_string()).collect(),
                failing: HashSet::new(),
            })
        }

        fn with_failing(names: &[&str], failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                accepted: names.iter().map(|s| s.to_string()).collect(),
                failing: failing.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    impl LogStoreDelegate for StubDelegate {
        fn serialize_log(
            &self,
            name: &str,
            value: u64,
            bucket_count: u16,
        ) -> Result<Vec<u8>, EncodeError> {
            if self.failing.contains(name) {
                return Err(EncodeError::Encryption);
            }
            Ok(format!("{name},{bucket_count},{value}").into_bytes())
        }

        fn is_actual_metric(&self, name: &str) -> bool {
            self.accepted.contains(name)
        }
    }

    #[test]
    fn update_then_reload_round_trips() {
        let prefs = MemoryPrefStore::new();
        let delegate = StubDelegate::accepting(&["Test.Counter"]);

        let mut store = LogStore::new(prefs.clone(), delegate.clone());
        store.update_value("Test.Counter", 3, 7);
        // Deliberately a no-op; UpdateValue already persisted.
        store.persist_unsent_logs();

        let mut reloaded = LogStore::new(prefs, delegate);
        reloaded.load_persisted_unsent_logs();
        let entry = reloaded.get_entry("Test.Counter").expect("entry");
        assert_eq!(entry.value, 3);
        assert_eq!(entry.bucket_count, 7);
        assert!(!entry.sent);
    }

    #[test]
    fn update_never_resets_the_sent_flag() {
        let prefs = MemoryPrefStore::new();
        let delegate = StubDelegate::accepting(&["Test.Counter"]);
        let mut store = LogStore::new(prefs, delegate);

        store.update_value("Test.Counter", 3, 7);
        store.stage_next_log();
        store.discard_staged_log();
        assert!(store.get_entry("Test.Counter").expect("entry").sent);

        store.update_value("Test.Counter", 5, 7);
        let entry = store.get_entry("Test.Counter").expect("entry");
        assert_eq!(entry.value, 5);
        assert!(entry.sent, "UpdateValue must not reset the sent flag");
    }

    #[test]
    fn staging_skips_unrecognized_metrics_and_purges_them() {
        let prefs = MemoryPrefStore::new();
        let delegate = StubDelegate::accepting(&["B.Known"]);
        let mut store = LogStore::new(prefs.clone(), delegate);

        store.update_value("A.Obsolete", 1, 2);
        store.update_value("B.Known", 3, 7);

        store.stage_next_log();
        assert_eq!(store.staged_log_name(), Some("B.Known"));
        assert!(store.get_entry("A.Obsolete").is_none());
        assert!(!prefs.read_entries().contains_key("A.Obsolete"));
    }

    #[test]
    fn staging_is_a_noop_while_a_log_is_staged() {
        let prefs = MemoryPrefStore::new();
        let delegate = StubDelegate::accepting(&["A.One", "B.Two"]);
        let mut store = LogStore::new(prefs, delegate);

        store.update_value("A.One", 1, 2);
        store.update_value("B.Two", 2, 2);

        store.stage_next_log();
        assert_eq!(store.staged_log_name(), Some("A.One"));
        store.stage_next_log();
        assert_eq!(store.staged_log_name(), Some("A.One"));
    }

    #[test]
    fn serialize_failure_skips_that_report() {
        let prefs = MemoryPrefStore::new();
        let delegate = StubDelegate::with_failing(&["A.Bad", "B.Good"], &["A.Bad"]);
        let mut store = LogStore::new(prefs, delegate);

        store.update_value("A.Bad", 1, 2);
        store.update_value("B.Good", 2, 2);

        store.stage_next_log();
        assert_eq!(store.staged_log_name(), Some("B.Good"));
        // The failed report stays unsent for the next attempt.
        assert!(!store.get_entry("A.Bad").expect("entry").sent);
    }

    #[test]
    fn rotation_law() {
        let prefs = MemoryPrefStore::new();
        let delegate = StubDelegate::accepting(&["A.One", "B.Two"]);
        let mut store = LogStore::new(prefs, delegate);

        store.update_value("A.One", 1, 2);
        store.update_value("B.Two", 2, 2);
        store.stage_next_log();
        store.discard_staged_log();
        store.stage_next_log();
        store.discard_staged_log();
        assert!(!store.has_unsent_logs());

        store.reset_upload_stamps();
        assert!(store.has_unsent_logs());
        for name in ["A.One", "B.Two"] {
            let entry = store.get_entry(name).expect("entry");
            assert!(!entry.sent);
            assert_eq!(entry.sent_timestamp, None);
        }
    }

    #[test]
    fn discard_marks_sent_and_stamps_time() {
        let prefs = MemoryPrefStore::new();
        let delegate = StubDelegate::accepting(&["Test.Counter"]);
        let mut store = LogStore::new(prefs.clone(), delegate);

        store.update_value("Test.Counter", 3, 7);
        store.stage_next_log();
        store.discard_staged_log();

        let entry = store.get_entry("Test.Counter").expect("entry");
        assert!(entry.sent);
        assert!(entry.sent_timestamp.is_some());
        assert!(!store.has_staged_log());
        assert!(!store.has_unsent_logs());

        // The sent state is persisted, not just in memory.
        let persisted: PersistedLogEntry =
            serde_json::from_value(prefs.read_entries()["Test.Counter"].clone()).expect("parse");
        assert!(persisted.sent);
    }

    #[test]
    #[tracing_test::traced_test]
    fn malformed_persisted_entries_are_dropped() {
        let mut prefs = MemoryPrefStore::new();
        prefs.write_entry("Test.Counter", json!({"value": "not a number"}));
        prefs.write_entry(
            "Test.Other",
            json!({"value": 1, "bucket_count": 2, "sent": false}),
        );

        let delegate = StubDelegate::accepting(&["Test.Counter", "Test.Other"]);
        let mut store = LogStore::new(prefs.clone(), delegate);
        store.load_persisted_unsent_logs();

        assert!(store.get_entry("Test.Counter").is_none());
        assert!(store.get_entry("Test.Other").is_some());
        assert!(!prefs.read_entries().contains_key("Test.Counter"));
        assert!(logs_contain("Dropping malformed persisted entry"));
    }

    #[test]
    fn load_drops_entries_for_unrecognized_names() {
        let mut prefs = MemoryPrefStore::new();
        prefs.write_entry(
            "Gone.Metric",
            json!({"value": 1, "bucket_count": 2, "sent": false}),
        );

        let delegate = StubDelegate::accepting(&[]);
        let mut store = LogStore::new(prefs.clone(), delegate);
        store.load_persisted_unsent_logs();

        assert!(store.get_entry("Gone.Metric").is_none());
        assert!(prefs.read_entries().is_empty());
    }
}

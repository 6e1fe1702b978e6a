// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! Metric identity and the default encoder delegate.

use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;

use prochlo::{EncodeError, MessageEncoder, Prochlomation};

use crate::config::{Config, ConfigError};
use crate::log_store::LogStoreDelegate;

/// 64-bit FNV-1a hash of the metric name, used as the metric identifier
/// inside the encrypted record.
pub fn metric_hash(name: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// The closed set of metrics this build is allowed to collect.
///
/// Anything outside the registry is treated as obsolete and purged
/// lazily by the log store.
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    names: HashSet<String>,
}

impl MetricRegistry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Default [`LogStoreDelegate`]: serializes reports through the nested
/// hybrid encoder and answers recognition queries from a
/// [`MetricRegistry`].
pub struct ProchloDelegate {
    encoder: MessageEncoder,
    registry: MetricRegistry,
}

impl ProchloDelegate {
    pub fn new(encoder: MessageEncoder, registry: MetricRegistry) -> Self {
        Self { encoder, registry }
    }

    /// Builds the delegate from configured server keys.
    pub fn from_config(
        config: &Config,
        registry: MetricRegistry,
    ) -> Result<Arc<Self>, ConfigError> {
        let encoder = MessageEncoder::new(config.analyzer_key_der()?, config.shuffler_key_der()?);
        Ok(Arc::new(Self::new(encoder, registry)))
    }
}

impl LogStoreDelegate for ProchloDelegate {
    fn serialize_log(
        &self,
        name: &str,
        value: u64,
        bucket_count: u16,
    ) -> Result<Vec<u8>, EncodeError> {
        // ASCII metadata + value; truncated and zero-padded to the fixed
        // payload length by the record constructor.
        let payload = format!("{name},{bucket_count},{value}");
        let record = Prochlomation::new(metric_hash(name), payload.as_bytes());
        let item = self.encoder.encode(&record, value)?;
        Ok(item.to_bytes().to_vec())
    }

    fn is_actual_metric(&self, name: &str) -> bool {
        self.registry.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::EncodePublicKey;
    use p256::SecretKey;
    use prochlo::SHUFFLER_ITEM_LENGTH;
    use rand::rngs::OsRng;

    fn test_key_der() -> Vec<u8> {
        SecretKey::random(&mut OsRng)
            .public_key()
            .to_public_key_der()
            .expect("SPKI encoding")
            .into_vec()
    }

    #[test]
    fn metric_hash_is_stable_and_distinct() {
        assert_eq!(metric_hash("Test.Counter"), metric_hash("Test.Counter"));
        assert_ne!(metric_hash("Test.Counter"), metric_hash("Test.Other"));
    }

    #[test]
    fn registry_recognizes_only_registered_names() {
        let registry = MetricRegistry::new(["A.One", "B.Two"]);
        assert!(registry.contains("A.One"));
        assert!(!registry.contains("C.Three"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn delegate_produces_fixed_size_wire_messages() {
        let delegate = ProchloDelegate::new(
            MessageEncoder::new(test_key_der(), test_key_der()),
            MetricRegistry::new(["Test.Counter"]),
        );

        let short = delegate
            .serialize_log("Test.Counter", 1, 7)
            .expect("serialize");
        let long = delegate
            .serialize_log("Test.Counter", u64::MAX, u16::MAX)
            .expect("serialize");
        assert_eq!(short.len(), SHUFFLER_ITEM_LENGTH);
        assert_eq!(long.len(), SHUFFLER_ITEM_LENGTH);
    }

    #[test]
    fn delegate_rejects_unregistered_metrics() {
        let delegate = ProchloDelegate::new(
            MessageEncoder::new(test_key_der(), test_key_der()),
            MetricRegistry::new(["Test.Counter"]),
        );
        assert!(delegate.is_actual_metric("Test.Counter"));
        assert!(!delegate.is_actual_metric("Removed.Metric"));
    }

    #[test]
    fn delegate_surfaces_key_failures_per_message() {
        let delegate = ProchloDelegate::new(
            MessageEncoder::new(vec![1, 2, 3], test_key_der()),
            MetricRegistry::new(["Test.Counter"]),
        );
        assert!(matches!(
            delegate.serialize_log("Test.Counter", 1, 7),
            Err(EncodeError::AnalyzerKey)
        ));
    }
}

// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! Nested hybrid-encryption codec for anonymous metric reports.
//!
//! A plaintext metric record ([`Prochlomation`]) is wrapped in two
//! independent layers of public-key hybrid encryption before it ever
//! leaves the client:
//!
//! 1. The **analyzer layer** encrypts the record to the analyzer's
//!    long-term P-256 key, producing an [`AnalyzerItem`].
//! 2. The **shuffler layer** appends an 8-byte crowd ID and encrypts the
//!    whole thing to the shuffler's long-term key, producing the
//!    [`ShufflerItem`] that is actually transmitted.
//!
//! The shuffler can open only the outer layer, learning the crowd ID (for
//! k-anonymity bucketing) but never the metric itself; the analyzer sees
//! the metric only after reports have been shuffled and stripped of
//! arrival order. Every structure is fixed-length, so ciphertext size
//! carries no information about the value being reported.

pub mod encoder;

pub use encoder::MessageEncoder;

use thiserror::Error;

/// Length of the zero-padded ASCII payload inside a [`Prochlomation`].
pub const PAYLOAD_LENGTH: usize = 64;

/// Serialized [`Prochlomation`] length: 8-byte metric hash plus payload.
pub const PROCHLOMATION_LENGTH: usize = 8 + PAYLOAD_LENGTH;

/// AES-GCM authentication tag length.
pub const GCM_TAG_LENGTH: usize = 16;

/// AES-GCM nonce length (96 bits).
pub const NONCE_LENGTH: usize = 12;

/// Length of an uncompressed P-256 public key in DER SPKI form.
pub const PUBLIC_KEY_DER_LENGTH: usize = 91;

/// Length of the truncated crowd ID visible to the shuffler.
pub const CROWD_ID_LENGTH: usize = 8;

/// Serialized [`AnalyzerItem`] length.
pub const ANALYZER_ITEM_LENGTH: usize =
    PROCHLOMATION_LENGTH + GCM_TAG_LENGTH + NONCE_LENGTH + PUBLIC_KEY_DER_LENGTH;

/// Length of the shuffler-layer plaintext: analyzer item plus crowd ID.
pub const PLAIN_SHUFFLER_ITEM_LENGTH: usize = ANALYZER_ITEM_LENGTH + CROWD_ID_LENGTH;

/// Serialized [`ShufflerItem`] length. This is the wire message size.
pub const SHUFFLER_ITEM_LENGTH: usize =
    PLAIN_SHUFFLER_ITEM_LENGTH + GCM_TAG_LENGTH + NONCE_LENGTH + PUBLIC_KEY_DER_LENGTH;

/// Errors raised while encoding a single report.
///
/// All of these are per-message: the caller drops or retries that one
/// report, the process keeps running.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Malformed analyzer public key")]
    AnalyzerKey,

    #[error("Malformed shuffler public key")]
    ShufflerKey,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Ephemeral key encoding failed")]
    KeyEncoding,

    #[error("AEAD encryption failed")]
    Encryption,
}

/// Plaintext metric record: a 64-bit metric identifier hash plus a
/// fixed 64-byte ASCII payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prochlomation {
    metric_hash: u64,
    payload: [u8; PAYLOAD_LENGTH],
}

impl Prochlomation {
    /// Builds a record from a metric hash and an arbitrary-length payload.
    ///
    /// The payload is truncated to [`PAYLOAD_LENGTH`] bytes and
    /// zero-padded, so the serialized form is always exactly
    /// [`PROCHLOMATION_LENGTH`] bytes.
    pub fn new(metric_hash: u64, payload: &[u8]) -> Self {
        let mut fixed = [0u8; PAYLOAD_LENGTH];
        let n = payload.len().min(PAYLOAD_LENGTH);
        fixed[..n].copy_from_slice(&payload[..n]);
        Self {
            metric_hash,
            payload: fixed,
        }
    }

    pub fn metric_hash(&self) -> u64 {
        self.metric_hash
    }

    pub fn payload(&self) -> &[u8; PAYLOAD_LENGTH] {
        &self.payload
    }

    /// Serializes as `metric_hash (LE) || payload`.
    pub fn to_bytes(&self) -> [u8; PROCHLOMATION_LENGTH] {
        let mut out = [0u8; PROCHLOMATION_LENGTH];
        out[..8].copy_from_slice(&self.metric_hash.to_le_bytes());
        out[8..].copy_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(bytes: &[u8; PROCHLOMATION_LENGTH]) -> Self {
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&bytes[..8]);
        let mut payload = [0u8; PAYLOAD_LENGTH];
        payload.copy_from_slice(&bytes[8..]);
        Self {
            metric_hash: u64::from_le_bytes(hash),
            payload,
        }
    }
}

/// First-layer ciphertext: the record encrypted to the analyzer key,
/// together with the GCM tag, nonce, and the client's ephemeral public
/// key for that layer.
#[derive(Debug, Clone)]
pub struct AnalyzerItem {
    pub ciphertext: [u8; PROCHLOMATION_LENGTH],
    pub tag: [u8; GCM_TAG_LENGTH],
    pub nonce: [u8; NONCE_LENGTH],
    pub client_public_key: [u8; PUBLIC_KEY_DER_LENGTH],
}

impl AnalyzerItem {
    pub fn to_bytes(&self) -> [u8; ANALYZER_ITEM_LENGTH] {
        let mut out = [0u8; ANALYZER_ITEM_LENGTH];
        pack(
            &mut out,
            &self.ciphertext,
            &self.tag,
            &self.nonce,
            &self.client_public_key,
        );
        out
    }

    pub fn from_bytes(bytes: &[u8; ANALYZER_ITEM_LENGTH]) -> Self {
        let mut item = Self {
            ciphertext: [0u8; PROCHLOMATION_LENGTH],
            tag: [0u8; GCM_TAG_LENGTH],
            nonce: [0u8; NONCE_LENGTH],
            client_public_key: [0u8; PUBLIC_KEY_DER_LENGTH],
        };
        let (ct, rest) = bytes.split_at(PROCHLOMATION_LENGTH);
        let (tag, rest) = rest.split_at(GCM_TAG_LENGTH);
        let (nonce, key) = rest.split_at(NONCE_LENGTH);
        item.ciphertext.copy_from_slice(ct);
        item.tag.copy_from_slice(tag);
        item.nonce.copy_from_slice(nonce);
        item.client_public_key.copy_from_slice(key);
        item
    }
}

/// Shuffler-layer plaintext: an [`AnalyzerItem`] plus the crowd ID.
#[derive(Debug, Clone)]
pub struct PlainShufflerItem {
    pub analyzer_item: AnalyzerItem,
    pub crowd_id: [u8; CROWD_ID_LENGTH],
}

impl PlainShufflerItem {
    pub fn to_bytes(&self) -> [u8; PLAIN_SHUFFLER_ITEM_LENGTH] {
        let mut out = [0u8; PLAIN_SHUFFLER_ITEM_LENGTH];
        out[..ANALYZER_ITEM_LENGTH].copy_from_slice(&self.analyzer_item.to_bytes());
        out[ANALYZER_ITEM_LENGTH..].copy_from_slice(&self.crowd_id);
        out
    }

    pub fn from_bytes(bytes: &[u8; PLAIN_SHUFFLER_ITEM_LENGTH]) -> Self {
        let mut inner = [0u8; ANALYZER_ITEM_LENGTH];
        inner.copy_from_slice(&bytes[..ANALYZER_ITEM_LENGTH]);
        let mut crowd_id = [0u8; CROWD_ID_LENGTH];
        crowd_id.copy_from_slice(&bytes[ANALYZER_ITEM_LENGTH..]);
        Self {
            analyzer_item: AnalyzerItem::from_bytes(&inner),
            crowd_id,
        }
    }
}

/// Second-layer ciphertext, encrypted to the shuffler key. This is the
/// structure that is base64-encoded and transmitted.
#[derive(Debug, Clone)]
pub struct ShufflerItem {
    pub ciphertext: [u8; PLAIN_SHUFFLER_ITEM_LENGTH],
    pub tag: [u8; GCM_TAG_LENGTH],
    pub nonce: [u8; NONCE_LENGTH],
    pub client_public_key: [u8; PUBLIC_KEY_DER_LENGTH],
}

impl ShufflerItem {
    /// Wire layout: `ciphertext || tag || nonce || client_public_key`.
    pub fn to_bytes(&self) -> [u8; SHUFFLER_ITEM_LENGTH] {
        let mut out = [0u8; SHUFFLER_ITEM_LENGTH];
        pack(
            &mut out,
            &self.ciphertext,
            &self.tag,
            &self.nonce,
            &self.client_public_key,
        );
        out
    }

    pub fn from_bytes(bytes: &[u8; SHUFFLER_ITEM_LENGTH]) -> Self {
        let mut item = Self {
            ciphertext: [0u8; PLAIN_SHUFFLER_ITEM_LENGTH],
            tag: [0u8; GCM_TAG_LENGTH],
            nonce: [0u8; NONCE_LENGTH],
            client_public_key: [0u8; PUBLIC_KEY_DER_LENGTH],
        };
        let (ct, rest) = bytes.split_at(PLAIN_SHUFFLER_ITEM_LENGTH);
        let (tag, rest) = rest.split_at(GCM_TAG_LENGTH);
        let (nonce, key) = rest.split_at(NONCE_LENGTH);
        item.ciphertext.copy_from_slice(ct);
        item.tag.copy_from_slice(tag);
        item.nonce.copy_from_slice(nonce);
        item.client_public_key.copy_from_slice(key);
        item
    }
}

fn pack(out: &mut [u8], ciphertext: &[u8], tag: &[u8], nonce: &[u8], key: &[u8]) {
    let mut at = 0;
    for part in [ciphertext, tag, nonce, key] {
        out[at..at + part.len()].copy_from_slice(part);
        at += part.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prochlomation_pads_short_payloads() {
        let p = Prochlomation::new(7, b"Test.Counter,3");
        assert_eq!(p.to_bytes().len(), PROCHLOMATION_LENGTH);
        assert_eq!(&p.payload()[..14], b"Test.Counter,3");
        assert!(p.payload()[14..].iter().all(|&b| b == 0));
    }

    #[test]
    fn prochlomation_truncates_long_payloads() {
        let long = vec![b'x'; 200];
        let p = Prochlomation::new(7, &long);
        assert_eq!(p.payload().len(), PAYLOAD_LENGTH);
        assert!(p.payload().iter().all(|&b| b == b'x'));
    }

    #[test]
    fn prochlomation_round_trips() {
        let p = Prochlomation::new(0xdead_beef_cafe_f00d, b"A.B,42");
        assert_eq!(Prochlomation::from_bytes(&p.to_bytes()), p);
    }

    #[test]
    fn wire_lengths_are_fixed() {
        assert_eq!(PROCHLOMATION_LENGTH, 72);
        assert_eq!(ANALYZER_ITEM_LENGTH, 191);
        assert_eq!(PLAIN_SHUFFLER_ITEM_LENGTH, 199);
        assert_eq!(SHUFFLER_ITEM_LENGTH, 318);
    }

    #[test]
    fn shuffler_item_round_trips() {
        let item = ShufflerItem {
            ciphertext: [1u8; PLAIN_SHUFFLER_ITEM_LENGTH],
            tag: [2u8; GCM_TAG_LENGTH],
            nonce: [3u8; NONCE_LENGTH],
            client_public_key: [4u8; PUBLIC_KEY_DER_LENGTH],
        };
        let bytes = item.to_bytes();
        let parsed = ShufflerItem::from_bytes(&bytes);
        assert_eq!(parsed.ciphertext, item.ciphertext);
        assert_eq!(parsed.tag, item.tag);
        assert_eq!(parsed.nonce, item.nonce);
        assert_eq!(parsed.client_public_key, item.client_public_key);
    }
}

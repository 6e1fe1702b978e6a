// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! Stateless two-layer encoder.
//!
//! Each layer is an ECIES-style hybrid scheme: a fresh ephemeral P-256
//! key pair, ECDH against the recipient's long-term key, a two-round
//! HMAC-SHA256 expansion of the shared secret into an AES-128 key, and
//! AES-128-GCM with a random 96-bit nonce. The ephemeral public key is
//! shipped alongside the ciphertext so the recipient can rerun the same
//! derivation.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{
    AnalyzerItem, EncodeError, PlainShufflerItem, Prochlomation, ShufflerItem, CROWD_ID_LENGTH,
    GCM_TAG_LENGTH, NONCE_LENGTH, PLAIN_SHUFFLER_ITEM_LENGTH, PROCHLOMATION_LENGTH,
    PUBLIC_KEY_DER_LENGTH,
};

type HmacSha256 = Hmac<Sha256>;

/// Derives the crowd ID for a report: the first [`CROWD_ID_LENGTH`] bytes
/// of `SHA-256(metric_hash (LE) || metric_value (LE))`.
///
/// The shuffler uses this to bucket reports from many clients without
/// learning their contents.
pub fn crowd_id(metric_hash: u64, metric_value: u64) -> [u8; CROWD_ID_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(metric_hash.to_le_bytes());
    hasher.update(metric_value.to_le_bytes());
    let digest = hasher.finalize();
    let mut id = [0u8; CROWD_ID_LENGTH];
    id.copy_from_slice(&digest[..CROWD_ID_LENGTH]);
    id
}

/// Expands an ECDH shared secret into an AES-128 key.
///
/// `K1 = HMAC-SHA256(key = 0^32, data = secret)`, then
/// `expanded = HMAC-SHA256(key = K1, data = 0x01)`; the AES key is the
/// first 16 bytes of `expanded`. No salt, fixed context byte, no key-size
/// negotiation.
fn derive_aes_key(shared_secret: &[u8]) -> Result<[u8; 16], EncodeError> {
    let mut prk =
        <HmacSha256 as Mac>::new_from_slice(&[0u8; 32]).map_err(|_| EncodeError::KeyDerivation)?;
    prk.update(shared_secret);
    let prk = prk.finalize().into_bytes();

    let mut okm =
        <HmacSha256 as Mac>::new_from_slice(&prk).map_err(|_| EncodeError::KeyDerivation)?;
    okm.update(&[0x01]);
    let expanded = okm.finalize().into_bytes();

    let mut key = [0u8; 16];
    key.copy_from_slice(&expanded[..16]);
    Ok(key)
}

struct SealedLayer {
    ciphertext: Vec<u8>,
    tag: [u8; GCM_TAG_LENGTH],
    nonce: [u8; NONCE_LENGTH],
    client_public_key: [u8; PUBLIC_KEY_DER_LENGTH],
}

/// One hybrid-encryption layer against `recipient`.
fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<SealedLayer, EncodeError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);

    let der = ephemeral
        .public_key()
        .to_public_key_der()
        .map_err(|_| EncodeError::KeyEncoding)?;
    let client_public_key: [u8; PUBLIC_KEY_DER_LENGTH] = der
        .as_bytes()
        .try_into()
        .map_err(|_| EncodeError::KeyEncoding)?;

    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_aes_key(shared.raw_secret_bytes().as_slice())?;

    let cipher = Aes128Gcm::new_from_slice(&key).map_err(|_| EncodeError::KeyDerivation)?;
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);

    // The aead crate appends the tag to the ciphertext; split it back out.
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EncodeError::Encryption)?;
    let tag_start = sealed.len() - GCM_TAG_LENGTH;
    let mut tag = [0u8; GCM_TAG_LENGTH];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);

    Ok(SealedLayer {
        ciphertext: sealed,
        tag,
        nonce,
        client_public_key,
    })
}

/// Stateless encoder holding the two long-term server public keys in DER
/// SPKI form. Key bytes are validated per message; a malformed key fails
/// that single report, never the process.
#[derive(Debug, Clone)]
pub struct MessageEncoder {
    analyzer_key_der: Vec<u8>,
    shuffler_key_der: Vec<u8>,
}

impl MessageEncoder {
    pub fn new(analyzer_key_der: Vec<u8>, shuffler_key_der: Vec<u8>) -> Self {
        Self {
            analyzer_key_der,
            shuffler_key_der,
        }
    }

    /// Produces the transmitted wire message for one metric record.
    ///
    /// `metric_value` feeds only the crowd ID; the value as reported to
    /// the analyzer travels inside the record payload.
    pub fn encode(
        &self,
        record: &Prochlomation,
        metric_value: u64,
    ) -> Result<ShufflerItem, EncodeError> {
        let analyzer_key = PublicKey::from_public_key_der(&self.analyzer_key_der)
            .map_err(|_| EncodeError::AnalyzerKey)?;
        let shuffler_key = PublicKey::from_public_key_der(&self.shuffler_key_der)
            .map_err(|_| EncodeError::ShufflerKey)?;

        // Layer 1: record -> analyzer item.
        let layer1 = seal(&analyzer_key, &record.to_bytes())?;
        let ciphertext: [u8; PROCHLOMATION_LENGTH] = layer1
            .ciphertext
            .as_slice()
            .try_into()
            .map_err(|_| EncodeError::Encryption)?;
        let analyzer_item = AnalyzerItem {
            ciphertext,
            tag: layer1.tag,
            nonce: layer1.nonce,
            client_public_key: layer1.client_public_key,
        };

        // Layer 2: analyzer item + crowd ID -> shuffler item, with an
        // independent ephemeral key pair.
        let plain = PlainShufflerItem {
            analyzer_item,
            crowd_id: crowd_id(record.metric_hash(), metric_value),
        };
        let layer2 = seal(&shuffler_key, &plain.to_bytes())?;
        let ciphertext: [u8; PLAIN_SHUFFLER_ITEM_LENGTH] = layer2
            .ciphertext
            .as_slice()
            .try_into()
            .map_err(|_| EncodeError::Encryption)?;

        Ok(ShufflerItem {
            ciphertext,
            tag: layer2.tag,
            nonce: layer2.nonce,
            client_public_key: layer2.client_public_key,
        })
    }
}

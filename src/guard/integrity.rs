//! Message integrity signatures.
//!
//! Wire layout: 16-byte random nonce, 8-byte little-endian sequence,
//! 32-byte HMAC-SHA256 over nonce, sequence, and message. Sequences
//! are monotonic per signing key; a verifier remembers the highest
//! sequence seen per origin and refuses replays at or below it.

use crate::auth::constant_time_eq;
use crate::error::{FabricError, Result};
use crate::types::SequenceNumber;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

type HmacSha256 = Hmac<Sha256>;

/// Length of the random nonce prefix.
pub const NONCE_LENGTH: usize = 16;
/// Total signature length: nonce, sequence, digest.
pub const SIGNATURE_LENGTH: usize = NONCE_LENGTH + 8 + 32;

/// Signs outgoing messages and verifies incoming ones.
pub struct MessageIntegrity {
    key: Vec<u8>,
    /// Next outbound sequence.
    send_sequence: AtomicU64,
    /// Highest verified sequence per origin.
    last_seen: RwLock<HashMap<String, SequenceNumber>>,
}

impl MessageIntegrity {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            send_sequence: AtomicU64::new(1),
            last_seen: RwLock::new(HashMap::new()),
        }
    }

    /// Sign a message, consuming the next sequence number.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let sequence = self.send_sequence.fetch_add(1, Ordering::SeqCst);

        let mut nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);

        let digest = self.digest(&nonce, sequence, message)?;

        let mut signature = Vec::with_capacity(SIGNATURE_LENGTH);
        signature.extend_from_slice(&nonce);
        signature.extend_from_slice(&sequence.to_le_bytes());
        signature.extend_from_slice(&digest);
        Ok(signature)
    }

    /// Verify a message signature from an origin, enforcing sequence
    /// monotonicity per origin.
    pub fn verify(&self, origin: &str, message: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != SIGNATURE_LENGTH {
            return Err(FabricError::IntegrityViolation(format!(
                "signature length {} does not match expected {}",
                signature.len(),
                SIGNATURE_LENGTH
            )));
        }

        let nonce = &signature[..NONCE_LENGTH];
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&signature[NONCE_LENGTH..NONCE_LENGTH + 8]);
        let sequence = u64::from_le_bytes(seq_bytes);
        let presented_digest = &signature[NONCE_LENGTH + 8..];

        let expected = self.digest(nonce, sequence, message)?;
        if !constant_time_eq(&expected, presented_digest) {
            return Err(FabricError::IntegrityViolation(
                "digest mismatch".to_string(),
            ));
        }

        // Only advance the watermark after the digest checks out, so a
        // forged high sequence cannot lock out the real sender.
        let mut last_seen = self.last_seen.write();
        let last = last_seen.entry(origin.to_string()).or_insert(0);
        if sequence <= *last {
            return Err(FabricError::IntegrityViolation(format!(
                "replayed sequence {sequence}, highest seen {last}"
            )));
        }
        *last = sequence;

        Ok(())
    }

    /// Forget an origin's sequence watermark, e.g. after key rotation.
    pub fn reset_origin(&self, origin: &str) {
        self.last_seen.write().remove(origin);
    }

    fn digest(&self, nonce: &[u8], sequence: u64, message: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| FabricError::Internal("HMAC key rejected".to_string()))?;
        mac.update(nonce);
        mac.update(&sequence.to_le_bytes());
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

use bitcoin::hashes::{sha256::Hash as Sha256, Hash};
use hex::{DisplayHex, FromHex};
use log::warn;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::Node;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreimageHashPair {
    pub preimage: String,
    pub hash: String,
}

impl PreimageHashPair {
    pub fn generate() -> Self {
        let mut preimage = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        let hash = Sha256::hash(&preimage).to_byte_array();
        Self {
            preimage: preimage.to_lower_hex_string(),
            hash: hash.to_lower_hex_string(),
        }
    }

    pub fn matches(&self) -> bool {
        match <[u8; 32]>::from_hex(&self.preimage) {
            Ok(bytes) => Sha256::hash(&bytes).to_byte_array().to_lower_hex_string() == self.hash,
            Err(_) => false,
        }
    }
}

impl Node {
    /// Fresh payment secret. Kept in memory and persisted under the bare
    /// hash so a separate hook process can resolve the HTLC.
    pub fn new_payment_secret(&self) -> PreimageHashPair {
        let pair = PreimageHashPair::generate();
        self.remember_secret(&pair);
        if let Err(e) = self.store.set_raw(&pair.hash, &pair.preimage) {
            warn!("Node: unable to persist preimage for {}: {:#}", pair.hash, e);
        }
        pair
    }

    fn remember_secret(&self, pair: &PreimageHashPair) {
        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.insert(pair.hash.clone(), pair.preimage.clone());
        }
    }

    pub(crate) fn secret(&self, payment_hash: &str) -> Option<String> {
        self.secrets
            .lock()
            .ok()
            .and_then(|secrets| secrets.get(payment_hash).cloned())
    }

    pub(crate) fn forget_secret(&self, payment_hash: &str) -> bool {
        self.secrets
            .lock()
            .map(|mut secrets| secrets.remove(payment_hash).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_pair() {
        let pair = PreimageHashPair::generate();
        assert_eq!(pair.preimage.len(), 64);
        assert_eq!(pair.hash.len(), 64);
        assert!(pair.matches());
        assert_ne!(pair, PreimageHashPair::generate());
    }

    #[test]
    fn test_known_vector() {
        // sha256 of 32 zero bytes
        let pair = PreimageHashPair {
            preimage: "00".repeat(32),
            hash: "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925".to_string(),
        };
        assert!(pair.matches());
    }

    #[test]
    fn test_mismatch() {
        let mut pair = PreimageHashPair::generate();
        pair.hash = "00".repeat(32);
        assert!(!pair.matches());
        pair.preimage = "zz".to_string();
        assert!(!pair.matches());
    }
}

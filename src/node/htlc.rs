use log::{debug, warn};
use serde::Serialize;

use super::Node;
use crate::db::Store;

/// Answer to lightningd's `htlc_accepted` hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HtlcResolution {
    /// One of our self-payments came back: settle it with the preimage
    Resolve { payment_key: String },
    Continue,
}

/// Look the payment hash up among the persisted secrets.
pub fn resolve_htlc(store: &Store, payment_hash: &str) -> HtlcResolution {
    match store.get_raw(payment_hash) {
        Ok(Some(preimage)) => {
            debug!("HTLC: resolving self-payment {}", payment_hash);
            HtlcResolution::Resolve {
                payment_key: preimage,
            }
        }
        Ok(None) => HtlcResolution::Continue,
        Err(e) => {
            warn!("HTLC: store lookup for {} failed: {:#}", payment_hash, e);
            HtlcResolution::Continue
        }
    }
}

impl Node {
    pub fn on_htlc_accepted(&self, payment_hash: &str) -> HtlcResolution {
        match self.secret(payment_hash) {
            Some(preimage) => HtlcResolution::Resolve {
                payment_key: preimage,
            },
            None => resolve_htlc(&self.store, payment_hash),
        }
    }
}

use log::debug;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLockReadGuard};
use std::time::Instant;

use super::Node;
use crate::client::PeerChannel;

pub const CHANNEL_NORMAL: &str = "CHANNELD_NORMAL";

#[derive(Debug, Clone, Default)]
pub struct Peer {
    pub id: String,
    pub connected: bool,
    pub channels: Vec<PeerChannel>,
}

impl PeerChannel {
    pub fn is_normal(&self) -> bool {
        self.state == CHANNEL_NORMAL
    }

    pub fn spendable(&self) -> u64 {
        self.spendable_msat.unwrap_or(self.to_us_msat)
    }

    pub fn receivable(&self) -> u64 {
        self.receivable_msat
            .unwrap_or(self.total_msat.saturating_sub(self.to_us_msat))
    }

    pub fn scid(&self) -> Option<&str> {
        self.short_channel_id.as_deref()
    }
}

impl Node {
    fn read_peers(&self) -> RwLockReadGuard<'_, HashMap<String, Peer>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the peer cache with a fresh `listpeerchannels`.
    pub async fn refresh_peers(&self) -> anyhow::Result<usize> {
        let start = Instant::now();
        let channels = self.rpc.list_peer_channels().await?;

        let mut fresh: HashMap<String, Peer> = HashMap::new();
        for channel in channels {
            let peer = fresh
                .entry(channel.peer_id.clone())
                .or_insert_with(|| Peer {
                    id: channel.peer_id.clone(),
                    ..Default::default()
                });
            peer.connected |= channel.peer_connected;
            peer.channels.push(channel);
        }
        let count = fresh.len();
        *self.peers.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        debug!("Node: refreshed {} peers in {:?}", count, start.elapsed());
        Ok(count)
    }

    pub fn has_peers(&self) -> bool {
        !self.read_peers().is_empty()
    }

    pub fn has_peer(&self, id: &str) -> bool {
        self.read_peers().contains_key(id)
    }

    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.read_peers().get(id).cloned()
    }

    pub fn peer_channel(&self, scid: &str) -> Option<PeerChannel> {
        self.read_peers()
            .values()
            .flat_map(|p| p.channels.iter())
            .find(|c| c.scid() == Some(scid))
            .cloned()
    }

    /// All our channels that have a short channel id.
    pub fn own_channels(&self) -> Vec<PeerChannel> {
        let peers = self.read_peers();
        let mut channels: Vec<PeerChannel> = peers
            .values()
            .flat_map(|p| p.channels.iter())
            .filter(|c| c.short_channel_id.is_some())
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.short_channel_id.cmp(&b.short_channel_id));
        channels
    }

    /// The channel with `peer` scoring highest under `metric`.
    pub fn best_peer_channel(
        &self,
        peer: &str,
        metric: impl Fn(&PeerChannel) -> u64,
    ) -> Option<PeerChannel> {
        self.read_peers()
            .get(peer)?
            .channels
            .iter()
            .filter(|c| c.short_channel_id.is_some())
            .max_by_key(|c| metric(c))
            .cloned()
    }

    /// Shift `amount_msat` of our balance in the cached channel without
    /// waiting for the next refresh. `outgoing` means we sent through it.
    pub fn shift_channel_balance(&self, scid: &str, amount_msat: u64, outgoing: bool) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(channel) = peers
            .values_mut()
            .flat_map(|p| p.channels.iter_mut())
            .find(|c| c.scid() == Some(scid))
        else {
            return;
        };

        let spendable = channel.spendable();
        let receivable = channel.receivable();
        if outgoing {
            channel.to_us_msat = channel.to_us_msat.saturating_sub(amount_msat);
            channel.spendable_msat = Some(spendable.saturating_sub(amount_msat));
            channel.receivable_msat = Some(receivable.saturating_add(amount_msat));
        } else {
            channel.to_us_msat = channel.to_us_msat.saturating_add(amount_msat);
            channel.spendable_msat = Some(spendable.saturating_add(amount_msat));
            channel.receivable_msat = Some(receivable.saturating_sub(amount_msat));
        }
    }
}

pub mod channel;
pub mod pathfinder;
pub mod route;
pub mod snapshot;
pub mod stats;

pub use channel::{direction, Channel, ChannelId, PPM_SCALE};
pub use route::{PrettyRoute, Route, RouteHop};
pub use stats::GraphStats;

use log::{debug, info};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::client::{GossipChannel, NodeAnnouncement};

/// Channels without a gossip update for this long are dropped.
pub const STALE_AFTER_SECS: u64 = 14 * 24 * 60 * 60;

/// Channel map and adjacency index, always mutated together.
#[derive(Debug, Default)]
pub struct GraphState {
    pub channels: HashMap<ChannelId, Channel>,
    /// destination -> source -> short channel ids
    pub inbound: HashMap<String, HashMap<String, Vec<String>>>,
}

impl GraphState {
    fn link(&mut self, channel: &Channel) {
        let scids = self
            .inbound
            .entry(channel.destination.clone())
            .or_default()
            .entry(channel.source.clone())
            .or_default();
        if !scids.contains(&channel.short_channel_id) {
            scids.push(channel.short_channel_id.clone());
        }
    }

    fn unlink(&mut self, channel: &Channel) {
        let Some(sources) = self.inbound.get_mut(&channel.destination) else {
            return;
        };
        if let Some(scids) = sources.get_mut(&channel.source) {
            scids.retain(|scid| scid != &channel.short_channel_id);
            if scids.is_empty() {
                sources.remove(&channel.source);
            }
        }
        if sources.is_empty() {
            self.inbound.remove(&channel.destination);
        }
    }

    fn insert(&mut self, channel: Channel) {
        self.link(&channel);
        self.channels.insert(channel.id(), channel);
    }

    fn remove(&mut self, id: &ChannelId) -> Option<Channel> {
        let channel = self.channels.remove(id)?;
        self.unlink(&channel);
        Some(channel)
    }

    /// `stamp` marks the belief as learned at that time; aging passes `None`.
    fn set_belief(
        &mut self,
        id: &ChannelId,
        opposite: &ChannelId,
        amount_msat: u64,
        stamp: Option<u64>,
    ) -> bool {
        let Some(channel) = self.channels.get_mut(id) else {
            return false;
        };
        let capacity = channel.capacity_msat;
        let amount = amount_msat.min(capacity);
        channel.liquidity_msat = amount;
        if let Some(stamp) = stamp {
            channel.belief_updated_ms = stamp;
        }
        if let Some(opp) = self.channels.get_mut(opposite) {
            opp.liquidity_msat = capacity - amount;
            if let Some(stamp) = stamp {
                opp.belief_updated_ms = stamp;
            }
        }
        true
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// The public network as seen from our node.
///
/// Lock order: `state` before `aliases`. No method holds `aliases` while
/// acquiring `state`.
#[derive(Debug, Default)]
pub struct Graph {
    state: RwLock<GraphState>,
    aliases: RwLock<HashMap<String, String>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(channels: Vec<Channel>, aliases: HashMap<String, String>) -> Self {
        let mut state = GraphState::default();
        for channel in channels {
            state.insert(channel);
        }
        Self {
            state: RwLock::new(state),
            aliases: RwLock::new(aliases),
        }
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_aliases(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.aliases.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a gossip listing: new channels start at half capacity, known
    /// ones take the fresh policy and keep their belief.
    pub fn refresh_channels(&self, gossip: &[GossipChannel]) -> usize {
        let start = Instant::now();
        let mut state = self.write_state();
        let mut added = 0;
        for g in gossip {
            let id = ChannelId::new(g.short_channel_id.clone(), direction(&g.source, &g.destination));
            match state.channels.get_mut(&id) {
                Some(existing) => existing.apply_gossip(g),
                None => {
                    state.insert(Channel::from_gossip(g));
                    added += 1;
                }
            }
        }
        debug!(
            "Graph: refreshed {} channels ({} new) in {:?}",
            gossip.len(),
            added,
            start.elapsed()
        );
        added
    }

    /// Drop channels whose last gossip update is older than the staleness horizon.
    pub fn prune_channels(&self, now: u64) -> usize {
        let mut state = self.write_state();
        let stale: Vec<ChannelId> = state
            .channels
            .iter()
            .filter(|(_, c)| now.saturating_sub(c.last_update) > STALE_AFTER_SECS)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            state.remove(id);
        }
        if !stale.is_empty() {
            info!("Graph: pruned {} stale channels", stale.len());
        }
        stale.len()
    }

    pub fn refresh_aliases(&self, nodes: &[NodeAnnouncement]) {
        let fresh: HashMap<String, String> = nodes
            .iter()
            .filter_map(|n| {
                n.alias
                    .as_ref()
                    .filter(|a| !a.is_empty())
                    .map(|a| (n.nodeid.clone(), a.clone()))
            })
            .collect();
        *self.aliases.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Alias of a node, falling back to its id.
    pub fn alias(&self, node_id: &str) -> String {
        self.read_aliases()
            .get(node_id)
            .cloned()
            .unwrap_or_else(|| node_id.to_string())
    }

    /// Set `id`'s belief to `amount_msat` (clamped to capacity) and the
    /// opposite direction to the remainder. Returns false if `id` is unknown.
    pub fn update_channel(&self, id: &ChannelId, opposite: &ChannelId, amount_msat: u64) -> bool {
        let updated = self
            .write_state()
            .set_belief(id, opposite, amount_msat, Some(now_ms()));
        if updated {
            debug!("Graph: belief of {} set to {}msat", id, amount_msat);
        }
        updated
    }

    /// Move `amount_msat` of belief from `id` to its opposite direction.
    pub fn debit_channel(&self, id: &ChannelId, amount_msat: u64) -> bool {
        let mut state = self.write_state();
        let Some(current) = state.channels.get(id).map(|c| c.liquidity_msat) else {
            return false;
        };
        state.set_belief(
            id,
            &id.opposite(),
            current.saturating_sub(amount_msat),
            Some(now_ms()),
        )
    }

    /// Adopt beliefs from `channels` that were learned later than ours.
    pub fn merge_beliefs(&self, channels: &[Channel]) -> usize {
        let mut state = self.write_state();
        let mut merged = 0;
        for theirs in channels {
            let id = theirs.id();
            let newer = state
                .channels
                .get(&id)
                .is_some_and(|ours| theirs.belief_updated_ms > ours.belief_updated_ms);
            if newer
                && state.set_belief(
                    &id,
                    &id.opposite(),
                    theirs.liquidity_msat,
                    Some(theirs.belief_updated_ms),
                )
            {
                merged += 1;
            }
        }
        merged
    }

    pub fn get_channel(&self, id: &ChannelId) -> Option<Channel> {
        self.read_state().channels.get(id).cloned()
    }

    pub fn add_channel(&self, channel: Channel) {
        let mut state = self.write_state();
        if let Some(old) = state.channels.get(&channel.id()).cloned() {
            state.unlink(&old);
        }
        state.insert(channel);
    }

    pub fn delete_channel(&self, id: &ChannelId) -> Option<Channel> {
        self.write_state().remove(id)
    }

    pub fn channel_count(&self) -> usize {
        self.read_state().channels.len()
    }

    /// Pull every announced pair toward an even split by `percent` of the gap.
    pub fn age_liquidity(&self, percent: f64) -> usize {
        if percent <= 0.0 {
            return 0;
        }
        let percent = percent.min(1.0);
        let mut state = self.write_state();
        let forward: Vec<ChannelId> = state
            .channels
            .keys()
            .filter(|id| id.direction == 0)
            .cloned()
            .collect();

        let mut aged = 0;
        for id in forward {
            let opposite = id.opposite();
            if !state.channels.contains_key(&opposite) {
                continue;
            }
            let Some(channel) = state.channels.get(&id) else {
                continue;
            };
            let half = channel.capacity_msat / 2;
            let current = channel.liquidity_msat;
            let step = (half.abs_diff(current) as f64 * percent) as u64;
            if step == 0 {
                continue;
            }
            let target = if current < half {
                current + step
            } else {
                current - step
            };
            state.set_belief(&id, &opposite, target, None);
            aged += 1;
        }
        debug!("Graph: aged {} channel pairs by {:.2}", aged, percent);
        aged
    }
}

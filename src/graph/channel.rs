use serde::{Deserialize, Serialize};
use std::fmt;

use crate::client::GossipChannel;

/// Fee rates are expressed per million of the forwarded amount.
pub const PPM_SCALE: u64 = 1_000_000;

/// Direction of a channel between two nodes: 0 when the source sorts first.
pub fn direction(source: &str, destination: &str) -> u8 {
    if source < destination {
        0
    } else {
        1
    }
}

/// Key of one direction of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    pub short_channel_id: String,
    pub direction: u8,
}

impl ChannelId {
    pub fn new(short_channel_id: impl Into<String>, direction: u8) -> Self {
        Self {
            short_channel_id: short_channel_id.into(),
            direction,
        }
    }

    pub fn opposite(&self) -> Self {
        Self {
            short_channel_id: self.short_channel_id.clone(),
            direction: self.direction ^ 1,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.short_channel_id, self.direction)
    }
}

/// One direction of a public channel, annotated with how much we believe it
/// can currently forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub short_channel_id: String,
    pub source: String,
    pub destination: String,
    pub capacity_msat: u64,
    pub base_fee_msat: u64,
    pub fee_rate_ppm: u64,
    pub delay: u32,
    pub htlc_minimum_msat: u64,
    pub htlc_maximum_msat: u64,
    pub active: bool,
    pub last_update: u64,
    pub liquidity_msat: u64,
    /// Unix ms when a payment outcome last set the belief, 0 if never
    #[serde(default)]
    pub belief_updated_ms: u64,
}

impl Channel {
    /// First sighting: we know nothing about the split, so assume half.
    pub fn from_gossip(gossip: &GossipChannel) -> Self {
        let mut channel = Self {
            short_channel_id: gossip.short_channel_id.clone(),
            source: gossip.source.clone(),
            destination: gossip.destination.clone(),
            capacity_msat: gossip.amount_msat,
            base_fee_msat: 0,
            fee_rate_ppm: 0,
            delay: 0,
            htlc_minimum_msat: 0,
            htlc_maximum_msat: 0,
            active: false,
            last_update: 0,
            liquidity_msat: gossip.amount_msat / 2,
            belief_updated_ms: 0,
        };
        channel.apply_gossip(gossip);
        channel
    }

    /// Replace policy attributes from fresh gossip, keeping the belief.
    pub fn apply_gossip(&mut self, gossip: &GossipChannel) {
        self.capacity_msat = gossip.amount_msat;
        self.base_fee_msat = gossip.base_fee_millisatoshi;
        self.fee_rate_ppm = gossip.fee_per_millionth;
        self.delay = gossip.delay;
        self.htlc_minimum_msat = gossip.htlc_minimum_msat;
        self.htlc_maximum_msat = gossip.htlc_maximum_msat.unwrap_or(gossip.amount_msat);
        self.active = gossip.active;
        self.last_update = gossip.last_update;
        self.liquidity_msat = self.liquidity_msat.min(self.capacity_msat);
    }

    pub fn direction(&self) -> u8 {
        direction(&self.source, &self.destination)
    }

    pub fn id(&self) -> ChannelId {
        ChannelId::new(self.short_channel_id.clone(), self.direction())
    }

    pub fn opposite_id(&self) -> ChannelId {
        self.id().opposite()
    }

    /// `base + ceil(amount * rate / 1e6)`, in integers.
    pub fn fee(&self, amount_msat: u64) -> u64 {
        let proportional = (amount_msat as u128 * self.fee_rate_ppm as u128)
            .div_ceil(PPM_SCALE as u128);
        self.base_fee_msat
            .saturating_add(u64::try_from(proportional).unwrap_or(u64::MAX))
    }

    /// Effective fee rate (base fee included) when forwarding `amount_msat`.
    pub fn fee_ppm(&self, amount_msat: u64) -> u64 {
        if amount_msat == 0 {
            return 0;
        }
        let ppm = self.fee(amount_msat) as u128 * PPM_SCALE as u128 / amount_msat as u128;
        u64::try_from(ppm).unwrap_or(u64::MAX)
    }

    pub fn can_forward(&self, amount_msat: u64) -> bool {
        self.active
            && self.liquidity_msat >= amount_msat
            && self.htlc_minimum_msat <= amount_msat
            && amount_msat <= self.htlc_maximum_msat
    }
}

#[cfg(test)]
pub(crate) fn test_channel(scid: &str, source: &str, destination: &str, capacity_sat: u64) -> Channel {
    let capacity_msat = capacity_sat * 1000;
    Channel {
        short_channel_id: scid.to_string(),
        source: source.to_string(),
        destination: destination.to_string(),
        capacity_msat,
        base_fee_msat: 0,
        fee_rate_ppm: 0,
        delay: 6,
        htlc_minimum_msat: 0,
        htlc_maximum_msat: capacity_msat,
        active: true,
        last_update: chrono::Utc::now().timestamp() as u64,
        liquidity_msat: capacity_msat / 2,
        belief_updated_ms: 0,
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

use super::channel::{Channel, PPM_SCALE};
use super::Graph;
use crate::client::SendPayHop;

/// CLTV delta requested for the final hop back to ourselves.
pub const FINAL_CLTV_DELTA: u32 = 18;

#[derive(Debug, Clone, PartialEq)]
pub struct RouteHop {
    pub channel: Channel,
    /// Amount this channel forwards
    pub amount_msat: u64,
    pub delay: u32,
}

/// An ordered path plus the amount it must deliver.
///
/// `source` and `destination` are the endpoints of the searched path; our own
/// boundary hops are spliced on with [`Route::prepend`] and [`Route::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub source: String,
    pub destination: String,
    pub amount_msat: u64,
    pub hops: Vec<RouteHop>,
}

impl Route {
    pub fn new(source: &str, destination: &str, amount_msat: u64, hops: Vec<RouteHop>) -> Self {
        let mut route = Self {
            source: source.to_string(),
            destination: destination.to_string(),
            amount_msat,
            hops,
        };
        route.recompute();
        route
    }

    pub fn prepend(&mut self, channel: Channel) {
        self.hops.insert(
            0,
            RouteHop {
                channel,
                amount_msat: 0,
                delay: 0,
            },
        );
        self.recompute();
    }

    pub fn append(&mut self, channel: Channel) {
        self.hops.push(RouteHop {
            channel,
            amount_msat: 0,
            delay: 0,
        });
        self.recompute();
    }

    /// Walk back from the receiver: each hop carries what the next one
    /// forwards plus the next channel's fee, and waits the next channel's delta.
    fn recompute(&mut self) {
        let Some(last) = self.hops.last_mut() else {
            return;
        };
        last.amount_msat = self.amount_msat;
        last.delay = FINAL_CLTV_DELTA;
        for i in (0..self.hops.len() - 1).rev() {
            let next = &self.hops[i + 1];
            let amount = next
                .amount_msat
                .saturating_add(next.channel.fee(next.amount_msat));
            let delay = next.delay.saturating_add(next.channel.delay);
            self.hops[i].amount_msat = amount;
            self.hops[i].delay = delay;
        }
    }

    pub fn fee(&self) -> u64 {
        self.hops
            .first()
            .map(|h| h.amount_msat.saturating_sub(self.amount_msat))
            .unwrap_or(0)
    }

    pub fn fee_ppm(&self) -> u64 {
        if self.amount_msat == 0 {
            return 0;
        }
        (self.fee() as u128 * PPM_SCALE as u128 / self.amount_msat as u128) as u64
    }

    pub fn to_sendpay(&self) -> Vec<SendPayHop> {
        self.hops
            .iter()
            .map(|h| SendPayHop {
                id: h.channel.destination.clone(),
                channel: h.channel.short_channel_id.clone(),
                direction: h.channel.direction(),
                amount_msat: h.amount_msat,
                delay: h.delay,
            })
            .collect()
    }

    pub fn pretty(&self, graph: &Graph) -> PrettyRoute {
        let aliases = graph.read_aliases();
        let alias = |id: &str| aliases.get(id).cloned().unwrap_or_else(|| id.to_string());

        let hops = self
            .hops
            .iter()
            .enumerate()
            .map(|(i, hop)| {
                // the node forwarding over this hop charged what it kept
                let fee_msat = match i {
                    0 => 0,
                    _ => self.hops[i - 1].amount_msat.saturating_sub(hop.amount_msat),
                };
                let ppm = if hop.amount_msat == 0 {
                    0
                } else {
                    fee_msat * PPM_SCALE / hop.amount_msat
                };
                PrettyRouteHop {
                    id: hop.channel.source.clone(),
                    alias: alias(&hop.channel.source),
                    short_channel_id: hop.channel.short_channel_id.clone(),
                    amount_msat: hop.amount_msat,
                    delay: hop.delay,
                    fee_msat,
                    ppm,
                }
            })
            .collect();

        PrettyRoute {
            source_id: self.source.clone(),
            destination_id: self.destination.clone(),
            source_alias: alias(&self.source),
            destination_alias: alias(&self.destination),
            amount_sat: self.amount_msat / 1000,
            fee_msat: self.fee(),
            ppm: self.fee_ppm(),
            hops,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrettyRouteHop {
    pub id: String,
    pub alias: String,
    pub short_channel_id: String,
    pub amount_msat: u64,
    pub delay: u32,
    pub fee_msat: u64,
    pub ppm: u64,
}

/// Human-oriented view of a route, used in results, logs and stored records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrettyRoute {
    pub source_id: String,
    pub destination_id: String,
    pub source_alias: String,
    pub destination_alias: String,
    pub amount_sat: u64,
    pub fee_msat: u64,
    pub ppm: u64,
    pub hops: Vec<PrettyRouteHop>,
}

impl PrettyRoute {
    pub fn simple(&self) -> String {
        let path: Vec<String> = self
            .hops
            .iter()
            .map(|h| format!("=> {} ({}ppm)", h.alias, h.ppm))
            .collect();
        format!(
            "Sending {} sats from [{}] to [{}] over {} hops, costing {}msat ({} ppm) via {}",
            self.amount_sat,
            self.source_alias,
            self.destination_alias,
            self.hops.len(),
            self.fee_msat,
            self.ppm,
            path.join(" ")
        )
    }
}

impl fmt::Display for PrettyRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Route from: {} to: {}", self.source_alias, self.destination_alias)?;
        writeln!(f, "Amount: {} sat", self.amount_sat)?;
        writeln!(f, "Fee: {}msat ({} ppm)", self.fee_msat, self.ppm)?;
        write!(f, "Hops: {}", self.hops.len())?;
        for (i, hop) in self.hops.iter().enumerate() {
            write!(
                f,
                "\nHop {:2}: {:>40}, fee: {:8.3}, ppm: {:5}, scid: {}, delay: {}",
                i + 1,
                hop.alias,
                hop.fee_msat as f64 / 1000.0,
                hop.ppm,
                hop.short_channel_id,
                hop.delay
            )?;
        }
        Ok(())
    }
}

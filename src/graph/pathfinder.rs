use log::debug;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Instant;

use super::channel::{direction, ChannelId};
use super::route::RouteHop;
use super::Graph;
use crate::error::RebalanceError;

/// Frontier entry of the backward search. Ordered so that `BinaryHeap`
/// pops the cheapest entry first.
#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    cost_msat: u64,
    node: String,
    /// Amount that must arrive at `node`
    amount_msat: u64,
    delay: u32,
    hops: usize,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost_msat
            .cmp(&self.cost_msat)
            .then_with(|| other.hops.cmp(&self.hops))
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Graph {
    /// Cheapest path from `src` to `dst` able to deliver `amount_msat` to
    /// `dst`, using at most `max_hops` channels and avoiding `exclude`.
    ///
    /// The search runs from `dst` back toward `src` because what a channel
    /// must carry depends on the fees of the channels after it. Each hop
    /// carries the amount its channel forwards; `delay` is the CLTV delta
    /// accumulated after it. The graph is read-locked for the whole search.
    pub fn find_route(
        &self,
        src: &str,
        dst: &str,
        amount_msat: u64,
        exclude: &HashSet<String>,
        max_hops: usize,
    ) -> Result<Vec<RouteHop>, RebalanceError> {
        if amount_msat == 0 {
            return Err(RebalanceError::ZeroAmount);
        }
        if src == dst {
            return Ok(Vec::new());
        }
        if max_hops == 0 {
            return Err(RebalanceError::NoRoute);
        }

        let start = Instant::now();
        let state = self.read_state();

        // labels are per (node, hops from dst): a cheaper but longer path
        // must not shadow a shorter one that still fits the budget
        let mut best: HashMap<(&str, usize), u64> = HashMap::new();
        let mut next_hop: HashMap<(&str, usize), RouteHop> = HashMap::new();
        let mut queue = BinaryHeap::new();
        best.insert((dst, 0), 0);
        queue.push(QueueEntry {
            cost_msat: 0,
            node: dst.to_string(),
            amount_msat,
            delay: 0,
            hops: 0,
        });

        let mut reached = None;
        while let Some(entry) = queue.pop() {
            if entry.node == src {
                reached = Some(entry.hops);
                break;
            }
            let label = (entry.node.as_str(), entry.hops);
            if entry.cost_msat > best.get(&label).copied().unwrap_or(u64::MAX) {
                continue;
            }
            if entry.hops >= max_hops {
                continue;
            }
            let Some(sources) = state.inbound.get(&entry.node) else {
                continue;
            };

            for (from, scids) in sources {
                if exclude.contains(from) {
                    continue;
                }
                for scid in scids {
                    let id = ChannelId::new(scid.clone(), direction(from, &entry.node));
                    let Some(channel) = state.channels.get(&id) else {
                        continue;
                    };
                    if !channel.can_forward(entry.amount_msat) {
                        continue;
                    }
                    let fee = channel.fee(entry.amount_msat);
                    let cost = entry.cost_msat.saturating_add(fee);
                    let from_label = (from.as_str(), entry.hops + 1);
                    if cost < best.get(&from_label).copied().unwrap_or(u64::MAX) {
                        best.insert(from_label, cost);
                        next_hop.insert(
                            from_label,
                            RouteHop {
                                channel: channel.clone(),
                                amount_msat: entry.amount_msat,
                                delay: entry.delay,
                            },
                        );
                        queue.push(QueueEntry {
                            cost_msat: cost,
                            node: from.clone(),
                            amount_msat: entry.amount_msat.saturating_add(fee),
                            delay: entry.delay.saturating_add(channel.delay),
                            hops: entry.hops + 1,
                        });
                    }
                }
            }
        }

        let Some(mut remaining) = reached else {
            debug!("Graph: no route from {} to {} ({:?})", src, dst, start.elapsed());
            return Err(RebalanceError::NoRoute);
        };

        let mut hops = Vec::with_capacity(remaining);
        let mut node = src;
        while remaining > 0 {
            let Some(hop) = next_hop.get(&(node, remaining)) else {
                return Err(RebalanceError::NoRoute);
            };
            node = hop.channel.destination.as_str();
            hops.push(hop.clone());
            remaining -= 1;
        }
        if node != dst {
            return Err(RebalanceError::NoRoute);
        }
        debug!(
            "Graph: found {}-hop route from {} to {} in {:?}",
            hops.len(),
            src,
            dst,
            start.elapsed()
        );
        Ok(hops)
    }
}

/// Total fee charged by the channels of a path at the amounts they carry.
pub fn path_fee(hops: &[RouteHop]) -> u64 {
    hops.iter()
        .map(|h| h.channel.fee(h.amount_msat))
        .fold(0u64, u64::saturating_add)
}

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use super::Graph;

/// 200k sat, the size of a typical rebalance
const LIQUID_THRESHOLD_MSAT: u64 = 200_000_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub channels: usize,
    pub active_channels: usize,
    pub liquid_channels: usize,
    pub max_htlc_channels: usize,
}

impl Graph {
    pub fn stats(&self) -> GraphStats {
        let state = self.read_state();
        let mut nodes = HashSet::new();
        let mut stats = GraphStats {
            channels: state.channels.len(),
            ..Default::default()
        };
        for channel in state.channels.values() {
            nodes.insert(channel.source.as_str());
            nodes.insert(channel.destination.as_str());
            if channel.active {
                stats.active_channels += 1;
            }
            if channel.liquidity_msat >= LIQUID_THRESHOLD_MSAT {
                stats.liquid_channels += 1;
            }
            if channel.htlc_maximum_msat >= LIQUID_THRESHOLD_MSAT {
                stats.max_htlc_channels += 1;
            }
        }
        stats.nodes = nodes.len();
        stats
    }
}

impl fmt::Display for GraphStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "graph has {} nodes, {} channels ({} active), {} believed to hold at least 200k sat, {} with max htlc of at least 200k sat",
            self.nodes, self.channels, self.active_channels, self.liquid_channels, self.max_htlc_channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::channel::test_channel;

    #[test]
    fn test_stats() {
        let graph = Graph::new();
        graph.add_channel(test_channel("1x1x1", "a", "b", 1_000_000));
        let mut small = test_channel("2x2x2", "b", "c", 100_000);
        small.active = false;
        graph.add_channel(small);

        let stats = graph.stats();
        assert_eq!(
            stats,
            GraphStats {
                nodes: 3,
                channels: 2,
                active_channels: 1,
                liquid_channels: 1,
                max_htlc_channels: 1,
            }
        );
        assert!(stats.to_string().starts_with("graph has 3 nodes"));
    }
}

use log::{info, warn};
use std::sync::Arc;

use super::attempt::{Rebalance, RebalanceParams};
use super::result::RebalanceResult;
use crate::client::PeerChannel;
use crate::error::{RebalanceError, Side};
use crate::graph::{direction, Channel, ChannelId};
use crate::node::Node;

/// Rebalance from our best channel with `out_node` into our best channel
/// with `in_node`. Result endpoints are the node ids as given.
pub async fn rebalance_by_node(
    node: Arc<Node>,
    out_node: Option<&str>,
    in_node: Option<&str>,
    params: RebalanceParams,
) -> RebalanceResult {
    let outgoing = out_node.unwrap_or_default();
    let incoming = in_node.unwrap_or_default();
    let amount_sat = params
        .amount_sat
        .unwrap_or(node.settings.rebalance.default_amount_sat);
    info!("Rebalance: by node {} -> {}", outgoing, incoming);

    let mut result = match setup(node, out_node, in_node, params).await {
        Ok(rebalance) => rebalance.run().await,
        Err(e) => {
            info!("Rebalance: rejected: {}", e);
            RebalanceResult::failure(outgoing, incoming, amount_sat, 0, e)
        }
    };
    result.outgoing = outgoing.to_string();
    result.incoming = incoming.to_string();
    result
}

async fn setup(
    node: Arc<Node>,
    out_node: Option<&str>,
    in_node: Option<&str>,
    params: RebalanceParams,
) -> Result<Rebalance, RebalanceError> {
    let out_node = out_node
        .filter(|id| !id.is_empty())
        .ok_or(RebalanceError::MissingParameter("out node"))?;
    let in_node = in_node
        .filter(|id| !id.is_empty())
        .ok_or(RebalanceError::MissingParameter("in node"))?;

    if let Err(e) = node.refresh_peers().await {
        warn!("Rebalance: unable to refresh peers: {:#}", e);
    }
    if !node.has_peers() {
        return Err(RebalanceError::NoPeers);
    }
    if out_node == node.id || in_node == node.id {
        return Err(RebalanceError::SelfNode);
    }
    if out_node == in_node {
        return Err(RebalanceError::SameEndpoints);
    }
    for peer in [out_node, in_node] {
        if !node.has_peer(peer) {
            return Err(RebalanceError::NoPeer(peer.to_string()));
        }
    }

    let out_channel = graph_channel(&node, out_node, Side::Outgoing)?;
    let in_channel = graph_channel(&node, in_node, Side::Incoming)?;
    Rebalance::setup(node, out_channel, in_channel, params)
}

/// Our best channel with `peer` as seen in the graph: the most spendable one
/// going out, the most receivable one coming in.
fn graph_channel(node: &Node, peer: &str, side: Side) -> Result<Channel, RebalanceError> {
    let (metric, dir): (fn(&PeerChannel) -> u64, u8) = match side {
        Side::Outgoing => (PeerChannel::spendable, direction(&node.id, peer)),
        Side::Incoming => (PeerChannel::receivable, direction(peer, &node.id)),
    };
    let scid = node
        .best_peer_channel(peer, metric)
        .and_then(|c| c.short_channel_id)
        .ok_or_else(|| RebalanceError::NoPeer(peer.to_string()))?;
    node.graph
        .get_channel(&ChannelId::new(scid.clone(), dir))
        .ok_or(RebalanceError::NoGraphChannel(side, scid))
}

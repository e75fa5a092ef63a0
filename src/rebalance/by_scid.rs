use log::info;
use std::sync::Arc;

use super::attempt::{Rebalance, RebalanceParams};
use super::result::RebalanceResult;
use crate::error::{RebalanceError, Side};
use crate::graph::{direction, Channel, ChannelId};
use crate::node::Node;

/// Rebalance out of our channel `out_scid` and back in through `in_scid`.
pub async fn rebalance_by_scid(
    node: Arc<Node>,
    out_scid: Option<&str>,
    in_scid: Option<&str>,
    params: RebalanceParams,
) -> RebalanceResult {
    let outgoing = out_scid.unwrap_or_default();
    let incoming = in_scid.unwrap_or_default();
    let amount_sat = params
        .amount_sat
        .unwrap_or(node.settings.rebalance.default_amount_sat);
    info!("Rebalance: by channel {} -> {}", outgoing, incoming);

    match setup(node, out_scid, in_scid, params) {
        Ok(rebalance) => rebalance.run().await,
        Err(e) => {
            info!("Rebalance: rejected: {}", e);
            RebalanceResult::failure(outgoing, incoming, amount_sat, 0, e)
        }
    }
}

fn setup(
    node: Arc<Node>,
    out_scid: Option<&str>,
    in_scid: Option<&str>,
    params: RebalanceParams,
) -> Result<Rebalance, RebalanceError> {
    let out_scid = out_scid
        .filter(|s| !s.is_empty())
        .ok_or(RebalanceError::MissingParameter("out channel"))?;
    let in_scid = in_scid
        .filter(|s| !s.is_empty())
        .ok_or(RebalanceError::MissingParameter("in channel"))?;
    if out_scid == in_scid {
        return Err(RebalanceError::SameEndpoints);
    }

    let out_channel = own_channel(&node, out_scid, Side::Outgoing)?;
    let in_channel = own_channel(&node, in_scid, Side::Incoming)?;
    Rebalance::setup(node, out_channel, in_channel, params)
}

/// The graph direction of one of our channels: from us when outgoing,
/// toward us when incoming.
pub(crate) fn own_channel(node: &Node, scid: &str, side: Side) -> Result<Channel, RebalanceError> {
    let peer = node
        .peer_channel(scid)
        .ok_or_else(|| RebalanceError::NoPeerChannel(scid.to_string()))?
        .peer_id;
    let dir = match side {
        Side::Outgoing => direction(&node.id, &peer),
        Side::Incoming => direction(&peer, &node.id),
    };
    node.graph
        .get_channel(&ChannelId::new(scid, dir))
        .ok_or_else(|| RebalanceError::NoGraphChannel(side, scid.to_string()))
}

use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use super::result::RebalanceResult;
use crate::db::ROUTE_PREFIX;
use crate::error::{RebalanceError, Side};
use crate::graph::{Channel, PrettyRoute, Route};
use crate::node::{LiquidityUpdate, Node};

/// Our first and last hop are part of every route.
pub const OWN_HOPS: usize = 2;
/// Total hop budget tried first before widening toward `max_hops`.
pub const FIRST_HOP_BUDGET: usize = 3;

/// Caller-supplied knobs; unset fields take the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct RebalanceParams {
    pub amount_sat: Option<u64>,
    pub max_ppm: Option<u64>,
    pub attempts: Option<u32>,
    pub max_hops: Option<usize>,
}

/// One circular payment from `out_channel` back in through `in_channel`.
pub struct Rebalance {
    node: Arc<Node>,
    pub out_channel: Channel,
    pub in_channel: Channel,
    pub amount_msat: u64,
    pub max_ppm: u64,
    pub attempts: u32,
    pub max_hops: usize,
}

impl Rebalance {
    /// Apply defaults and check both endpoint channels can take the payment.
    pub fn setup(
        node: Arc<Node>,
        out_channel: Channel,
        in_channel: Channel,
        params: RebalanceParams,
    ) -> Result<Self, RebalanceError> {
        let defaults = &node.settings.rebalance;
        let amount_sat = params.amount_sat.unwrap_or(defaults.default_amount_sat);
        if amount_sat == 0 {
            return Err(RebalanceError::ZeroAmount);
        }
        let attempts = params.attempts.unwrap_or(defaults.default_attempts);
        if attempts == 0 {
            return Err(RebalanceError::InvalidParameter(
                "attempts must be at least 1".to_string(),
            ));
        }
        if out_channel.short_channel_id == in_channel.short_channel_id {
            return Err(RebalanceError::SameEndpoints);
        }

        let rebalance = Self {
            max_ppm: params.max_ppm.unwrap_or(defaults.default_max_ppm),
            max_hops: params.max_hops.unwrap_or(defaults.default_max_hops),
            amount_msat: amount_sat.saturating_mul(1000),
            attempts,
            out_channel,
            in_channel,
            node,
        };
        debug!(
            "Rebalance: {} -> {} amount {}msat maxppm {} attempts {} maxhops {}",
            rebalance.out_channel.short_channel_id,
            rebalance.in_channel.short_channel_id,
            rebalance.amount_msat,
            rebalance.max_ppm,
            rebalance.attempts,
            rebalance.max_hops
        );
        rebalance.validate()?;
        Ok(rebalance)
    }

    /// Both endpoint channels are normal, their peers connected, and each
    /// side has room for the amount.
    pub fn validate(&self) -> Result<(), RebalanceError> {
        let out_scid = &self.out_channel.short_channel_id;
        let in_scid = &self.in_channel.short_channel_id;
        let outgoing = self
            .node
            .peer_channel(out_scid)
            .ok_or_else(|| RebalanceError::NoPeerChannel(out_scid.clone()))?;
        let incoming = self
            .node
            .peer_channel(in_scid)
            .ok_or_else(|| RebalanceError::NoPeerChannel(in_scid.clone()))?;

        if !incoming.is_normal() {
            return Err(RebalanceError::ChannelNotNormal(Side::Incoming));
        }
        if !outgoing.is_normal() {
            return Err(RebalanceError::ChannelNotNormal(Side::Outgoing));
        }
        if !incoming.peer_connected {
            return Err(RebalanceError::PeerDisconnected(Side::Incoming));
        }
        if !outgoing.peer_connected {
            return Err(RebalanceError::PeerDisconnected(Side::Outgoing));
        }
        if incoming.receivable() < self.amount_msat {
            return Err(RebalanceError::InsufficientBalance(Side::Incoming));
        }
        if outgoing.spendable() < self.amount_msat {
            return Err(RebalanceError::InsufficientBalance(Side::Outgoing));
        }
        Ok(())
    }

    /// Latest gossip for one of our endpoint channels.
    fn current(&self, channel: &Channel) -> Channel {
        self.node
            .graph
            .get_channel(&channel.id())
            .unwrap_or_else(|| channel.clone())
    }

    /// Cheapest circular route within `max_hops` total hops.
    pub fn get_route(&self, max_hops: usize) -> Result<Route, RebalanceError> {
        if max_hops < OWN_HOPS {
            return Err(RebalanceError::NoRoute);
        }
        let src = self.out_channel.destination.as_str();
        let dst = self.in_channel.source.as_str();
        let exclude = HashSet::from([self.node.id.clone()]);

        let interior = self.node.graph.find_route(
            src,
            dst,
            self.amount_msat,
            &exclude,
            max_hops - OWN_HOPS,
        )?;
        let mut route = Route::new(src, dst, self.amount_msat, interior);
        route.prepend(self.current(&self.out_channel));
        route.append(self.current(&self.in_channel));

        if route.fee_ppm() > self.max_ppm {
            return Err(RebalanceError::RouteTooExpensive {
                fee_ppm: route.fee_ppm(),
                max_ppm: self.max_ppm,
            });
        }
        Ok(route)
    }

    async fn try_route(&self, max_hops: usize) -> Result<(Route, PrettyRoute), RebalanceError> {
        let start = Instant::now();
        let route = self.get_route(max_hops)?;
        let pretty = route.pretty(&self.node.graph);
        debug!("Rebalance: route found in {:?}\n{}", start.elapsed(), pretty);
        info!("Rebalance: {}", pretty.simple());

        if self.node.settings.dry_run {
            info!("Rebalance: dry run, payment not sent");
            return Ok((route, pretty));
        }

        let secret = self.node.new_payment_secret();
        self.node
            .save_record(&format!("{}{}", ROUTE_PREFIX, secret.hash), &pretty);
        self.node.send_pay(&route, &secret.hash).await?;
        Ok((route, pretty))
    }

    /// Every hop of a settled route carried its amount.
    async fn apply_success(&self, route: &Route) {
        for hop in &route.hops {
            self.node
                .queue_liquidity_update(LiquidityUpdate::Spent {
                    channel: hop.channel.id(),
                    amount_msat: hop.amount_msat,
                })
                .await;
        }
    }

    fn failed(&self, attempts: u32, error: RebalanceError) -> RebalanceResult {
        info!("Rebalance: failed after {} attempts: {}", attempts, error);
        RebalanceResult::failure(
            &self.out_channel.short_channel_id,
            &self.in_channel.short_channel_id,
            self.amount_msat / 1000,
            attempts,
            error,
        )
    }

    /// Retry loop: routing failures widen the hop budget for free, transient
    /// payment failures use up an attempt, anything else ends the run.
    pub async fn run(&self) -> RebalanceResult {
        let start = Instant::now();
        let mut hops = FIRST_HOP_BUDGET.min(self.max_hops);
        let mut used = 0;
        let mut tries = 0;
        let mut last_error = RebalanceError::NoRoute;

        while used < self.attempts {
            tries += 1;
            if let Err(e) = self.validate() {
                return self.failed(tries, e);
            }
            match self.try_route(hops).await {
                Ok((route, pretty)) => {
                    let message = if self.node.settings.dry_run {
                        format!("dry run: {}", pretty.simple())
                    } else {
                        self.apply_success(&route).await;
                        format!(
                            "successfully rebalanced {} sats from {} to {} at {} ppm. Total fees paid: {:.3} sats",
                            pretty.amount_sat,
                            self.out_channel.short_channel_id,
                            self.in_channel.short_channel_id,
                            pretty.ppm,
                            pretty.fee_msat as f64 / 1000.0
                        )
                    };
                    info!("Rebalance: {} ({:?})", message, start.elapsed());
                    return RebalanceResult::success(
                        &self.out_channel.short_channel_id,
                        &self.in_channel.short_channel_id,
                        tries,
                        pretty,
                        message,
                    );
                }
                Err(e) if e.escalates_hops() => {
                    if hops >= self.max_hops {
                        return self.failed(tries, e);
                    }
                    debug!("Rebalance: {} at {} hops, widening", e, hops);
                    hops += 1;
                    last_error = e;
                }
                Err(e) if e.is_retryable() => {
                    debug!("Rebalance: attempt {} failed: {}", used + 1, e);
                    used += 1;
                    last_error = e;
                }
                Err(e) => return self.failed(tries, e),
            }
        }
        self.failed(tries, last_error)
    }
}

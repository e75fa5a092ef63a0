//! Split-payment campaigns against one of our channels.
//!
//! A campaign pulls liquidity into a target channel from many candidate
//! channels ([`pull`]), or pushes it out of a target channel into many
//! candidates ([`push`]). At most `splits` split payments are in flight at
//! once. Every split is its own [`Rebalance`] task; all of them report back
//! to the campaign's control loop, which alone owns the counters and the
//! candidate queue.

pub mod pull;
pub mod push;
pub mod result;

pub use pull::{rebalance_pull, PullParams};
pub use push::{rebalance_push, PushParams};
pub use result::ParallelResult;

use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::attempt::{Rebalance, RebalanceParams};
use super::by_scid::own_channel;
use super::result::RebalanceResult;
use crate::client::PeerChannel;
use crate::error::{RebalanceError, Side};
use crate::graph::Channel;
use crate::node::Node;

/// Knobs shared by pull and push; unset fields take the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct ParallelParams {
    pub amount_sat: Option<u64>,
    pub max_ppm: Option<u64>,
    pub splits: Option<usize>,
    pub split_amount_sat: Option<u64>,
    pub attempts: Option<u32>,
    pub max_hops: Option<usize>,
    /// Explicit candidate scids; bypasses the out-ppm filter
    pub candidates: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Fill the target's local side from candidates with outbound fee below `max_out_ppm`
    Pull { max_out_ppm: Option<u64> },
    /// Empty the target's local side into candidates with outbound fee above `min_out_ppm`
    Push { min_out_ppm: Option<u64> },
}

impl Mode {
    /// Which of our channel directions the target is.
    fn target_side(&self) -> Side {
        match self {
            Mode::Pull { .. } => Side::Incoming,
            Mode::Push { .. } => Side::Outgoing,
        }
    }

    fn candidate_side(&self) -> Side {
        match self {
            Mode::Pull { .. } => Side::Outgoing,
            Mode::Push { .. } => Side::Incoming,
        }
    }
}

/// Balance a candidate must keep on its far side: `min(amount, percent * capacity)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub percent: f64,
    pub amount_msat: u64,
}

impl Threshold {
    pub fn for_capacity(&self, capacity_msat: u64) -> u64 {
        self.amount_msat
            .min((capacity_msat as f64 * self.percent) as u64)
    }
}

/// A validated campaign, ready to [`Campaign::run`].
pub struct Campaign {
    node: Arc<Node>,
    mode: Mode,
    target: Channel,
    amount_msat: u64,
    split_msat: u64,
    splits: usize,
    split_params: RebalanceParams,
    threshold: Threshold,
    candidates: VecDeque<Channel>,
    rebalanced_msat: u64,
    in_flight_msat: u64,
    result: ParallelResult,
}

/// What a split task hands back to the control loop.
struct SplitOutcome {
    candidate: Channel,
    result: RebalanceResult,
}

impl Campaign {
    /// Apply defaults, validate, resolve the target and discover candidates.
    pub async fn setup(
        node: Arc<Node>,
        mode: Mode,
        target_scid: Option<&str>,
        params: ParallelParams,
        threshold: Threshold,
    ) -> Result<Self, RebalanceError> {
        let defaults = &node.settings.parallel;
        let amount_sat = params.amount_sat.unwrap_or(defaults.default_amount_sat);
        let split_sat = params
            .split_amount_sat
            .unwrap_or(defaults.default_split_amount_sat);
        let splits = params.splits.unwrap_or(defaults.default_splits);
        validate(amount_sat, split_sat, splits, threshold.percent)?;
        let (Some(amount_msat), Some(split_msat)) =
            (amount_sat.checked_mul(1000), split_sat.checked_mul(1000))
        else {
            return Err(RebalanceError::InvalidParameter(
                "amount is too large".to_string(),
            ));
        };

        let target_scid = target_scid
            .filter(|s| !s.is_empty())
            .ok_or(match mode.target_side() {
                Side::Incoming => RebalanceError::MissingParameter("in channel"),
                Side::Outgoing => RebalanceError::MissingParameter("out channel"),
            })?;

        if let Err(e) = node.refresh_peers().await {
            warn!("Parallel: unable to refresh peers: {:#}", e);
        }
        if !node.has_peers() {
            return Err(RebalanceError::NoPeers);
        }
        let target = own_channel(&node, target_scid, mode.target_side())?;

        let rebalance = &node.settings.rebalance;
        let split_params = RebalanceParams {
            amount_sat: Some(split_sat),
            max_ppm: Some(params.max_ppm.unwrap_or(rebalance.default_max_ppm)),
            attempts: Some(params.attempts.unwrap_or(rebalance.default_attempts)),
            max_hops: Some(params.max_hops.unwrap_or(rebalance.default_max_hops)),
        };

        let mut campaign = Self {
            result: ParallelResult::new(amount_sat),
            amount_msat,
            split_msat,
            candidates: VecDeque::new(),
            rebalanced_msat: 0,
            in_flight_msat: 0,
            node,
            mode,
            target,
            splits,
            split_params,
            threshold,
        };
        campaign.find_candidates(params.candidates.as_deref())?;
        Ok(campaign)
    }

    fn max_ppm(&self) -> u64 {
        self.split_params.max_ppm.unwrap_or_default()
    }

    /// Queue our other channels, in discovery order, that pass the mode's fee filter.
    fn find_candidates(&mut self, allow_list: Option<&[String]>) -> Result<(), RebalanceError> {
        let target_peer = match self.mode.target_side() {
            Side::Incoming => self.target.source.clone(),
            Side::Outgoing => self.target.destination.clone(),
        };
        let allowed: Option<HashSet<&str>> =
            allow_list.map(|list| list.iter().map(String::as_str).collect());

        for peer_channel in self.node.own_channels() {
            let Some(scid) = peer_channel.scid() else {
                continue;
            };
            if peer_channel.peer_id == target_peer {
                continue;
            }
            if let Some(allowed) = &allowed {
                if !allowed.contains(scid) {
                    continue;
                }
            }
            let Ok(candidate) = own_channel(&self.node, scid, self.mode.candidate_side()) else {
                debug!("Parallel: {} is not in the graph", scid);
                continue;
            };
            let good = match self.mode {
                Mode::Pull { max_out_ppm } => {
                    pull::is_good_candidate(&candidate, self.split_msat, max_out_ppm)
                }
                Mode::Push { min_out_ppm } => push::is_good_candidate(
                    &self.node,
                    &candidate,
                    self.split_msat,
                    self.max_ppm(),
                    min_out_ppm,
                ),
            };
            if good {
                debug!("Parallel: candidate {}", scid);
                self.candidates.push_back(candidate);
            }
        }

        if self.candidates.is_empty() {
            return Err(RebalanceError::NoCandidates);
        }
        info!("Parallel: found {} candidates", self.candidates.len());
        Ok(())
    }

    /// A candidate is usable right now: normal, connected and not past its threshold.
    fn can_use(&self, channel: &PeerChannel) -> Result<(), RebalanceError> {
        let side = self.mode.candidate_side();
        match self.mode {
            Mode::Pull { .. } => pull::check_deplete(channel, self.split_msat, &self.threshold)?,
            Mode::Push { .. } => push::check_fill(channel, self.split_msat, &self.threshold)?,
        }
        if !channel.is_normal() {
            return Err(RebalanceError::ChannelNotNormal(side));
        }
        if !channel.peer_connected {
            return Err(RebalanceError::PeerDisconnected(side));
        }
        Ok(())
    }

    /// Pop candidates until one is usable; unusable ones are dropped.
    fn next_candidate(&mut self) -> Option<Channel> {
        while let Some(candidate) = self.candidates.pop_front() {
            let Some(peer_channel) = self.node.peer_channel(&candidate.short_channel_id) else {
                debug!("Parallel: {} is no longer ours", candidate.short_channel_id);
                continue;
            };
            match self.can_use(&peer_channel) {
                Ok(()) => return Some(candidate),
                Err(e) => debug!("Parallel: skipping {}: {}", candidate.short_channel_id, e),
            }
        }
        None
    }

    fn carry_on(&self) -> bool {
        self.rebalanced_msat + self.in_flight_msat < self.amount_msat
            && ((self.in_flight_msat / self.split_msat) as usize) < self.splits
    }

    /// Launch splits while below both the target and the concurrency cap.
    fn fire_candidates(&mut self, tasks: &mut JoinSet<SplitOutcome>) -> usize {
        let mut fired = 0;
        while self.carry_on() {
            let Some(candidate) = self.next_candidate() else {
                debug!("Parallel: no candidate left");
                break;
            };
            self.fire(candidate, tasks);
            fired += 1;
        }
        fired
    }

    fn fire(&mut self, candidate: Channel, tasks: &mut JoinSet<SplitOutcome>) {
        debug!("Parallel: firing {}", candidate.short_channel_id);
        let (out_channel, in_channel) = match self.mode {
            Mode::Pull { .. } => (candidate.clone(), self.target.clone()),
            Mode::Push { .. } => (self.target.clone(), candidate.clone()),
        };
        let node = self.node.clone();
        let params = self.split_params.clone();
        let split_sat = self.split_msat / 1000;

        self.in_flight_msat += self.split_msat;
        tasks.spawn(async move {
            let outgoing = out_channel.short_channel_id.clone();
            let incoming = in_channel.short_channel_id.clone();
            let result = match Rebalance::setup(node, out_channel, in_channel, params) {
                Ok(rebalance) => rebalance.run().await,
                Err(e) => RebalanceResult::failure(&outgoing, &incoming, split_sat, 0, e),
            };
            SplitOutcome { candidate, result }
        });
    }

    /// Account for one finished split.
    fn on_outcome(&mut self, outcome: SplitOutcome) {
        self.in_flight_msat = self.in_flight_msat.saturating_sub(self.split_msat);
        let SplitOutcome { candidate, result } = outcome;
        self.result.attempts += result.attempts;

        if !result.is_success() {
            debug!("Parallel: split via {} failed: {}", candidate.short_channel_id, result.message);
            return;
        }
        info!("Parallel: {}", result.message);
        self.rebalanced_msat += self.split_msat;
        if self.node.settings.dry_run {
            // nothing moved: balances and histogram stay as they are
            self.candidates.push_front(candidate);
            return;
        }

        // peer refreshes are expensive; keep the cache close enough for the thresholds
        self.node
            .shift_channel_balance(&result.outgoing, result.amount * 1000, true);
        self.node
            .shift_channel_balance(&result.incoming, result.amount * 1000, false);

        let counterpart = match self.mode {
            Mode::Pull { .. } => &candidate.destination,
            Mode::Push { .. } => &candidate.source,
        };
        let alias = self.node.alias(counterpart);
        self.result
            .add_success(&alias, result.ppm.unwrap_or_default(), result.amount);
        self.candidates.push_front(candidate);
    }

    /// Drive the campaign until nothing is in flight and nothing more can be fired.
    /// Setting `shutdown` aborts every split still in flight.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ParallelResult {
        let start = Instant::now();
        let mut tasks = JoinSet::new();
        self.fire_candidates(&mut tasks);

        while self.in_flight_msat > 0 {
            debug!(
                "Parallel: rebalanced {}msat, in flight {}msat, target {}msat",
                self.rebalanced_msat, self.in_flight_msat, self.amount_msat
            );
            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok(outcome)) => self.on_outcome(outcome),
                        Some(Err(e)) => {
                            warn!("Parallel: split task failed: {}", e);
                            self.in_flight_msat = self.in_flight_msat.saturating_sub(self.split_msat);
                        }
                        None => break,
                    }
                    self.fire_candidates(&mut tasks);
                }
                _ = shutdown_requested(&mut shutdown) => {
                    warn!("Parallel: shutdown requested, abandoning {} splits", tasks.len());
                    tasks.shutdown().await;
                    break;
                }
            }
        }

        let priced_sat = self.rebalanced_msat / 1000;
        let dry_run = self.node.settings.dry_run;
        let mut result = self.result;
        if dry_run {
            result.finish_dry_run(start.elapsed(), priced_sat);
        } else {
            result.finish(start.elapsed());
        }
        info!("Parallel: {} in {}", result.message, result.time);
        result
    }
}

fn validate(amount_sat: u64, split_sat: u64, splits: usize, percent: f64) -> Result<(), RebalanceError> {
    if amount_sat == 0 || split_sat == 0 {
        return Err(RebalanceError::ZeroAmount);
    }
    if splits == 0 {
        return Err(RebalanceError::InvalidParameter(
            "splits must be at least 1".to_string(),
        ));
    }
    if amount_sat < split_sat {
        return Err(RebalanceError::InvalidParameter(
            "amount is less than the split amount".to_string(),
        ));
    }
    if amount_sat % split_sat != 0 {
        return Err(RebalanceError::InvalidParameter(
            "amount is not a multiple of the split amount".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&percent) {
        return Err(RebalanceError::InvalidParameter(
            "threshold percent must be between 0 and 1".to_string(),
        ));
    }
    Ok(())
}

/// Resolves once `rx` reads true; never resolves if the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Campaign entry shared by pull and push: never fails past this point.
pub(crate) async fn run_campaign(
    node: Arc<Node>,
    mode: Mode,
    target_scid: Option<&str>,
    params: ParallelParams,
    threshold: Threshold,
    shutdown: watch::Receiver<bool>,
) -> ParallelResult {
    let target_sat = params
        .amount_sat
        .unwrap_or(node.settings.parallel.default_amount_sat);
    match Campaign::setup(node, mode, target_scid, params, threshold).await {
        Ok(campaign) => campaign.run(shutdown).await,
        Err(e) => {
            info!("Parallel: rejected: {}", e);
            ParallelResult::rejected(target_sat, e)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::client::mock::MockLightning;
    use crate::node::fixtures::*;

    async fn pull_campaign(mock: MockLightning, params: ParallelParams) -> (Arc<MockLightning>, Campaign) {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(mock);
        let node = start_node(mock.clone(), dir.path()).await;
        let threshold = Threshold {
            percent: 0.2,
            amount_msat: 1_000_000_000,
        };
        let campaign = Campaign::setup(
            node,
            Mode::Pull { max_out_ppm: Some(50) },
            Some("4x4x4"),
            params,
            threshold,
        )
        .await
        .unwrap();
        (mock, campaign)
    }

    fn params(amount_sat: u64) -> ParallelParams {
        ParallelParams {
            amount_sat: Some(amount_sat),
            split_amount_sat: Some(100_000),
            splits: Some(4),
            max_ppm: Some(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fires_up_to_split_cap_and_requeues_success_first() {
        let (_mock, mut campaign) = pull_campaign(star_mock(6, 900_000), params(400_000)).await;
        let order: Vec<String> = campaign
            .candidates
            .iter()
            .map(|c| c.short_channel_id.clone())
            .collect();
        // every channel but the target peer's, in discovery order
        assert_eq!(order.len(), 7);
        assert_eq!(order[0], candidate_scid(0));

        let mut tasks = JoinSet::new();
        assert_eq!(campaign.fire_candidates(&mut tasks), 4);
        assert_eq!(tasks.len(), 4);
        assert_eq!(campaign.in_flight_msat, 400_000_000);
        assert_eq!(campaign.candidates.len(), 3);
        // at the cap nothing more fires
        assert_eq!(campaign.fire_candidates(&mut tasks), 0);

        let outcome = tasks.join_next().await.unwrap().unwrap();
        let succeeded = outcome.candidate.short_channel_id.clone();
        assert!(outcome.result.is_success(), "{}", outcome.result.message);
        campaign.on_outcome(outcome);
        assert_eq!(campaign.candidates.front().unwrap().short_channel_id, succeeded);
        assert_eq!(campaign.rebalanced_msat, 100_000_000);
        assert_eq!(campaign.in_flight_msat, 300_000_000);
        // target reached once the in-flight splits land, so nothing new fires
        assert_eq!(campaign.fire_candidates(&mut tasks), 0);
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_reaches_target() {
        let (mock, campaign) = pull_campaign(star_mock(6, 900_000), params(400_000)).await;
        let (_tx, rx) = watch::channel(false);
        let result = campaign.run(rx).await;

        assert!(result.is_success(), "{}", result.message);
        assert_eq!(result.rebalanced_amount, 400_000);
        assert_eq!(result.attempts, 4);
        assert_eq!(mock.sent_routes().len(), 4);
        let moved: u64 = result.successes.values().flat_map(|s| s.values()).sum();
        assert_eq!(moved, 400_000);
    }

    #[tokio::test]
    async fn test_failed_splits_move_on_to_other_candidates() {
        let mock = star_mock(3, 900_000);
        mock.push_outcome(crate::client::PaymentStatus::Failed(
            crate::client::PaymentFailure {
                code: 204,
                message: "temporary".into(),
                ..Default::default()
            },
        ));
        let (mock, campaign) = pull_campaign(mock, params(200_000)).await;
        let (_tx, rx) = watch::channel(false);
        let result = campaign.run(rx).await;

        assert!(result.is_success(), "{}", result.message);
        assert_eq!(result.attempts, 3);
        assert_eq!(mock.sent_routes().len(), 3);
    }

    #[tokio::test]
    async fn test_depleted_candidates_are_skipped() {
        // 250k local: a 100k split would leave 150k, under the 200k threshold
        let (mock, campaign) = pull_campaign(star_mock(3, 250_000), params(300_000)).await;
        let (_tx, rx) = watch::channel(false);
        let result = campaign.run(rx).await;

        // only 02out's channel has room, and it is requeued after every success
        assert!(result.is_success(), "{}", result.message);
        let sent = mock.sent_routes();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|route| route[0].channel == "1x1x1"));
        assert_eq!(result.successes.len(), 1);
        assert!(result.successes.contains_key("02out"));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_splits() {
        let (_mock, campaign) = pull_campaign(star_mock(6, 900_000), params(400_000)).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = campaign.run(rx).await;
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_dry_run_moves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::test_default(dir.path().to_path_buf());
        config.general.dry_run = true;
        let mock = Arc::new(star_mock(4, 900_000));
        let node = Node::start_with_store(
            &config,
            mock.clone(),
            crate::db::Store::open_in_memory().unwrap(),
        )
        .await
        .unwrap();
        let target_before = node.peer_channel("4x4x4").unwrap().to_us_msat;
        let candidate_before = node.peer_channel(&candidate_scid(0)).unwrap().to_us_msat;

        let campaign = Campaign::setup(
            node.clone(),
            Mode::Pull { max_out_ppm: Some(50) },
            Some("4x4x4"),
            params(200_000),
            Threshold {
                percent: 0.2,
                amount_msat: 1_000_000_000,
            },
        )
        .await
        .unwrap();
        let (_tx, rx) = watch::channel(false);
        let result = campaign.run(rx).await;

        assert!(result.dry_run);
        assert!(result.is_success(), "{}", result.message);
        assert!(result.message.starts_with("dry run"), "{}", result.message);
        assert_eq!(result.rebalanced_amount, 0);
        assert!(result.successes.is_empty());
        assert!(mock.sent_routes().is_empty());
        assert_eq!(node.peer_channel("4x4x4").unwrap().to_us_msat, target_before);
        assert_eq!(
            node.peer_channel(&candidate_scid(0)).unwrap().to_us_msat,
            candidate_before
        );
    }

    #[tokio::test]
    async fn test_oversized_amount_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = start_node(Arc::new(star_mock(2, 900_000)), dir.path()).await;
        let huge = u64::MAX / 400 * 400;
        let oversized = ParallelParams {
            amount_sat: Some(huge),
            split_amount_sat: Some(huge / 4),
            ..params(0)
        };
        let err = Campaign::setup(
            node,
            Mode::Pull { max_out_ppm: Some(50) },
            Some("4x4x4"),
            oversized,
            Threshold {
                percent: 0.2,
                amount_msat: 1_000_000_000,
            },
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, RebalanceError::InvalidParameter(_)), "{}", err);
    }

    #[test]
    fn test_validate() {
        assert!(validate(400_000, 100_000, 4, 0.2).is_ok());
        assert!(validate(50_000, 100_000, 4, 0.2).is_err());
        assert!(validate(250_000, 100_000, 4, 0.2).is_err());
        assert!(validate(400_000, 100_000, 4, 1.2).is_err());
        assert!(validate(400_000, 100_000, 0, 0.2).is_err());
        assert_eq!(validate(0, 100_000, 4, 0.2), Err(RebalanceError::ZeroAmount));
    }

    #[test]
    fn test_threshold() {
        let t = Threshold {
            percent: 0.2,
            amount_msat: 1_000_000_000,
        };
        assert_eq!(t.for_capacity(1_000_000_000), 200_000_000);
        assert_eq!(t.for_capacity(100_000_000_000), 1_000_000_000);
    }
}

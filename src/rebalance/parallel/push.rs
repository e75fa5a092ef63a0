use log::debug;
use std::sync::Arc;
use tokio::sync::watch;

use super::{run_campaign, Mode, ParallelParams, ParallelResult, Threshold};
use crate::client::PeerChannel;
use crate::error::{RebalanceError, Side};
use crate::graph::Channel;
use crate::node::Node;
use crate::rebalance::by_scid::own_channel;

#[derive(Debug, Clone, Default)]
pub struct PushParams {
    pub parallel: ParallelParams,
    pub min_out_ppm: Option<u64>,
    pub fill_up_to_percent: Option<f64>,
    pub fill_up_to_amount_sat: Option<u64>,
}

/// Empty our side of `out_scid` into channels that earn well going out.
pub async fn rebalance_push(
    node: Arc<Node>,
    out_scid: Option<&str>,
    params: PushParams,
    shutdown: watch::Receiver<bool>,
) -> ParallelResult {
    let defaults = &node.settings.parallel;
    // an explicit in list is taken as is
    let min_out_ppm = match params.parallel.candidates {
        Some(_) => None,
        None => Some(params.min_out_ppm.unwrap_or(defaults.default_min_out_ppm)),
    };
    let threshold = Threshold {
        percent: params
            .fill_up_to_percent
            .unwrap_or(defaults.default_fill_up_to_percent),
        amount_msat: params
            .fill_up_to_amount_sat
            .unwrap_or(defaults.default_fill_up_to_amount_sat)
            .saturating_mul(1000),
    };
    run_campaign(
        node,
        Mode::Push { min_out_ppm },
        out_scid,
        params.parallel,
        threshold,
        shutdown,
    )
    .await
}

/// A channel worth filling charges us at most `max_ppm` coming in and
/// earns more than `min_out_ppm` going out.
pub fn is_good_candidate(
    node: &Node,
    incoming: &Channel,
    split_msat: u64,
    max_ppm: u64,
    min_out_ppm: Option<u64>,
) -> bool {
    if incoming.fee_ppm(split_msat) > max_ppm {
        return false;
    }
    let Some(min_out_ppm) = min_out_ppm else {
        return true;
    };
    match own_channel(node, &incoming.short_channel_id, Side::Outgoing) {
        Ok(outgoing) => outgoing.fee_ppm(split_msat) > min_out_ppm,
        Err(e) => {
            debug!("Parallel: {}", e);
            false
        }
    }
}

/// Our balance after the split must not rise above the fill threshold.
pub fn check_fill(
    channel: &PeerChannel,
    split_msat: u64,
    threshold: &Threshold,
) -> Result<(), RebalanceError> {
    let ceiling = threshold.for_capacity(channel.total_msat);
    if channel.to_us_msat.saturating_add(split_msat) > ceiling {
        return Err(RebalanceError::ThresholdReached(
            channel.scid().unwrap_or_default().to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::client::mock::MockLightning;
    use crate::node::fixtures::*;

    /// Candidates 0..earning charge 100 ppm going out, the rest nothing.
    fn push_mock(n: usize, earning: usize, to_us_sat: u64) -> MockLightning {
        let mock = star_mock(n, to_us_sat);
        for i in 0..earning {
            set_fee(&mock, &candidate_scid(i), SELF_ID, &candidate_peer(i), 100);
        }
        mock
    }

    async fn setup(mock: MockLightning) -> (Arc<MockLightning>, Arc<Node>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(mock);
        let node = start_node(mock.clone(), dir.path()).await;
        (mock, node, dir)
    }

    fn params(amount_sat: u64) -> PushParams {
        PushParams {
            parallel: ParallelParams {
                amount_sat: Some(amount_sat),
                max_ppm: Some(100),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_push() {
        let (mock, node, _dir) = setup(push_mock(4, 3, 100_000)).await;
        let result = rebalance_push(node.clone(), Some("1x1x1"), params(300_000), no_shutdown()).await;

        assert!(result.is_success(), "{}", result.message);
        let sent = mock.sent_routes();
        assert_eq!(sent.len(), 3);
        for route in &sent {
            assert_eq!(route[0].channel, "1x1x1");
            // the cheap candidate 3 is not worth filling
            assert_ne!(route.last().unwrap().channel, candidate_scid(3));
        }
        assert_eq!(result.successes.len(), 3);
        assert!(result.successes.contains_key(&candidate_peer(0)));
        assert_eq!(node.peer_channel("1x1x1").unwrap().to_us_msat, 1_600_000_000);
    }

    #[tokio::test]
    async fn test_in_list_overrides_out_ppm_floor() {
        let (mock, node, _dir) = setup(push_mock(4, 0, 100_000)).await;

        let result = rebalance_push(node.clone(), Some("1x1x1"), params(200_000), no_shutdown()).await;
        assert_eq!(result.error, Some(RebalanceError::NoCandidates));

        let mut listed = params(200_000);
        listed.parallel.candidates = Some(vec![candidate_scid(3)]);
        let result = rebalance_push(node, Some("1x1x1"), listed, no_shutdown()).await;
        assert!(result.is_success(), "{}", result.message);
        let sent = mock.sent_routes();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|r| r.last().unwrap().channel == candidate_scid(3)));
    }

    #[tokio::test]
    async fn test_filled_candidates_are_skipped() {
        // 750k local: another 100k would pass the 800k fill threshold
        let (mock, node, _dir) = setup(push_mock(3, 3, 750_000)).await;
        let result = rebalance_push(node, Some("1x1x1"), params(300_000), no_shutdown()).await;

        assert!(!result.is_success());
        assert_eq!(result.rebalanced_amount, 0);
        assert_eq!(result.attempts, 0);
        assert!(mock.sent_routes().is_empty());
    }

    #[test]
    fn test_check_fill() {
        let threshold = Threshold {
            percent: 0.8,
            amount_msat: 10_000_000_000,
        };
        let channel = peer_channel("02aa", "1x1x1", 1_000_000, 700_000);
        assert!(check_fill(&channel, 100_000_000, &threshold).is_ok());
        assert!(check_fill(&channel, 100_000_001, &threshold).is_err());
    }
}

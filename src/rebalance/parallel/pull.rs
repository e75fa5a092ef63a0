use std::sync::Arc;
use tokio::sync::watch;

use super::{run_campaign, Mode, ParallelParams, ParallelResult, Threshold};
use crate::client::PeerChannel;
use crate::error::RebalanceError;
use crate::graph::Channel;
use crate::node::Node;

#[derive(Debug, Clone, Default)]
pub struct PullParams {
    pub parallel: ParallelParams,
    pub max_out_ppm: Option<u64>,
    pub deplete_up_to_percent: Option<f64>,
    pub deplete_up_to_amount_sat: Option<u64>,
}

/// Fill our side of `in_scid` by draining cheap outgoing channels.
pub async fn rebalance_pull(
    node: Arc<Node>,
    in_scid: Option<&str>,
    params: PullParams,
    shutdown: watch::Receiver<bool>,
) -> ParallelResult {
    let defaults = &node.settings.parallel;
    // an explicit out list is taken as is
    let max_out_ppm = match params.parallel.candidates {
        Some(_) => None,
        None => Some(params.max_out_ppm.unwrap_or(defaults.default_max_out_ppm)),
    };
    let threshold = Threshold {
        percent: params
            .deplete_up_to_percent
            .unwrap_or(defaults.default_deplete_up_to_percent),
        amount_msat: params
            .deplete_up_to_amount_sat
            .unwrap_or(defaults.default_deplete_up_to_amount_sat)
            .saturating_mul(1000),
    };
    run_campaign(
        node,
        Mode::Pull { max_out_ppm },
        in_scid,
        params.parallel,
        threshold,
        shutdown,
    )
    .await
}

/// Outgoing channels worth draining charge less than `max_out_ppm` at the split amount.
pub fn is_good_candidate(outgoing: &Channel, split_msat: u64, max_out_ppm: Option<u64>) -> bool {
    match max_out_ppm {
        Some(max) => outgoing.fee_ppm(split_msat) < max,
        None => true,
    }
}

/// Our balance left after the split must not drop below the deplete threshold.
pub fn check_deplete(
    channel: &PeerChannel,
    split_msat: u64,
    threshold: &Threshold,
) -> Result<(), RebalanceError> {
    let floor = threshold.for_capacity(channel.total_msat);
    if channel.to_us_msat.saturating_sub(split_msat) < floor {
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
    use crate::rebalance::result::Status;

    async fn setup(mock: MockLightning) -> (Arc<MockLightning>, Arc<Node>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(mock);
        let node = start_node(mock.clone(), dir.path()).await;
        (mock, node, dir)
    }

    fn params(amount_sat: u64) -> PullParams {
        PullParams {
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
    async fn test_pull() {
        let (mock, node, _dir) = setup(star_mock(4, 900_000)).await;
        let result = rebalance_pull(node.clone(), Some("4x4x4"), params(400_000), no_shutdown()).await;

        assert!(result.is_success(), "{}", result.message);
        assert_eq!(result.rebalance_target, 400_000);
        assert_eq!(result.rebalanced_amount, 400_000);
        for route in mock.sent_routes() {
            assert_eq!(route.last().unwrap().channel, "4x4x4");
        }
        // the cache saw the balance move into the target
        assert_eq!(node.peer_channel("4x4x4").unwrap().to_us_msat, 500_000_000);
    }

    #[tokio::test]
    async fn test_expensive_candidates_filtered_unless_listed() {
        let mock = star_mock(2, 900_000);
        set_fee(&mock, &candidate_scid(0), SELF_ID, &candidate_peer(0), 500);
        set_fee(&mock, &candidate_scid(1), SELF_ID, &candidate_peer(1), 500);
        set_fee(&mock, "1x1x1", SELF_ID, "02out", 500);
        let (mock, node, _dir) = setup(mock).await;

        let result = rebalance_pull(node.clone(), Some("4x4x4"), params(100_000), no_shutdown()).await;
        assert_eq!(result.error, Some(RebalanceError::NoCandidates));
        assert_eq!(result.status, Status::Failure);
        assert!(mock.sent_routes().is_empty());

        let mut listed = params(100_000);
        listed.parallel.candidates = Some(vec![candidate_scid(1)]);
        let result = rebalance_pull(node, Some("4x4x4"), listed, no_shutdown()).await;
        assert!(result.is_success(), "{}", result.message);
        assert_eq!(mock.sent_routes()[0][0].channel, candidate_scid(1));
    }

    #[tokio::test]
    async fn test_rejected_parameters() {
        let (_mock, node, _dir) = setup(star_mock(2, 900_000)).await;

        let result = rebalance_pull(node.clone(), None, params(400_000), no_shutdown()).await;
        assert_eq!(result.error, Some(RebalanceError::MissingParameter("in channel")));
        assert_eq!(result.attempts, 0);

        let result = rebalance_pull(node.clone(), Some("4x4x4"), params(250_000), no_shutdown()).await;
        assert!(matches!(result.error, Some(RebalanceError::InvalidParameter(_))));

        let mut bad_percent = params(400_000);
        bad_percent.deplete_up_to_percent = Some(1.5);
        let result = rebalance_pull(node, Some("4x4x4"), bad_percent, no_shutdown()).await;
        assert!(matches!(result.error, Some(RebalanceError::InvalidParameter(_))));
    }

    #[test]
    fn test_check_deplete() {
        let threshold = Threshold {
            percent: 0.2,
            amount_msat: 1_000_000_000,
        };
        let channel = peer_channel("02aa", "1x1x1", 1_000_000, 300_000);
        assert!(check_deplete(&channel, 100_000_000, &threshold).is_ok());
        assert_eq!(
            check_deplete(&channel, 150_000_000, &threshold),
            Err(RebalanceError::ThresholdReached("1x1x1".into()))
        );
    }
}

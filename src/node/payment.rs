use log::{debug, info, warn};
use serde::Serialize;
use std::time::Instant;

use super::{LiquidityUpdate, Node};
use crate::client::{PaymentFailure, PaymentNotification, PaymentStatus, PaymentSuccess};
use crate::db::{FAILURE_PREFIX, SUCCESS_PREFIX, TIMEOUT_PREFIX};
use crate::error::RebalanceError;
use crate::graph::{ChannelId, Route};

/// Belief assigned to an erring channel: what it failed to carry, less this margin.
const FAILURE_MARGIN_MSAT: u64 = 1_000_000;

/// How long to wait on a payment we already gave up on.
const PENDING_CHECK_SECS: u64 = 1;

impl Node {
    /// Dispatch `route` under `payment_hash` and block until it resolves.
    pub async fn send_pay(
        &self,
        route: &Route,
        payment_hash: &str,
    ) -> Result<PaymentSuccess, RebalanceError> {
        let start = Instant::now();
        let hops = route.to_sendpay();

        if let Err(e) = self.rpc.send_pay(&hops, payment_hash).await {
            warn!("Node: sendpay failed: {:#}", e);
            self.forget_payment(payment_hash);
            return Err(RebalanceError::TemporaryFailure(e.to_string()));
        }

        debug!("Node: waiting for payment {}", payment_hash);
        let status = self
            .rpc
            .wait_send_pay(payment_hash, self.settings.payment_timeout_secs)
            .await;
        debug!("Node: payment {} settled after {:?}", payment_hash, start.elapsed());

        match status {
            Ok(PaymentStatus::Complete(success)) => {
                self.on_payment_success(&success);
                Ok(success)
            }
            Ok(PaymentStatus::TimedOut) => {
                self.manage_timeout(payment_hash);
                Err(RebalanceError::PaymentTimeout)
            }
            Ok(PaymentStatus::Failed(failure)) => {
                // only the last forwarder raising its fee is fatal; elsewhere
                // it is treated like any other liquidity failure
                let last_forwarder = route.hops.last().map(|h| h.channel.source.as_str());
                let fatal = failure.is_fee_insufficient()
                    && failure.erring_node.as_deref() == last_forwarder;
                let reason = failure
                    .failcodename
                    .clone()
                    .unwrap_or_else(|| failure.message.clone());
                self.on_payment_failure(&failure, Some(route)).await;
                if fatal {
                    Err(RebalanceError::FeeInsufficient(self.alias(
                        failure.erring_node.as_deref().unwrap_or_default(),
                    )))
                } else {
                    Err(RebalanceError::TemporaryFailure(reason))
                }
            }
            Err(e) => {
                warn!("Node: waitsendpay failed: {:#}", e);
                Err(RebalanceError::TemporaryFailure(e.to_string()))
            }
        }
    }

    /// Abandon a payment whose outcome is unknown: without the preimage a
    /// late HTLC fails instead of resolving.
    fn manage_timeout(&self, payment_hash: &str) {
        info!("Node: payment {} timed out, outcome unknown", payment_hash);
        self.forget_payment(payment_hash);
        if let Err(e) = self
            .store
            .set(&format!("{}{}", TIMEOUT_PREFIX, payment_hash), &"timeout")
        {
            warn!("Node: unable to save timeout marker: {:#}", e);
        }
    }

    fn forget_payment(&self, payment_hash: &str) {
        self.forget_secret(payment_hash);
        if let Err(e) = self.store.delete(payment_hash) {
            warn!("Node: unable to delete preimage: {:#}", e);
        }
    }

    /// Drop the bookkeeping of a payment we issued. False if it is not ours.
    fn delete_if_ours(&self, payment_hash: &str) -> bool {
        let in_memory = self.forget_secret(payment_hash);
        let keys = [
            payment_hash.to_string(),
            format!("{}{}", TIMEOUT_PREFIX, payment_hash),
        ];
        let mut stored = false;
        for key in &keys {
            match self.store.delete(key) {
                Ok(deleted) => stored |= deleted,
                Err(e) => warn!("Node: unable to delete {}: {:#}", key, e),
            }
        }
        in_memory || stored
    }

    /// Persist a payment record when stats are enabled; failures are only logged.
    pub fn save_record<T: Serialize>(&self, key: &str, value: &T) {
        if !self.settings.save_stats {
            return;
        }
        if let Err(e) = self.store.set(key, value) {
            warn!("Node: unable to save {}: {:#}", key, e);
        }
    }

    /// False if the payment is not one of ours.
    pub fn on_payment_success(&self, success: &PaymentSuccess) -> bool {
        if !self.delete_if_ours(&success.payment_hash) {
            return false;
        }
        self.save_record(&format!("{}{}", SUCCESS_PREFIX, success.payment_hash), success);
        true
    }

    /// Record the failure and lower the belief of the channel that refused to forward.
    /// False if the payment is not one of ours.
    pub async fn on_payment_failure(&self, failure: &PaymentFailure, route: Option<&Route>) -> bool {
        if !self.delete_if_ours(&failure.payment_hash) {
            return false;
        }
        self.save_record(&format!("{}{}", FAILURE_PREFIX, failure.payment_hash), failure);

        debug!(
            "Node: payment failed, code {} {:?} at {:?}",
            failure.code, failure.failcodename, failure.erring_channel
        );
        if failure.erring_node.as_deref() == Some(self.id.as_str()) {
            return true;
        }
        let (Some(scid), Some(direction)) = (&failure.erring_channel, failure.erring_direction)
        else {
            return true;
        };
        let carried = route
            .and_then(|r| r.hops.iter().find(|h| &h.channel.short_channel_id == scid))
            .map(|h| h.amount_msat)
            .or(failure.amount_msat);
        let Some(carried) = carried else {
            return true;
        };
        self.queue_liquidity_update(LiquidityUpdate::Set {
            channel: ChannelId::new(scid.clone(), direction),
            amount_msat: carried - carried.min(FAILURE_MARGIN_MSAT),
        })
        .await;
        true
    }

    /// Take in a `sendpay_success` / `sendpay_failure` delivered by the host,
    /// typically for a payment we stopped waiting for.
    pub async fn on_payment_notification(&self, notification: PaymentNotification) -> bool {
        match notification {
            PaymentNotification::Success(success) => {
                debug!("Node: late success for {}", success.payment_hash);
                self.on_payment_success(&success)
            }
            PaymentNotification::Failure(notification) => {
                let failure = notification.into_failure();
                debug!("Node: late failure for {}", failure.payment_hash);
                self.on_payment_failure(&failure, None).await
            }
        }
    }

    /// Ask lightningd about payments we abandoned on timeout and settle the
    /// bookkeeping of those that have since resolved.
    pub async fn check_timed_out_payments(&self) -> usize {
        let markers = match self.store.list_prefix::<String>(TIMEOUT_PREFIX) {
            Ok(markers) => markers,
            Err(e) => {
                warn!("Node: unable to list timeout markers: {:#}", e);
                return 0;
            }
        };

        let mut resolved = 0;
        for (key, _) in markers {
            let Some(payment_hash) = key.strip_prefix(TIMEOUT_PREFIX) else {
                continue;
            };
            match self.rpc.wait_send_pay(payment_hash, PENDING_CHECK_SECS).await {
                Ok(PaymentStatus::Complete(success)) => {
                    info!("Node: timed out payment {} succeeded after all", payment_hash);
                    self.on_payment_success(&success);
                    resolved += 1;
                }
                Ok(PaymentStatus::Failed(failure)) => {
                    info!("Node: timed out payment {} failed", payment_hash);
                    self.on_payment_failure(&failure, None).await;
                    resolved += 1;
                }
                Ok(PaymentStatus::TimedOut) => debug!("Node: {} still pending", payment_hash),
                Err(e) => warn!("Node: unable to check {}: {:#}", payment_hash, e),
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockLightning;
    use crate::graph::{direction, Route};
    use crate::node::fixtures::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn setup() -> (Arc<MockLightning>, Arc<Node>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(circular_mock());
        let node = start_node(mock.clone(), dir.path()).await;
        (mock, node, dir)
    }

    fn circular_route(node: &Node, amount_msat: u64) -> Route {
        let hops = node
            .graph
            .find_route("02out", "02in", amount_msat, &HashSet::from([SELF_ID.to_string()]), 5)
            .unwrap();
        let mut route = Route::new("02out", "02in", amount_msat, hops);
        route.prepend(
            node.graph
                .get_channel(&ChannelId::new("1x1x1", direction(SELF_ID, "02out")))
                .unwrap(),
        );
        route.append(
            node.graph
                .get_channel(&ChannelId::new("4x4x4", direction("02in", SELF_ID)))
                .unwrap(),
        );
        route
    }

    #[tokio::test]
    async fn test_success_cleans_up_and_records() {
        let (mock, node, _dir) = setup().await;
        let route = circular_route(&node, 10_000_000);
        let secret = node.new_payment_secret();

        let success = node.send_pay(&route, &secret.hash).await.unwrap();
        assert_eq!(success.payment_hash, secret.hash);
        assert_eq!(mock.sent_routes().len(), 1);
        assert_eq!(mock.sent_routes()[0].last().unwrap().id, SELF_ID);

        assert!(node.secret(&secret.hash).is_none());
        assert!(node.store.get_raw(&secret.hash).unwrap().is_none());
        let key = format!("{}{}", SUCCESS_PREFIX, secret.hash);
        assert!(node.store.get_raw(&key).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_timeout_writes_marker() {
        let (mock, node, _dir) = setup().await;
        mock.push_outcome(PaymentStatus::TimedOut);
        let route = circular_route(&node, 10_000_000);
        let secret = node.new_payment_secret();

        let err = node.send_pay(&route, &secret.hash).await.unwrap_err();
        assert_eq!(err, RebalanceError::PaymentTimeout);
        assert!(node.store.get_raw(&secret.hash).unwrap().is_none());
        let marker = format!("{}{}", TIMEOUT_PREFIX, secret.hash);
        assert!(node.store.get_raw(&marker).unwrap().is_some());

        // a late success clears the marker
        node.on_payment_success(&PaymentSuccess {
            payment_hash: secret.hash.clone(),
            ..Default::default()
        });
        assert!(node.store.get_raw(&marker).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_lowers_erring_channel_belief() {
        let (mock, node, _dir) = setup().await;
        let erring = ChannelId::new("3x3x3", direction("02mid", "02in"));
        mock.push_outcome(PaymentStatus::Failed(PaymentFailure {
            code: 204,
            message: "failed along route".into(),
            failcodename: Some("WIRE_TEMPORARY_CHANNEL_FAILURE".into()),
            erring_node: Some("02mid".into()),
            erring_channel: Some("3x3x3".into()),
            erring_direction: Some(erring.direction),
            ..Default::default()
        }));
        let route = circular_route(&node, 10_000_000);
        let carried = route
            .hops
            .iter()
            .find(|h| h.channel.short_channel_id == "3x3x3")
            .unwrap()
            .amount_msat;
        let secret = node.new_payment_secret();

        let err = node.send_pay(&route, &secret.hash).await.unwrap_err();
        assert!(matches!(err, RebalanceError::TemporaryFailure(_)));

        node.flush_liquidity().await;
        let ch = node.graph.get_channel(&erring).unwrap();
        assert_eq!(ch.liquidity_msat, carried - FAILURE_MARGIN_MSAT);
        let opp = node.graph.get_channel(&erring.opposite()).unwrap();
        assert_eq!(ch.liquidity_msat + opp.liquidity_msat, ch.capacity_msat);
        let key = format!("{}{}", FAILURE_PREFIX, secret.hash);
        assert!(node.store.get_raw(&key).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fee_insufficient_at_last_forwarder_is_fatal() {
        let (mock, node, _dir) = setup().await;
        mock.push_outcome(PaymentStatus::Failed(PaymentFailure {
            code: 204,
            failcodename: Some(PaymentFailure::FEE_INSUFFICIENT.into()),
            erring_node: Some("02in".into()),
            erring_channel: Some("4x4x4".into()),
            erring_direction: Some(direction("02in", SELF_ID)),
            ..Default::default()
        }));
        let route = circular_route(&node, 10_000_000);
        let secret = node.new_payment_secret();
        let err = node.send_pay(&route, &secret.hash).await.unwrap_err();
        assert!(matches!(err, RebalanceError::FeeInsufficient(_)));
    }

    #[tokio::test]
    async fn test_fee_insufficient_elsewhere_is_transient() {
        let (mock, node, _dir) = setup().await;
        mock.push_outcome(PaymentStatus::Failed(PaymentFailure {
            code: 204,
            failcodename: Some(PaymentFailure::FEE_INSUFFICIENT.into()),
            erring_node: Some("02mid".into()),
            erring_channel: Some("3x3x3".into()),
            erring_direction: Some(direction("02mid", "02in")),
            ..Default::default()
        }));
        let route = circular_route(&node, 10_000_000);
        let secret = node.new_payment_secret();
        let err = node.send_pay(&route, &secret.hash).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_sendpay_error_is_transient() {
        let (mock, node, _dir) = setup().await;
        *mock.fail_send_pay.lock().unwrap() = true;
        let route = circular_route(&node, 10_000_000);
        let secret = node.new_payment_secret();
        let err = node.send_pay(&route, &secret.hash).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(node.secret(&secret.hash).is_none());
    }

    async fn timed_out_payment(mock: &MockLightning, node: &Node) -> (Route, String) {
        mock.push_outcome(PaymentStatus::TimedOut);
        let route = circular_route(node, 10_000_000);
        let secret = node.new_payment_secret();
        let err = node.send_pay(&route, &secret.hash).await.unwrap_err();
        assert_eq!(err, RebalanceError::PaymentTimeout);
        (route, secret.hash)
    }

    fn mid_failure(payment_hash: &str, amount_msat: u64) -> PaymentFailure {
        PaymentFailure {
            code: 204,
            message: "failed along route".into(),
            payment_hash: payment_hash.to_string(),
            failcodename: Some("WIRE_TEMPORARY_CHANNEL_FAILURE".into()),
            erring_node: Some("02mid".into()),
            erring_channel: Some("3x3x3".into()),
            erring_direction: Some(direction("02mid", "02in")),
            amount_msat: Some(amount_msat),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_late_failure_notification() {
        let (mock, node, _dir) = setup().await;
        let (_route, hash) = timed_out_payment(&mock, &node).await;
        let erring = ChannelId::new("3x3x3", direction("02mid", "02in"));

        let notification: PaymentNotification = serde_json::from_value(serde_json::json!({
            "sendpay_failure": {
                "code": 204,
                "message": "failed",
                "data": mid_failure(&hash, 5_000_000),
            }
        }))
        .unwrap();
        assert!(node.on_payment_notification(notification).await);
        node.flush_liquidity().await;

        let marker = format!("{}{}", TIMEOUT_PREFIX, hash);
        assert!(node.store.get_raw(&marker).unwrap().is_none());
        let key = format!("{}{}", FAILURE_PREFIX, hash);
        assert!(node.store.get_raw(&key).unwrap().is_some());
        assert_eq!(
            node.graph.get_channel(&erring).unwrap().liquidity_msat,
            5_000_000 - FAILURE_MARGIN_MSAT
        );

        // a repeat is not ours any more
        let repeat = PaymentNotification::Success(PaymentSuccess {
            payment_hash: hash,
            ..Default::default()
        });
        assert!(!node.on_payment_notification(repeat).await);
    }

    #[tokio::test]
    async fn test_check_timed_out_payments() {
        let (mock, node, _dir) = setup().await;
        for _ in 0..3 {
            timed_out_payment(&mock, &node).await;
        }

        // lightningd is asked in marker order
        let hashes: Vec<String> = node
            .store
            .list_prefix::<String>(TIMEOUT_PREFIX)
            .unwrap()
            .into_iter()
            .map(|(key, _)| key[TIMEOUT_PREFIX.len()..].to_string())
            .collect();
        let (settled, pending, failed) = (&hashes[0], &hashes[1], &hashes[2]);
        mock.push_outcome(PaymentStatus::Complete(PaymentSuccess {
            payment_hash: settled.clone(),
            ..Default::default()
        }));
        mock.push_outcome(PaymentStatus::TimedOut);
        mock.push_outcome(PaymentStatus::Failed(mid_failure(failed, 5_000_000)));

        assert_eq!(node.check_timed_out_payments().await, 2);
        node.flush_liquidity().await;

        let marker = |hash: &str| format!("{}{}", TIMEOUT_PREFIX, hash);
        assert!(node.store.get_raw(&marker(settled)).unwrap().is_none());
        assert!(node.store.get_raw(&marker(pending)).unwrap().is_some());
        assert!(node.store.get_raw(&marker(failed)).unwrap().is_none());
        let key = format!("{}{}", SUCCESS_PREFIX, settled);
        assert!(node.store.get_raw(&key).unwrap().is_some());
        let erring = ChannelId::new("3x3x3", direction("02mid", "02in"));
        assert_eq!(
            node.graph.get_channel(&erring).unwrap().liquidity_msat,
            5_000_000 - FAILURE_MARGIN_MSAT
        );
    }

    #[tokio::test]
    async fn test_foreign_payment_ignored() {
        let (_mock, node, _dir) = setup().await;
        let ours = node.on_payment_failure(
            &PaymentFailure {
                payment_hash: "ff".repeat(32),
                erring_channel: Some("3x3x3".into()),
                erring_direction: Some(0),
                amount_msat: Some(1),
                ..Default::default()
            },
            None,
        )
        .await;
        assert!(!ours);
        node.flush_liquidity().await;
        assert!(node
            .store
            .list_prefix::<PaymentFailure>(FAILURE_PREFIX)
            .unwrap()
            .is_empty());
    }
}

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::RebalanceError;
use crate::rebalance::result::Status;

/// ppm -> sats moved at that rate
pub type Successes = BTreeMap<u64, u64>;

/// Aggregate outcome of a pull or push campaign.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelResult {
    pub status: Status,
    pub message: String,
    /// sat
    pub rebalance_target: u64,
    /// sat
    pub rebalanced_amount: u64,
    pub attempts: u32,
    pub time: String,
    /// counterpart alias -> ppm -> sats
    pub successes: BTreeMap<String, Successes>,
    /// Routes were priced but nothing was paid
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    #[serde(skip)]
    pub error: Option<RebalanceError>,
}

impl ParallelResult {
    pub fn new(target_sat: u64) -> Self {
        Self {
            status: Status::Failure,
            message: String::new(),
            rebalance_target: target_sat,
            rebalanced_amount: 0,
            attempts: 0,
            time: format_elapsed(Duration::ZERO),
            successes: BTreeMap::new(),
            dry_run: false,
            error: None,
        }
    }

    /// A campaign rejected before anything was fired.
    pub fn rejected(target_sat: u64, error: RebalanceError) -> Self {
        Self {
            message: error.to_string(),
            error: Some(error),
            ..Self::new(target_sat)
        }
    }

    pub fn add_success(&mut self, alias: &str, ppm: u64, amount_sat: u64) {
        self.rebalanced_amount += amount_sat;
        *self
            .successes
            .entry(alias.to_string())
            .or_default()
            .entry(ppm)
            .or_default() += amount_sat;
    }

    /// Stamp the elapsed time and settle status and message.
    pub fn finish(&mut self, elapsed: Duration) {
        self.time = format_elapsed(elapsed);
        if self.rebalanced_amount >= self.rebalance_target {
            self.status = Status::Success;
            self.message = format!(
                "rebalanced {} sats in {} attempts",
                self.rebalanced_amount, self.attempts
            );
        } else {
            self.status = Status::Failure;
            self.message = format!(
                "rebalanced {} of {} sats in {} attempts",
                self.rebalanced_amount, self.rebalance_target, self.attempts
            );
        }
    }

    /// Settle a dry run: nothing moved, and success means the whole target
    /// could be routed within the fee ceiling.
    pub fn finish_dry_run(&mut self, elapsed: Duration, priced_sat: u64) {
        self.time = format_elapsed(elapsed);
        self.dry_run = true;
        self.status = if priced_sat >= self.rebalance_target {
            Status::Success
        } else {
            Status::Failure
        };
        self.message = format!(
            "dry run: priced routes for {} of {} sats, nothing was paid",
            priced_sat, self.rebalance_target
        );
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.3}s", elapsed.as_secs_f64())
}

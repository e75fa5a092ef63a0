use serde::Serialize;

use crate::error::RebalanceError;
use crate::graph::PrettyRoute;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// Outcome of a single-route rebalance, returned on every path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalanceResult {
    pub status: Status,
    pub message: String,
    /// sat
    pub amount: u64,
    #[serde(rename = "out")]
    pub outgoing: String,
    #[serde(rename = "in")]
    pub incoming: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_msat: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppm: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<PrettyRoute>,
    #[serde(skip)]
    pub error: Option<RebalanceError>,
}

impl RebalanceResult {
    pub fn success(
        outgoing: &str,
        incoming: &str,
        attempts: u32,
        route: PrettyRoute,
        message: String,
    ) -> Self {
        Self {
            status: Status::Success,
            message,
            amount: route.amount_sat,
            outgoing: outgoing.to_string(),
            incoming: incoming.to_string(),
            attempts,
            fee_msat: Some(route.fee_msat),
            ppm: Some(route.ppm),
            route: Some(route),
            error: None,
        }
    }

    pub fn failure(
        outgoing: &str,
        incoming: &str,
        amount_sat: u64,
        attempts: u32,
        error: RebalanceError,
    ) -> Self {
        Self {
            status: Status::Failure,
            message: error.to_string(),
            amount: amount_sat,
            outgoing: outgoing.to_string(),
            incoming: incoming.to_string(),
            attempts,
            fee_msat: None,
            ppm: None,
            route: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

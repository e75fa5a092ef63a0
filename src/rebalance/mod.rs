//! Circular self-payments: one route at a time ([`attempt`]) or many split
//! payments against a single channel ([`parallel`]).

pub mod attempt;
pub mod by_node;
pub mod by_scid;
pub mod parallel;
pub mod result;

pub use attempt::{Rebalance, RebalanceParams};
pub use by_node::rebalance_by_node;
pub use by_scid::rebalance_by_scid;
pub use result::{RebalanceResult, Status};

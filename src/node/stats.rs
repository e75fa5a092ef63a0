use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

use super::Node;
use crate::client::{PaymentFailure, PaymentSuccess};
use crate::db::{Store, FAILURE_PREFIX, ROUTE_PREFIX, SUCCESS_PREFIX, TIMEOUT_PREFIX};
use crate::graph::{GraphStats, PrettyRoute};

#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub graph_stats: GraphStats,
    pub successes: Vec<PaymentSuccess>,
    pub failures: Vec<PaymentFailure>,
    pub routes: Vec<PrettyRoute>,
    pub timeouts: usize,
}

impl NodeStats {
    /// Sum over successful payments of what they delivered.
    pub fn total_rebalanced_msat(&self) -> u64 {
        self.successes
            .iter()
            .filter_map(|s| s.amount_msat)
            .sum()
    }
}

impl fmt::Display for NodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Node stats:")?;
        writeln!(f, "{}", self.graph_stats)?;
        writeln!(
            f,
            "successes: {}, failures: {}, routes: {}, timeouts: {}",
            self.successes.len(),
            self.failures.len(),
            self.routes.len(),
            self.timeouts
        )?;
        write!(f, "total rebalanced: {} sat", self.total_rebalanced_msat() / 1000)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeletedStats {
    pub successes: usize,
    pub failures: usize,
    pub routes: usize,
    pub timeouts: usize,
}

fn list<T: DeserializeOwned>(store: &Store, prefix: &str) -> Vec<T> {
    match store.list_prefix(prefix) {
        Ok(records) => records.into_iter().map(|(_, v)| v).collect(),
        Err(e) => {
            warn!("Stats: unable to list {} records: {:#}", prefix, e);
            Vec::new()
        }
    }
}

fn delete(store: &Store, prefix: &str) -> usize {
    store.delete_prefix(prefix).unwrap_or_else(|e| {
        warn!("Stats: unable to delete {} records: {:#}", prefix, e);
        0
    })
}

impl Node {
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            graph_stats: self.graph.stats(),
            successes: list(&self.store, SUCCESS_PREFIX),
            failures: list(&self.store, FAILURE_PREFIX),
            routes: list(&self.store, ROUTE_PREFIX),
            timeouts: list::<String>(&self.store, TIMEOUT_PREFIX).len(),
        }
    }

    pub fn delete_stats(&self) -> DeletedStats {
        DeletedStats {
            successes: delete(&self.store, SUCCESS_PREFIX),
            failures: delete(&self.store, FAILURE_PREFIX),
            routes: delete(&self.store, ROUTE_PREFIX),
            timeouts: delete(&self.store, TIMEOUT_PREFIX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::fixtures::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stats_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let node = start_node(Arc::new(circular_mock()), dir.path()).await;

        node.save_record(
            "s_aa",
            &PaymentSuccess {
                payment_hash: "aa".into(),
                amount_msat: Some(100_000_000),
                ..Default::default()
            },
        );
        node.save_record(
            "s_bb",
            &PaymentSuccess {
                payment_hash: "bb".into(),
                amount_msat: Some(50_000_000),
                ..Default::default()
            },
        );
        node.save_record("f_cc", &PaymentFailure::default());
        node.store.set("timeout_dd", &"timeout").unwrap();
        // preimages are not stats
        node.store.set_raw("ee", "preimage").unwrap();

        let stats = node.stats();
        assert_eq!(stats.successes.len(), 2);
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.total_rebalanced_msat(), 150_000_000);
        assert_eq!(stats.graph_stats.channels, 8);
        assert!(stats.to_string().contains("total rebalanced: 150000 sat"));

        let deleted = node.delete_stats();
        assert_eq!(
            deleted,
            DeletedStats {
                successes: 2,
                failures: 1,
                routes: 0,
                timeouts: 1,
            }
        );
        assert!(node.stats().successes.is_empty());
        assert!(node.store.get_raw("ee").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_record_respects_switch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::test_default(dir.path().to_path_buf());
        config.general.save_stats = false;
        let node = Node::start_with_store(
            &config,
            Arc::new(circular_mock()),
            Store::open_in_memory().unwrap(),
        )
        .await
        .unwrap();
        node.save_record("s_aa", &PaymentSuccess::default());
        assert!(node.stats().successes.is_empty());
    }
}

pub mod htlc;
pub mod liquidity;
pub mod payment;
pub mod peers;
pub mod preimage;
pub mod stats;

pub use htlc::HtlcResolution;
pub use liquidity::LiquidityUpdate;
pub use peers::Peer;

use anyhow::Context;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;

use crate::client::LightningRpc;
use crate::config::{Config, ParallelConfig, RebalanceConfig};
use crate::db::Store;
use crate::graph::snapshot::{GraphSnapshot, GRAPH_FILE};
use crate::graph::Graph;

pub const DB_FILE: &str = "circular.db";

/// Capacity of the liquidity update queue.
pub const LIQUIDITY_QUEUE_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub dry_run: bool,
    pub save_stats: bool,
    pub payment_timeout_secs: u64,
    pub aging_percent: f64,
    pub graph_file: PathBuf,
    pub rebalance: RebalanceConfig,
    pub parallel: ParallelConfig,
}

impl NodeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dry_run: config.general.dry_run,
            save_stats: config.general.save_stats,
            payment_timeout_secs: config.general.payment_timeout_secs,
            aging_percent: config.liquidity.aging_percent,
            graph_file: config.general.data_dir.join(GRAPH_FILE),
            rebalance: config.rebalance.clone(),
            parallel: config.parallel.clone(),
        }
    }
}

/// Our node: identity, RPC handle, graph, peer cache and payment bookkeeping.
///
/// Built once by [`Node::start`]; holding an `Arc<Node>` means the graph and
/// peers have been loaded at least once.
pub struct Node {
    pub id: String,
    pub rpc: Arc<dyn LightningRpc>,
    pub graph: Arc<Graph>,
    pub store: Store,
    pub settings: NodeSettings,
    peers: RwLock<HashMap<String, Peer>>,
    /// payment hash -> preimage, for payments we issued
    secrets: Mutex<HashMap<String, String>>,
    liquidity_tx: mpsc::Sender<LiquidityUpdate>,
}

impl Node {
    pub async fn start(config: &Config, rpc: Arc<dyn LightningRpc>) -> anyhow::Result<Arc<Self>> {
        let data_dir = &config.general.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        let store = Store::open(&data_dir.join(DB_FILE))?;
        Self::start_with_store(config, rpc, store).await
    }

    pub async fn start_with_store(
        config: &Config,
        rpc: Arc<dyn LightningRpc>,
        store: Store,
    ) -> anyhow::Result<Arc<Self>> {
        let start = Instant::now();
        let info = rpc.get_info().await.context("Cannot reach lightningd")?;
        info!(
            "Node: connected to {} ({})",
            info.id,
            info.alias.as_deref().unwrap_or("no alias")
        );

        let settings = NodeSettings::from_config(config);
        let graph = Arc::new(Graph::load_from_file(&settings.graph_file));

        let (liquidity_tx, liquidity_rx) = mpsc::channel(LIQUIDITY_QUEUE_SIZE);
        tokio::spawn(liquidity::apply_updates(graph.clone(), liquidity_rx));

        let node = Arc::new(Self {
            id: info.id,
            rpc,
            graph,
            store,
            settings,
            peers: RwLock::new(HashMap::new()),
            secrets: Mutex::new(HashMap::new()),
            liquidity_tx,
        });

        node.refresh_graph().await?;
        node.refresh_peers().await?;
        info!("Node: ready in {:?}, {}", start.elapsed(), node.graph.stats());
        Ok(node)
    }

    /// Pull gossip and aliases, merge them, then drop stale channels.
    pub async fn refresh_graph(&self) -> anyhow::Result<()> {
        let start = Instant::now();
        let channels = self.rpc.list_channels().await?;
        let nodes = self.rpc.list_nodes().await?;
        self.graph.refresh_channels(&channels);
        self.graph.refresh_aliases(&nodes);
        self.graph.prune_channels(chrono::Utc::now().timestamp() as u64);
        debug!(
            "Node: graph refresh took {:?} ({} channels)",
            start.elapsed(),
            self.graph.channel_count()
        );
        Ok(())
    }

    /// Save the snapshot, first adopting beliefs that another process
    /// saved after it learned them.
    pub fn save_graph(&self) {
        let path = &self.settings.graph_file;
        if path.exists() {
            match GraphSnapshot::load(path) {
                Ok(on_disk) => {
                    let merged = self.graph.merge_beliefs(&on_disk.channels);
                    if merged > 0 {
                        debug!("Node: adopted {} newer beliefs from {}", merged, path.display());
                    }
                }
                Err(e) => warn!("Node: not merging {}: {:#}", path.display(), e),
            }
        }
        if let Err(e) = self.graph.save_to_file(path) {
            warn!("Node: unable to save graph: {:#}", e);
        }
    }

    /// Apply every queued belief update, then save them.
    pub async fn persist_beliefs(&self) {
        self.flush_liquidity().await;
        self.save_graph();
    }

    pub fn age_liquidity(&self) -> usize {
        self.graph.age_liquidity(self.settings.aging_percent)
    }

    pub fn alias(&self, node_id: &str) -> String {
        self.graph.alias(node_id)
    }
}

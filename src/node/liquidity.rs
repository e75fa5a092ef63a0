use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::Node;
use crate::graph::{ChannelId, Graph};

/// Belief changes, applied one at a time in arrival order.
#[derive(Debug)]
pub enum LiquidityUpdate {
    /// Set the direction's belief, the opposite direction takes the rest
    Set { channel: ChannelId, amount_msat: u64 },
    /// An amount went through this direction
    Spent { channel: ChannelId, amount_msat: u64 },
    /// Completes once every earlier update has been applied
    Flush(oneshot::Sender<()>),
}

/// Single consumer of the liquidity queue. Ends when every sender is gone.
pub async fn apply_updates(graph: Arc<Graph>, mut rx: mpsc::Receiver<LiquidityUpdate>) {
    while let Some(update) = rx.recv().await {
        match update {
            LiquidityUpdate::Set {
                channel,
                amount_msat,
            } => {
                debug!("Liquidity: {} -> {}msat", channel, amount_msat);
                if !graph.update_channel(&channel, &channel.opposite(), amount_msat) {
                    debug!("Liquidity: {} is not in the graph", channel);
                }
            }
            LiquidityUpdate::Spent {
                channel,
                amount_msat,
            } => {
                debug!("Liquidity: {} spent {}msat", channel, amount_msat);
                graph.debit_channel(&channel, amount_msat);
            }
            LiquidityUpdate::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Liquidity: update queue closed");
}

impl Node {
    pub async fn queue_liquidity_update(&self, update: LiquidityUpdate) {
        if self.liquidity_tx.send(update).await.is_err() {
            warn!("Liquidity: update queue closed, dropping update");
        }
    }

    /// Wait until every update queued so far has been applied.
    pub async fn flush_liquidity(&self) {
        let (tx, rx) = oneshot::channel();
        self.queue_liquidity_update(LiquidityUpdate::Flush(tx)).await;
        let _ = rx.await;
    }
}

#![allow(dead_code)]

mod client;
mod config;
mod db;
mod error;
mod graph;
mod node;
mod rebalance;
mod scheduler;

use crate::client::{ClnClient, PaymentNotification};
use crate::node::Node;
use crate::rebalance::parallel::{self, ParallelParams, PullParams, PushParams};
use crate::rebalance::RebalanceParams;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use config::Config;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser)]
#[command(
    name = "circular-boss",
    about = "Circular rebalancing sidecar for Core Lightning"
)]
struct Cli {
    /// Path to circular.toml config file
    #[arg(short, long, default_value = "circular.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep the graph and peers fresh in the background (default)
    Daemon,
    /// Run every periodic task once and exit
    RunOnce,
    /// Rebalance from our best channel with one peer into our best channel with another
    RebalanceNode {
        /// Peer to send through
        #[arg(long = "out")]
        out_node: String,
        /// Peer to receive from
        #[arg(long = "in")]
        in_node: String,
        #[command(flatten)]
        opts: RebalanceOpts,
    },
    /// Rebalance from one of our channels into another
    RebalanceChannel {
        #[arg(long = "out")]
        out_scid: String,
        #[arg(long = "in")]
        in_scid: String,
        #[command(flatten)]
        opts: RebalanceOpts,
    },
    /// Fill our side of a channel from many cheap channels at once
    Pull {
        #[arg(long = "in")]
        in_scid: String,
        /// Comma separated channels to drain, bypassing --max-out-ppm
        #[arg(long, value_delimiter = ',')]
        out_list: Option<Vec<String>>,
        #[arg(long)]
        max_out_ppm: Option<u64>,
        #[arg(long)]
        deplete_up_to_percent: Option<f64>,
        /// sat
        #[arg(long)]
        deplete_up_to_amount: Option<u64>,
        #[command(flatten)]
        opts: ParallelOpts,
    },
    /// Empty our side of a channel into many well-earning channels at once
    Push {
        #[arg(long = "out")]
        out_scid: String,
        /// Comma separated channels to fill, bypassing --min-out-ppm
        #[arg(long, value_delimiter = ',')]
        in_list: Option<Vec<String>>,
        #[arg(long)]
        min_out_ppm: Option<u64>,
        #[arg(long)]
        fill_up_to_percent: Option<f64>,
        /// sat
        #[arg(long)]
        fill_up_to_amount: Option<u64>,
        #[command(flatten)]
        opts: ParallelOpts,
    },
    /// Print graph stats and stored payment records
    Stats,
    /// Delete stored payment records
    DeleteStats,
    /// Decide an incoming HTLC for the htlc_accepted hook
    ResolveHtlc { payment_hash: String },
    /// Take in a sendpay_success / sendpay_failure notification (JSON)
    PaymentNotification { notification: String },
}

#[derive(Args, Default)]
struct RebalanceOpts {
    /// sat
    #[arg(long)]
    amount: Option<u64>,
    #[arg(long)]
    max_ppm: Option<u64>,
    #[arg(long)]
    attempts: Option<u32>,
    #[arg(long)]
    max_hops: Option<usize>,
}

impl From<RebalanceOpts> for RebalanceParams {
    fn from(opts: RebalanceOpts) -> Self {
        Self {
            amount_sat: opts.amount,
            max_ppm: opts.max_ppm,
            attempts: opts.attempts,
            max_hops: opts.max_hops,
        }
    }
}

#[derive(Args, Default)]
struct ParallelOpts {
    /// Total to move, sat
    #[arg(long)]
    amount: Option<u64>,
    #[arg(long)]
    max_ppm: Option<u64>,
    /// Split payments in flight at once
    #[arg(long)]
    splits: Option<usize>,
    /// sat
    #[arg(long)]
    split_amount: Option<u64>,
    #[arg(long)]
    attempts: Option<u32>,
    #[arg(long)]
    max_hops: Option<usize>,
}

impl ParallelOpts {
    fn into_params(self, candidates: Option<Vec<String>>) -> ParallelParams {
        ParallelParams {
            amount_sat: self.amount,
            max_ppm: self.max_ppm,
            splits: self.splits,
            split_amount_sat: self.split_amount,
            attempts: self.attempts,
            max_hops: self.max_hops,
            candidates,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = config.general.log_level.clone();
    env_logger::Builder::new()
        .filter_level(log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_secs()
        .init();

    info!("circular-boss v{} starting", env!("CARGO_PKG_VERSION"));

    if config.general.dry_run {
        warn!("DRY-RUN MODE: routes are priced but never paid");
    }

    let command = cli.command.unwrap_or(Commands::Daemon);

    // the hook shim only needs the store, not lightningd
    if let Commands::ResolveHtlc { payment_hash } = &command {
        std::fs::create_dir_all(&config.general.data_dir)?;
        let store = db::Store::open(&config.general.data_dir.join(node::DB_FILE))?;
        println!("{}", to_json(&node::htlc::resolve_htlc(&store, payment_hash))?);
        return Ok(());
    }

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal, finishing current work...");
        let _ = shutdown_tx.send(true);
    });

    info!("Connecting to lightningd at {}", config.rpc.socket_path.display());
    let rpc = Arc::new(ClnClient::new(&config)?);
    let node = match Node::start(&config, rpc).await {
        Ok(node) => node,
        Err(e) => {
            error!("Cannot start: {:#}. Aborting.", e);
            return Err(e);
        }
    };

    match command {
        Commands::Daemon => run_daemon(&config, node, shutdown_rx).await,
        Commands::RunOnce => run_once(&config, &node).await,
        command => {
            let output = run_command(node, command, shutdown_rx).await?;
            println!("{}", output);
            Ok(())
        }
    }
}

async fn run_daemon(
    config: &Config,
    node: Arc<Node>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut sched = scheduler::Scheduler::new(config);
    let interval = std::time::Duration::from_secs(config.general.tick_secs);

    info!("Entering main loop (tick: {}s)", config.general.tick_secs);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if let Err(e) = run_cycle(&node, &sched).await {
            error!("Cycle error: {:#}", e);
        }

        sched.tick();

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown_rx.changed() => break,
        }
    }

    info!("Shutting down gracefully");
    node.persist_beliefs().await;
    Ok(())
}

async fn run_once(config: &Config, node: &Node) -> anyhow::Result<()> {
    info!("Running single cycle...");
    let sched = scheduler::Scheduler::new_force_all(config);
    run_cycle(node, &sched).await?;
    info!("Single cycle complete");
    Ok(())
}

/// One pass over the periodic tasks that are due; a failing task does not
/// stop the others.
pub async fn run_cycle(node: &Node, sched: &scheduler::Scheduler) -> anyhow::Result<()> {
    if sched.should_refresh_graph() {
        match node.refresh_graph().await {
            Ok(()) => node.persist_beliefs().await,
            Err(e) => error!("Graph refresh error: {:#}", e),
        }
    }

    if sched.should_refresh_peers() {
        if let Err(e) = node.refresh_peers().await {
            error!("Peer refresh error: {:#}", e);
        }
        let resolved = node.check_timed_out_payments().await;
        if resolved > 0 {
            info!("Settled {} timed out payments", resolved);
            node.persist_beliefs().await;
        }
    }

    if sched.should_age_liquidity() {
        let aged = node.age_liquidity();
        if aged > 0 {
            debug!("Aged liquidity of {} channels", aged);
        }
    }

    if sched.should_report_stats() {
        info!("{}", node.graph.stats());
        match node.store.purge_expired() {
            Ok(0) => {}
            Ok(n) => info!("Purged {} expired records", n),
            Err(e) => warn!("Store purge error: {:#}", e),
        }
    }

    Ok(())
}

/// Run a one-shot command and render its output.
async fn run_command(
    node: Arc<Node>,
    command: Commands,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<String> {
    match command {
        Commands::RebalanceNode {
            out_node,
            in_node,
            opts,
        } => {
            let result = rebalance::rebalance_by_node(
                node.clone(),
                Some(&out_node),
                Some(&in_node),
                opts.into(),
            )
            .await;
            node.persist_beliefs().await;
            to_json(&result)
        }
        Commands::RebalanceChannel {
            out_scid,
            in_scid,
            opts,
        } => {
            let result = rebalance::rebalance_by_scid(
                node.clone(),
                Some(&out_scid),
                Some(&in_scid),
                opts.into(),
            )
            .await;
            node.persist_beliefs().await;
            to_json(&result)
        }
        Commands::Pull {
            in_scid,
            out_list,
            max_out_ppm,
            deplete_up_to_percent,
            deplete_up_to_amount,
            opts,
        } => {
            let params = PullParams {
                parallel: opts.into_params(out_list),
                max_out_ppm,
                deplete_up_to_percent,
                deplete_up_to_amount_sat: deplete_up_to_amount,
            };
            let result =
                parallel::rebalance_pull(node.clone(), Some(&in_scid), params, shutdown_rx).await;
            node.persist_beliefs().await;
            to_json(&result)
        }
        Commands::Push {
            out_scid,
            in_list,
            min_out_ppm,
            fill_up_to_percent,
            fill_up_to_amount,
            opts,
        } => {
            let params = PushParams {
                parallel: opts.into_params(in_list),
                min_out_ppm,
                fill_up_to_percent,
                fill_up_to_amount_sat: fill_up_to_amount,
            };
            let result =
                parallel::rebalance_push(node.clone(), Some(&out_scid), params, shutdown_rx).await;
            node.persist_beliefs().await;
            to_json(&result)
        }
        Commands::Stats => Ok(node.stats().to_string()),
        Commands::DeleteStats => to_json(&node.delete_stats()),
        Commands::ResolveHtlc { payment_hash } => to_json(&node.on_htlc_accepted(&payment_hash)),
        Commands::PaymentNotification { notification } => {
            let notification: PaymentNotification = serde_json::from_str(&notification)
                .context("Unrecognised payment notification")?;
            let ours = node.on_payment_notification(notification).await;
            if ours {
                node.persist_beliefs().await;
            }
            to_json(&serde_json::json!({ "ours": ours }))
        }
        Commands::Daemon | Commands::RunOnce => {
            anyhow::bail!("not a one-shot command")
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

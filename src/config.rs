use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub rpc: RpcConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub liquidity: LiquidityConfig,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Path to lightningd's JSON-RPC unix socket
    pub socket_path: PathBuf,
    /// Timeout for a single non-payment RPC call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Directory holding graph.json and the store database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Dry-run mode: find and price routes but never send
    #[serde(default)]
    pub dry_run: bool,
    /// Keep success/failure/route records in the store
    #[serde(default = "default_true")]
    pub save_stats: bool,
    /// How long to wait for a sent payment to resolve
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_secs: u64,
    /// Scheduler tick in seconds
    #[serde(default = "default_tick")]
    pub tick_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_graph_refresh")]
    pub graph_refresh_secs: u64,
    #[serde(default = "default_peer_refresh")]
    pub peer_refresh_secs: u64,
    #[serde(default = "default_liquidity_refresh")]
    pub liquidity_refresh_secs: u64,
    #[serde(default = "default_stats")]
    pub stats_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiquidityConfig {
    /// Fraction of the gap to 50/50 closed on every aging pass (0 disables)
    #[serde(default)]
    pub aging_percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebalanceConfig {
    #[serde(default = "default_amount")]
    pub default_amount_sat: u64,
    #[serde(default = "default_max_ppm")]
    pub default_max_ppm: u64,
    #[serde(default = "default_attempts")]
    pub default_attempts: u32,
    #[serde(default = "default_max_hops")]
    pub default_max_hops: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParallelConfig {
    #[serde(default = "default_parallel_amount")]
    pub default_amount_sat: u64,
    #[serde(default = "default_splits")]
    pub default_splits: usize,
    #[serde(default = "default_split_amount")]
    pub default_split_amount_sat: u64,
    /// Pull: only drain channels whose outbound fee is below this
    #[serde(default = "default_max_out_ppm")]
    pub default_max_out_ppm: u64,
    #[serde(default = "default_deplete_percent")]
    pub default_deplete_up_to_percent: f64,
    #[serde(default = "default_deplete_amount")]
    pub default_deplete_up_to_amount_sat: u64,
    /// Push: only fill channels whose outbound fee is above this
    #[serde(default = "default_min_out_ppm")]
    pub default_min_out_ppm: u64,
    #[serde(default = "default_fill_percent")]
    pub default_fill_up_to_percent: f64,
    #[serde(default = "default_fill_amount")]
    pub default_fill_up_to_amount_sat: u64,
}

// Default value functions
fn default_call_timeout() -> u64 {
    60
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("circular")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_payment_timeout() -> u64 {
    120
}
fn default_tick() -> u64 {
    10
}
fn default_graph_refresh() -> u64 {
    600
}
fn default_peer_refresh() -> u64 {
    30
}
fn default_liquidity_refresh() -> u64 {
    600
}
fn default_stats() -> u64 {
    600
}
fn default_amount() -> u64 {
    200_000
}
fn default_max_ppm() -> u64 {
    10
}
fn default_attempts() -> u32 {
    1
}
fn default_max_hops() -> usize {
    8
}
fn default_parallel_amount() -> u64 {
    400_000
}
fn default_splits() -> usize {
    4
}
fn default_split_amount() -> u64 {
    100_000
}
fn default_max_out_ppm() -> u64 {
    50
}
fn default_deplete_percent() -> f64 {
    0.2
}
fn default_deplete_amount() -> u64 {
    1_000_000
}
fn default_min_out_ppm() -> u64 {
    50
}
fn default_fill_percent() -> f64 {
    0.8
}
fn default_fill_amount() -> u64 {
    10_000_000
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            dry_run: false,
            save_stats: true,
            payment_timeout_secs: default_payment_timeout(),
            tick_secs: default_tick(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            graph_refresh_secs: default_graph_refresh(),
            peer_refresh_secs: default_peer_refresh(),
            liquidity_refresh_secs: default_liquidity_refresh(),
            stats_secs: default_stats(),
        }
    }
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self { aging_percent: 0.0 }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            default_amount_sat: default_amount(),
            default_max_ppm: default_max_ppm(),
            default_attempts: default_attempts(),
            default_max_hops: default_max_hops(),
        }
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            default_amount_sat: default_parallel_amount(),
            default_splits: default_splits(),
            default_split_amount_sat: default_split_amount(),
            default_max_out_ppm: default_max_out_ppm(),
            default_deplete_up_to_percent: default_deplete_percent(),
            default_deplete_up_to_amount_sat: default_deplete_amount(),
            default_min_out_ppm: default_min_out_ppm(),
            default_fill_up_to_percent: default_fill_percent(),
            default_fill_up_to_amount_sat: default_fill_amount(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Hard limits (non-configurable safety rails)
        const ABS_MAX_HOPS: usize = 20;
        const ABS_MAX_FEE_PPM: u64 = 50_000;
        const ABS_MAX_SPLITS: usize = 16;
        const ABS_MAX_ATTEMPTS: u32 = 100;

        if self.rebalance.default_max_hops > ABS_MAX_HOPS {
            anyhow::bail!(
                "default_max_hops ({}) above absolute maximum ({})",
                self.rebalance.default_max_hops,
                ABS_MAX_HOPS
            );
        }
        if self.rebalance.default_max_hops < 2 {
            anyhow::bail!("default_max_hops must leave room for the two own hops");
        }
        if self.rebalance.default_max_ppm > ABS_MAX_FEE_PPM {
            anyhow::bail!(
                "default_max_ppm ({}) above absolute maximum ({})",
                self.rebalance.default_max_ppm,
                ABS_MAX_FEE_PPM
            );
        }
        if self.rebalance.default_attempts == 0
            || self.rebalance.default_attempts > ABS_MAX_ATTEMPTS
        {
            anyhow::bail!(
                "default_attempts must be between 1 and {}",
                ABS_MAX_ATTEMPTS
            );
        }
        if self.parallel.default_splits == 0 || self.parallel.default_splits > ABS_MAX_SPLITS {
            anyhow::bail!("default_splits must be between 1 and {}", ABS_MAX_SPLITS);
        }
        if self.parallel.default_split_amount_sat == 0 {
            anyhow::bail!("default_split_amount_sat must be greater than zero");
        }
        for (name, value) in [
            (
                "default_deplete_up_to_percent",
                self.parallel.default_deplete_up_to_percent,
            ),
            (
                "default_fill_up_to_percent",
                self.parallel.default_fill_up_to_percent,
            ),
            ("aging_percent", self.liquidity.aging_percent),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be between 0 and 1", name);
            }
        }
        if self.general.tick_secs == 0 {
            anyhow::bail!("tick_secs must be greater than zero");
        }
        for (name, value) in [
            ("graph_refresh_secs", self.schedule.graph_refresh_secs),
            ("peer_refresh_secs", self.schedule.peer_refresh_secs),
            ("liquidity_refresh_secs", self.schedule.liquidity_refresh_secs),
            ("stats_secs", self.schedule.stats_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.general.payment_timeout_secs == 0 {
            anyhow::bail!("payment_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Create a config with all defaults for testing purposes.
    #[cfg(test)]
    pub fn test_default(data_dir: PathBuf) -> Self {
        Self {
            rpc: RpcConfig {
                socket_path: PathBuf::from("/tmp/lightning-rpc"),
                call_timeout_secs: default_call_timeout(),
            },
            general: GeneralConfig {
                data_dir,
                ..GeneralConfig::default()
            },
            schedule: ScheduleConfig::default(),
            liquidity: LiquidityConfig::default(),
            rebalance: RebalanceConfig::default(),
            parallel: ParallelConfig::default(),
        }
    }
}

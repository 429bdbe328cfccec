//! Keeper runtime configuration.
//!
//! Every field has a default so an empty or partial TOML file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use keeper_api::{DEFAULT_INDEXER_URL, DEFAULT_MARKETS_URL, DEFAULT_PRICES_URL};
use keeper_chain::SamplingConfig;

/// Main configuration structure for the keeper process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub protection: ProtectionConfig,

    #[serde(default)]
    pub rebalance: RebalanceConfig,

    #[serde(default)]
    pub gas: GasSamplingConfig,

    #[serde(default)]
    pub services: ServicesConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// What to do when a tick fires while the previous cycle is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the tick.
    #[default]
    Skip,
    /// Start another cycle alongside the running one.
    Overlap,
}

/// Per-chain cycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cycle period (milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default)]
    pub overlap: OverlapPolicy,

    /// Ranking service keep-alive period (seconds)
    #[serde(default = "default_warmup_interval")]
    pub market_warmup_secs: u64,
}

fn default_interval_ms() -> u64 {
    60_000
}
fn default_warmup_interval() -> u64 {
    15 * 60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            overlap: OverlapPolicy::default(),
            market_warmup_secs: default_warmup_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
    pub fn market_warmup_interval(&self) -> Duration {
        Duration::from_secs(self.market_warmup_secs)
    }
}

/// Liquidation protection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Health factor below which a borrow is at risk
    #[serde(default = "default_danger_hf")]
    pub danger_health_factor: f64,

    /// Share of the owner's available collateral supplied per top-up (bps)
    #[serde(default = "default_top_up_bps")]
    pub top_up_bps: u16,
}

fn default_danger_hf() -> f64 {
    1.1
}
fn default_top_up_bps() -> u16 {
    1_000
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            danger_health_factor: default_danger_hf(),
            top_up_bps: default_top_up_bps(),
        }
    }
}

/// Rebalance planning limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Steps of a yield plan submitted per cycle; 0 submits the whole plan
    #[serde(default = "default_max_steps")]
    pub max_steps_per_cycle: usize,

    /// Protocol whose reserves always back borrows
    #[serde(default = "default_borrow_protocol")]
    pub borrow_protocol: u16,
}

fn default_max_steps() -> usize {
    1
}
fn default_borrow_protocol() -> u16 {
    1
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            max_steps_per_cycle: default_max_steps(),
            borrow_protocol: default_borrow_protocol(),
        }
    }
}

/// Block sampling and fee recommendation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasSamplingConfig {
    #[serde(default = "default_min_tx_count")]
    pub min_tx_count: usize,

    #[serde(default = "default_max_blocks")]
    pub max_blocks: usize,

    /// Gas limit above which a transaction counts as heavy
    #[serde(default)]
    pub min_gas_used: u64,

    /// Multiplier applied to the median heavy price
    #[serde(default = "default_buffer")]
    pub buffer: f64,
}

fn default_min_tx_count() -> usize {
    1_000
}
fn default_max_blocks() -> usize {
    50
}
fn default_buffer() -> f64 {
    1.2
}

impl Default for GasSamplingConfig {
    fn default() -> Self {
        Self {
            min_tx_count: default_min_tx_count(),
            max_blocks: default_max_blocks(),
            min_gas_used: 0,
            buffer: default_buffer(),
        }
    }
}

impl GasSamplingConfig {
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            min_tx_count: self.min_tx_count,
            max_blocks: self.max_blocks,
        }
    }
}

/// Off-chain service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_markets_url")]
    pub markets_url: String,

    #[serde(default = "default_indexer_url")]
    pub indexer_url: String,

    #[serde(default = "default_prices_url")]
    pub prices_url: String,

    /// Price cache TTL (seconds)
    #[serde(default = "default_price_ttl")]
    pub price_ttl_secs: u64,
}

fn default_markets_url() -> String {
    DEFAULT_MARKETS_URL.to_string()
}
fn default_indexer_url() -> String {
    DEFAULT_INDEXER_URL.to_string()
}
fn default_prices_url() -> String {
    DEFAULT_PRICES_URL.to_string()
}
fn default_price_ttl() -> u64 {
    60
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            markets_url: default_markets_url(),
            indexer_url: default_indexer_url(),
            prices_url: default_prices_url(),
            price_ttl_secs: default_price_ttl(),
        }
    }
}

impl ServicesConfig {
    pub fn price_ttl(&self) -> Duration {
        Duration::from_secs(self.price_ttl_secs)
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            scheduler: SchedulerConfig::default(),
            protection: ProtectionConfig::default(),
            rebalance: RebalanceConfig::default(),
            gas: GasSamplingConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

impl KeeperConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Keeper configuration loaded");
        tracing::info!(
            interval_ms = self.scheduler.interval_ms,
            overlap = ?self.scheduler.overlap,
            market_warmup_secs = self.scheduler.market_warmup_secs,
            "Scheduler"
        );
        tracing::info!(
            danger_hf = self.protection.danger_health_factor,
            top_up_bps = self.protection.top_up_bps,
            "Liquidation protection"
        );
        tracing::info!(
            max_steps = self.rebalance.max_steps_per_cycle,
            borrow_protocol = self.rebalance.borrow_protocol,
            "Rebalance"
        );
        tracing::info!(
            min_tx_count = self.gas.min_tx_count,
            max_blocks = self.gas.max_blocks,
            min_gas_used = self.gas.min_gas_used,
            buffer = self.gas.buffer,
            "Gas sampling"
        );
        tracing::info!(
            markets = %self.services.markets_url,
            indexer = %self.services.indexer_url,
            prices = %self.services.prices_url,
            price_ttl_secs = self.services.price_ttl_secs,
            "Services"
        );
    }
}

//! Configuration for the keeper process.
//!
//! - Keeper runtime settings (scheduler, thresholds, gas sampling, services)
//! - Chain files (RPC endpoint, pricing model, price-oracle slug)
//! - Environment (private key, interval override, config paths)

mod chain;
mod env;
mod keeper;

pub use chain::{ChainConfig, ChainDetails, GasConfig, RpcConfig};
pub use env::{
    load_env, parse_interval_ms, parse_private_key, vars, ConfigError, KeeperEnv,
    DEFAULT_CHAINS_DIR,
};
pub use keeper::{
    GasSamplingConfig, KeeperConfig, OverlapPolicy, ProtectionConfig, RebalanceConfig,
    SchedulerConfig, ServicesConfig,
};

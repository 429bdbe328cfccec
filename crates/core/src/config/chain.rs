//! Per-chain configuration files (`config/chains/*.toml`).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use keeper_chain::GasPricingModel;

/// One chain the keeper operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain: ChainDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDetails {
    pub chain_id: u64,
    /// Human-readable name
    pub name: String,
    /// Chain slug used by the price oracle (e.g. "base", "bsc")
    pub price_chain: String,
    /// Explorer URL for transaction links
    #[serde(default)]
    pub explorer_url: Option<String>,
    /// Replace stuck transactions before the first cycle
    #[serde(default)]
    pub cancel_pending_on_start: bool,
    pub rpc: RpcConfig,
    #[serde(default)]
    pub gas: GasConfig,
}

/// RPC endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// HTTP JSON-RPC endpoint, `${VAR}` references are expanded at load
    pub http: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GasConfig {
    #[serde(default)]
    pub pricing: GasPricingModel,
    /// Maximum gas price willing to pay (in gwei)
    #[serde(default)]
    pub max_gas_price_gwei: Option<f64>,
}

impl ChainDetails {
    /// Explorer link for a transaction hash, when an explorer is configured.
    pub fn tx_url(&self, tx_hash: impl std::fmt::Display) -> Option<String> {
        self.explorer_url
            .as_ref()
            .map(|base| format!("{}/tx/{tx_hash}", base.trim_end_matches('/')))
    }
}

impl ChainConfig {
    /// Load chain config from a TOML file and expand its RPC URL.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chain config {}", path.display()))?;
        let mut config: ChainConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid chain config {}", path.display()))?;
        config.expand_env_vars()?;
        Ok(config)
    }

    /// Load every `*.toml` file in a directory, sorted by file name.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Self>> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read chains directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        if paths.is_empty() {
            bail!("No chain configs found in {}", dir.display());
        }
        paths.iter().map(Self::from_file).collect()
    }

    /// Expand `${VAR}` references in the RPC URL.
    pub fn expand_env_vars(&mut self) -> Result<()> {
        self.chain.rpc.http = expand_env(&self.chain.rpc.http)
            .with_context(|| format!("RPC URL for chain {}", self.chain.name))?;
        Ok(())
    }
}

/// Expand ${VAR_NAME} patterns with environment variable values.
/// An unset variable is an error.
fn expand_env(s: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")?;
    let mut result = s.to_string();

    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            let var_name = var_match.as_str();
            let value = std::env::var(var_name)
                .with_context(|| format!("Environment variable {var_name} is not set"))?;
            result = result.replace(full_match.as_str(), &value);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [chain]
        chain_id = 8453
        name = "base"
        price_chain = "base"
        explorer_url = "https://basescan.org/"

        [chain.rpc]
        http = "https://mainnet.base.org"

        [chain.gas]
        pricing = "Eip1559"
        max_gas_price_gwei = 5.0
    "#;

    #[test]
    fn test_parse_chain_config() {
        let config: ChainConfig = toml::from_str(BASE).unwrap();
        assert_eq!(config.chain.chain_id, 8453);
        assert_eq!(config.chain.gas.pricing, GasPricingModel::Eip1559);
        assert_eq!(config.chain.gas.max_gas_price_gwei, Some(5.0));
        assert!(!config.chain.cancel_pending_on_start);
        assert_eq!(
            config.chain.tx_url("0xabc").as_deref(),
            Some("https://basescan.org/tx/0xabc")
        );
    }

    #[test]
    fn test_gas_section_defaults_to_legacy() {
        let config: ChainConfig = toml::from_str(
            r#"
            [chain]
            chain_id = 56
            name = "bsc"
            price_chain = "bsc"
            [chain.rpc]
            http = "https://bsc-dataseed.binance.org"
            "#,
        )
        .unwrap();
        assert_eq!(config.chain.gas.pricing, GasPricingModel::Legacy);
        assert!(config.chain.gas.max_gas_price_gwei.is_none());
        assert!(config.chain.tx_url("0x1").is_none());
    }

    #[test]
    fn test_expand_env() {
        // Use unique var name to avoid conflicts with parallel tests
        std::env::set_var("CHAIN_CONFIG_TEST_KEY", "secret");
        assert_eq!(
            expand_env("https://rpc.example/${CHAIN_CONFIG_TEST_KEY}").unwrap(),
            "https://rpc.example/secret"
        );
        assert_eq!(expand_env("no_vars").unwrap(), "no_vars");
        std::env::remove_var("CHAIN_CONFIG_TEST_KEY");

        assert!(expand_env("${CHAIN_CONFIG_TEST_UNSET_VAR}").is_err());
    }
}

//! Process environment: secrets and overrides.

use std::path::PathBuf;
use thiserror::Error;

/// Environment variable names.
pub mod vars {
    pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
    pub const INTERVAL_MS: &str = "INTERVAL_MS";
    pub const KEEPER_CONFIG: &str = "KEEPER_CONFIG";
    pub const KEEPER_CHAINS_DIR: &str = "KEEPER_CHAINS_DIR";
}

pub const DEFAULT_CHAINS_DIR: &str = "config/chains";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("PRIVATE_KEY must be 32 bytes of hex, {0}")]
    InvalidPrivateKey(String),

    #[error("INTERVAL_MS must be a positive integer, got {0:?}")]
    InvalidInterval(String),
}

/// Validated process environment.
#[derive(Clone)]
pub struct KeeperEnv {
    /// Hex private key with `0x` prefix
    pub private_key: String,
    pub interval_ms: Option<u64>,
    pub config_path: Option<PathBuf>,
    pub chains_dir: PathBuf,
}

impl std::fmt::Debug for KeeperEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperEnv")
            .field("private_key", &"<redacted>")
            .field("interval_ms", &self.interval_ms)
            .field("config_path", &self.config_path)
            .field("chains_dir", &self.chains_dir)
            .finish()
    }
}

/// Normalize a hex private key to `0x`-prefixed form.
pub fn parse_private_key(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(digits).map_err(|e| ConfigError::InvalidPrivateKey(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(ConfigError::InvalidPrivateKey(format!("got {} bytes", bytes.len())));
    }
    Ok(format!("0x{digits}"))
}

pub fn parse_interval_ms(raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(ConfigError::InvalidInterval(raw.to_string())),
    }
}

/// Read and validate the keeper's environment variables.
pub fn load_env() -> Result<KeeperEnv, ConfigError> {
    let raw_key =
        std::env::var(vars::PRIVATE_KEY).map_err(|_| ConfigError::Missing(vars::PRIVATE_KEY))?;
    let private_key = parse_private_key(&raw_key)?;

    let interval_ms = std::env::var(vars::INTERVAL_MS)
        .ok()
        .map(|raw| parse_interval_ms(&raw))
        .transpose()?;

    Ok(KeeperEnv {
        private_key,
        interval_ms,
        config_path: std::env::var(vars::KEEPER_CONFIG).ok().map(PathBuf::from),
        chains_dir: std::env::var(vars::KEEPER_CHAINS_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CHAINS_DIR)),
    })
}

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::types::config::chain::{resolve_chain_config, ChainConfig, ChainConfigRaw};
use crate::types::config::scan::{ConfigError, ScanSettings};
use crate::types::scan::NewScanConfig;

#[derive(Debug, Deserialize)]
pub struct IndexerConfigRaw {
    pub chains: Vec<ChainConfigRaw>,
    #[serde(default = "default_database_url_env_var")]
    pub database_url_env_var: String,
    #[serde(default)]
    pub scan: ScanSettings,
    /// Scan configs created on startup when no config exists for the same
    /// contract and kind.
    #[serde(default)]
    pub scan_configs: Vec<NewScanConfig>,
}

fn default_database_url_env_var() -> String {
    "DATABASE_URL".to_string()
}

#[derive(Debug)]
pub struct IndexerConfig {
    pub chains: Vec<ChainConfig>,
    pub database_url_env_var: String,
    pub scan: ScanSettings,
    pub scan_configs: Vec<NewScanConfig>,
}

impl IndexerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let base_dir = path.parent().unwrap_or(Path::new("."));
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        let raw_config: IndexerConfigRaw = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))?;

        let chains = raw_config
            .chains
            .into_iter()
            .map(|chain| resolve_chain_config(chain, base_dir))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("Failed to resolve chain config")?;

        let config = IndexerConfig {
            chains,
            database_url_env_var: raw_config.database_url_env_var,
            scan: raw_config.scan,
            scan_configs: raw_config.scan_configs,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan.validate()?;

        let mut names = HashSet::new();
        for chain in &self.chains {
            for name in chain.contracts.keys() {
                if !names.insert(name.as_str()) {
                    return Err(ConfigError::DuplicateContract(name.clone()));
                }
            }
        }

        for config in &self.scan_configs {
            if !names.contains(config.contract.as_str()) {
                return Err(ConfigError::UnknownContract(config.contract.clone()));
            }
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<String, ConfigError> {
        std::env::var(&self.database_url_env_var)
            .map_err(|_| ConfigError::MissingEnv(self.database_url_env_var.clone()))
    }
}

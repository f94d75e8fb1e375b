use std::path::Path;

use serde::Deserialize;

use crate::types::config::contract::{load_contracts_from_path, Contracts, ContractsOrPath};
use crate::types::config::scan::ConfigError;

#[derive(Debug, Deserialize)]
pub struct ChainConfigRaw {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url_env_var: String,
    /// Websocket endpoint, required only by realtime scans on this chain.
    #[serde(default)]
    pub ws_url_env_var: Option<String>,
    /// Requests per second allowed against the HTTP endpoint.
    #[serde(default)]
    pub rpc_rate_limit: Option<u32>,
    pub contracts: ContractsOrPath,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url_env_var: String,
    pub ws_url_env_var: Option<String>,
    pub rpc_rate_limit: Option<u32>,
    pub contracts: Contracts,
}

impl ChainConfig {
    pub fn rpc_url(&self) -> Result<String, ConfigError> {
        std::env::var(&self.rpc_url_env_var)
            .map_err(|_| ConfigError::MissingEnv(self.rpc_url_env_var.clone()))
    }

    pub fn ws_url(&self) -> Result<String, ConfigError> {
        let var = self
            .ws_url_env_var
            .as_ref()
            .ok_or_else(|| ConfigError::MissingWebsocket(self.name.clone()))?;
        std::env::var(var).map_err(|_| ConfigError::MissingEnv(var.clone()))
    }
}

pub fn resolve_chain_config(
    raw_config: ChainConfigRaw,
    base_dir: &Path,
) -> anyhow::Result<ChainConfig> {
    let contracts = match raw_config.contracts {
        ContractsOrPath::Inline(contracts) => contracts,
        ContractsOrPath::Path(p) => load_contracts_from_path(base_dir, &p)?,
    };

    Ok(ChainConfig {
        name: raw_config.name,
        chain_id: raw_config.chain_id,
        rpc_url_env_var: raw_config.rpc_url_env_var,
        ws_url_env_var: raw_config.ws_url_env_var,
        rpc_rate_limit: raw_config.rpc_rate_limit,
        contracts,
    })
}

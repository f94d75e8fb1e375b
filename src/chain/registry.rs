//! Lazily built, shared chain clients and contract facades.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use alloy::primitives::Address;
use tokio::sync::OnceCell;

use crate::chain::abi::ContractAbi;
use crate::chain::client::ChainClient;
use crate::chain::facade::ContractFacade;
use crate::chain::subscribe::LogSubscriber;
use crate::rpc::{RpcClient, WsLogSubscriber};
use crate::scan::error::ScanError;
use crate::types::config::chain::ChainConfig;
use crate::types::config::scan::ConfigError;

/// Map whose values are built at most once per key. The map lock is only held
/// to find or insert the key's cell; construction happens outside it.
pub struct OnceMap<K, V> {
    cells: RwLock<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for OnceMap<K, V> {
    fn default() -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> OnceMap<K, V> {
    pub async fn get_or_try_init<F, Fut, E>(&self, key: &K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let existing = self
            .cells
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned();
        let cell = match existing {
            Some(cell) => cell,
            None => self
                .cells
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .entry(key.clone())
                .or_default()
                .clone(),
        };
        cell.get_or_try_init(init).await.cloned()
    }
}

/// Builds the network clients for a chain.
pub trait ClientFactory: Send + Sync {
    fn chain_client(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainClient>, ScanError>;
    fn log_subscriber(&self, chain: &ChainConfig) -> Result<Arc<dyn LogSubscriber>, ScanError>;
}

/// Connects to the endpoints named by each chain's environment variables.
pub struct RpcClientFactory;

impl ClientFactory for RpcClientFactory {
    fn chain_client(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainClient>, ScanError> {
        let url = chain.rpc_url()?;
        let client = RpcClient::from_url(&url, chain.rpc_rate_limit)?;
        tracing::info!(chain = %chain.name, "Created RPC client");
        Ok(Arc::new(client))
    }

    fn log_subscriber(&self, chain: &ChainConfig) -> Result<Arc<dyn LogSubscriber>, ScanError> {
        Ok(Arc::new(WsLogSubscriber::new(chain.ws_url()?)))
    }
}

#[derive(Debug, Clone)]
pub struct ContractEntry {
    pub name: String,
    pub chain_id: u64,
    pub address: Address,
    pub abi: Arc<ContractAbi>,
}

/// Every configured contract by name, with parsed ABIs.
#[derive(Debug, Default)]
pub struct ContractCatalog {
    contracts: HashMap<String, ContractEntry>,
}

impl ContractCatalog {
    pub fn from_chains(chains: &[ChainConfig]) -> Result<Self, ConfigError> {
        let mut contracts = HashMap::new();
        for chain in chains {
            for (name, contract) in &chain.contracts {
                let abi = ContractAbi::from_signatures(&contract.events, &contract.functions)
                    .map_err(|e| ConfigError::InvalidSignature {
                        signature: name.clone(),
                        reason: e.to_string(),
                    })?;
                let entry = ContractEntry {
                    name: name.clone(),
                    chain_id: chain.chain_id,
                    address: contract.address,
                    abi: Arc::new(abi),
                };
                if contracts.insert(name.clone(), entry).is_some() {
                    return Err(ConfigError::DuplicateContract(name.clone()));
                }
            }
        }
        Ok(Self { contracts })
    }

    pub fn get(&self, name: &str) -> Result<&ContractEntry, ConfigError> {
        self.contracts
            .get(name)
            .ok_or_else(|| ConfigError::UnknownContract(name.to_string()))
    }
}

pub struct ClientRegistry {
    catalog: ContractCatalog,
    chains: HashMap<u64, ChainConfig>,
    factory: Arc<dyn ClientFactory>,
    max_scan_block: u64,
    clients: OnceMap<u64, Arc<dyn ChainClient>>,
    subscribers: OnceMap<u64, Arc<dyn LogSubscriber>>,
    facades: OnceMap<String, Arc<ContractFacade>>,
}

impl ClientRegistry {
    pub fn new(
        chains: &[ChainConfig],
        factory: Arc<dyn ClientFactory>,
        max_scan_block: u64,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            catalog: ContractCatalog::from_chains(chains)?,
            chains: chains.iter().map(|c| (c.chain_id, c.clone())).collect(),
            factory,
            max_scan_block,
            clients: OnceMap::default(),
            subscribers: OnceMap::default(),
            facades: OnceMap::default(),
        })
    }

    pub fn catalog(&self) -> &ContractCatalog {
        &self.catalog
    }

    pub fn chain_id_of(&self, contract: &str) -> Option<u64> {
        self.catalog.get(contract).ok().map(|c| c.chain_id)
    }

    fn chain(&self, chain_id: u64) -> Result<&ChainConfig, ScanError> {
        self.chains
            .get(&chain_id)
            .ok_or(ScanError::Config(ConfigError::UnknownChain(chain_id)))
    }

    pub async fn client(&self, chain_id: u64) -> Result<Arc<dyn ChainClient>, ScanError> {
        let chain = self.chain(chain_id)?;
        self.clients
            .get_or_try_init(&chain_id, || async { self.factory.chain_client(chain) })
            .await
    }

    pub async fn subscriber(&self, contract: &str) -> Result<Arc<dyn LogSubscriber>, ScanError> {
        let chain_id = self.catalog.get(contract)?.chain_id;
        let chain = self.chain(chain_id)?;
        self.subscribers
            .get_or_try_init(&chain_id, || async { self.factory.log_subscriber(chain) })
            .await
    }

    /// One facade per contract name. Contracts sharing an address keep their
    /// own ABI but share the chain's client.
    pub async fn facade(&self, contract: &str) -> Result<Arc<ContractFacade>, ScanError> {
        let entry = self.catalog.get(contract)?;
        self.facades
            .get_or_try_init(&entry.name, || async {
                let client = self.client(entry.chain_id).await?;
                Ok::<_, ScanError>(Arc::new(ContractFacade::new(
                    entry.name.clone(),
                    entry.chain_id,
                    entry.address,
                    entry.abi.clone(),
                    client,
                    self.max_scan_block,
                )))
            })
            .await
    }
}

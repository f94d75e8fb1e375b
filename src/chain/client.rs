use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::rpc::RpcError;
use crate::types::scan::BlockRange;

/// A log as returned by the node, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
    /// Set by a subscription when the log was dropped by a reorg.
    pub removed: bool,
}

/// A mined transaction, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTransaction {
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
}

/// The node operations the scan engine depends on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block(&self) -> Result<u64, RpcError>;

    /// Logs in `range` (half-open). Empty `addresses` or `topics` means no
    /// filter on that field; `topics` filters topic0 only.
    async fn get_logs(
        &self,
        range: BlockRange,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<RawLog>, RpcError>;

    /// Every transaction mined in `range`, in block then index order.
    async fn get_block_transactions(&self, range: BlockRange)
        -> Result<Vec<RawTransaction>, RpcError>;

    async fn get_transaction(&self, hash: B256) -> Result<Option<RawTransaction>, RpcError>;
}

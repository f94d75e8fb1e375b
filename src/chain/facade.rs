use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::{Address, B256};

use crate::chain::abi::ContractAbi;
use crate::chain::client::{ChainClient, RawLog, RawTransaction};
use crate::rpc::RpcError;
use crate::scan::error::ScanError;
use crate::types::scan::BlockRange;

/// A contract on a specific chain, bound to that chain's client.
pub struct ContractFacade {
    pub name: String,
    pub chain_id: u64,
    pub address: Address,
    abi: Arc<ContractAbi>,
    client: Arc<dyn ChainClient>,
    max_scan_block: u64,
}

impl ContractFacade {
    pub fn new(
        name: String,
        chain_id: u64,
        address: Address,
        abi: Arc<ContractAbi>,
        client: Arc<dyn ChainClient>,
        max_scan_block: u64,
    ) -> Self {
        Self {
            name,
            chain_id,
            address,
            abi,
            client,
            max_scan_block: max_scan_block.max(1),
        }
    }

    pub fn abi(&self) -> &ContractAbi {
        &self.abi
    }

    pub async fn latest_block(&self) -> Result<u64, RpcError> {
        self.client.latest_block().await
    }

    /// Addresses to match logs or transaction recipients against.
    ///
    /// A configured filter replaces the contract's own address. A filter that
    /// contains the zero address disables address filtering, signalled by an
    /// empty result.
    pub fn address_filter(&self, to_filter: &[Address]) -> Vec<Address> {
        if to_filter.is_empty() {
            vec![self.address]
        } else if to_filter.contains(&Address::ZERO) {
            Vec::new()
        } else {
            to_filter.to_vec()
        }
    }

    /// Logs of the named events (all declared events when `event_names` is
    /// empty), fetched in sub-ranges of at most `max_scan_block` blocks and
    /// returned in chain order.
    pub async fn event_logs(
        &self,
        range: BlockRange,
        event_names: &[String],
        to_filter: &[Address],
    ) -> Result<Vec<RawLog>, ScanError> {
        let topics: Vec<B256> = self.abi.topics_for(event_names)?;
        let addresses = self.address_filter(to_filter);

        let mut logs = Vec::new();
        for chunk in range.chunks(self.max_scan_block) {
            let fetched = self.client.get_logs(chunk, &addresses, &topics).await?;
            tracing::debug!(
                contract = %self.name,
                range = %chunk,
                count = fetched.len(),
                "Fetched logs"
            );
            logs.extend(fetched);
        }
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }

    /// Transactions in `range` sent to the contract or to the configured
    /// recipient filter.
    pub async fn transactions_to(
        &self,
        range: BlockRange,
        to_filter: &[Address],
    ) -> Result<Vec<RawTransaction>, ScanError> {
        let recipients: HashSet<Address> = self.address_filter(to_filter).into_iter().collect();
        let txs = self.client.get_block_transactions(range).await?;
        Ok(txs
            .into_iter()
            .filter(|tx| {
                recipients.is_empty() || tx.to.is_some_and(|to| recipients.contains(&to))
            })
            .collect())
    }

    pub async fn sender_of(&self, transaction_hash: B256) -> Result<Option<Address>, RpcError> {
        Ok(self
            .client
            .get_transaction(transaction_hash)
            .await?
            .map(|tx| tx.from))
    }
}

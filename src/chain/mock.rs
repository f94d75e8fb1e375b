//! In-memory chain used by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{address, keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::chain::abi::ContractAbi;
use crate::chain::client::{ChainClient, RawLog, RawTransaction};
use crate::chain::subscribe::{LogStream, LogSubscriber};
use crate::rpc::RpcError;
use crate::types::scan::BlockRange;

pub const TRANSFER: &str = "Transfer(address indexed from, address indexed to, uint256 value)";
pub const SWAP: &str = "swap(address recipient, uint256 amount)";

#[derive(Default)]
struct MockState {
    head: u64,
    logs: Vec<RawLog>,
    transactions: Vec<RawTransaction>,
    failing_log_requests: usize,
}

#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
    log_requests: AtomicUsize,
}

impl MockChain {
    pub const TOKEN: Address = address!("1111111111111111111111111111111111111111");
    pub const SENDER: Address = address!("2222222222222222222222222222222222222222");
    pub const RECEIVER: Address = address!("3333333333333333333333333333333333333333");

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn push_log(&self, log: RawLog) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn remove_logs_at(&self, block: u64) {
        self.state
            .lock()
            .unwrap()
            .logs
            .retain(|l| l.block_number != block);
    }

    pub fn push_transaction(&self, tx: RawTransaction) {
        self.state.lock().unwrap().transactions.push(tx);
    }

    /// Make the next `n` log requests fail with a transport error.
    pub fn fail_next_log_requests(&self, n: usize) {
        self.state.lock().unwrap().failing_log_requests = n;
    }

    pub fn log_requests(&self) -> usize {
        self.log_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn latest_block(&self) -> Result<u64, RpcError> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn get_logs(
        &self,
        range: BlockRange,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<RawLog>, RpcError> {
        self.log_requests.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.failing_log_requests > 0 {
            state.failing_log_requests -= 1;
            return Err(RpcError::Transport("connection reset".to_string()));
        }
        Ok(state
            .logs
            .iter()
            .filter(|l| range.contains(l.block_number))
            .filter(|l| addresses.is_empty() || addresses.contains(&l.address))
            .filter(|l| {
                topics.is_empty() || l.topics.first().is_some_and(|t0| topics.contains(t0))
            })
            .cloned()
            .collect())
    }

    async fn get_block_transactions(
        &self,
        range: BlockRange,
    ) -> Result<Vec<RawTransaction>, RpcError> {
        let state = self.state.lock().unwrap();
        let mut txs: Vec<RawTransaction> = state
            .transactions
            .iter()
            .filter(|tx| range.contains(tx.block_number))
            .cloned()
            .collect();
        txs.sort_by_key(|tx| (tx.block_number, tx.transaction_index));
        Ok(txs)
    }

    async fn get_transaction(&self, hash: B256) -> Result<Option<RawTransaction>, RpcError> {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.transactions.iter().find(|tx| tx.hash == hash) {
            return Ok(Some(tx.clone()));
        }
        // Logs pushed without a matching transaction are treated as sent by SENDER.
        Ok(state
            .logs
            .iter()
            .find(|l| l.transaction_hash == hash)
            .map(|l| RawTransaction {
                hash,
                block_hash: l.block_hash,
                block_number: l.block_number,
                transaction_index: l.transaction_index,
                from: Self::SENDER,
                to: Some(l.address),
                value: U256::ZERO,
                input: Bytes::new(),
            }))
    }
}

pub fn transfer_abi() -> ContractAbi {
    ContractAbi::from_signatures(
        &[TRANSFER.to_string()],
        &["multicall(bytes[] data)".to_string(), SWAP.to_string()],
    )
    .unwrap()
}

pub fn tx_hash(block: u64, index: u64) -> B256 {
    keccak256(format!("tx-{}-{}", block, index))
}

pub fn block_hash(block: u64) -> B256 {
    keccak256(format!("block-{}", block))
}

/// A Transfer(SENDER -> RECEIVER, 1000) log emitted by TOKEN.
pub fn transfer_log(block: u64, log_index: u64) -> RawLog {
    let abi = transfer_abi();
    let topic0 = abi.events().next().unwrap().topic0;
    RawLog {
        address: MockChain::TOKEN,
        topics: vec![
            topic0,
            MockChain::SENDER.into_word(),
            MockChain::RECEIVER.into_word(),
        ],
        data: DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(1000u64), 256)])
            .abi_encode_params()
            .into(),
        block_hash: block_hash(block),
        block_number: block,
        transaction_hash: tx_hash(block, log_index),
        transaction_index: log_index,
        log_index,
        removed: false,
    }
}

/// Calldata for `swap(RECEIVER, amount)`.
pub fn swap_input(amount: u64) -> Bytes {
    let abi = transfer_abi();
    let swap = abi.functions().find(|f| f.name == "swap").unwrap();
    let mut input = swap.selector.to_vec();
    input.extend(
        DynSolValue::Tuple(vec![
            DynSolValue::Address(MockChain::RECEIVER),
            DynSolValue::Uint(U256::from(amount), 256),
        ])
        .abi_encode_params(),
    );
    input.into()
}

pub fn swap_transaction(block: u64, index: u64, input: Bytes) -> RawTransaction {
    RawTransaction {
        hash: tx_hash(block, index),
        block_hash: block_hash(block),
        block_number: block,
        transaction_index: index,
        from: MockChain::SENDER,
        to: Some(MockChain::TOKEN),
        value: U256::ZERO,
        input,
    }
}

/// Subscriber handing out pre-scripted streams, one per `subscribe` call.
/// A stream that runs out of items stays silent forever.
#[derive(Default)]
pub struct MockSubscriber {
    scripts: Mutex<VecDeque<Vec<Result<RawLog, RpcError>>>>,
    subscriptions: AtomicUsize,
}

impl MockSubscriber {
    pub fn new(scripts: Vec<Vec<Result<RawLog, RpcError>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSubscriber for MockSubscriber {
    async fn subscribe(
        &self,
        _addresses: &[Address],
        _topics: &[B256],
    ) -> Result<Box<dyn LogStream>, RpcError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let items = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedStream {
            items: items.into(),
        }))
    }
}

struct ScriptedStream {
    items: VecDeque<Result<RawLog, RpcError>>,
}

#[async_trait]
impl LogStream for ScriptedStream {
    async fn next_log(&mut self) -> Result<RawLog, RpcError> {
        match self.items.pop_front() {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }
}

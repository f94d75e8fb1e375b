use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use alloy::consensus::Transaction as ConsensusTransaction;
use alloy::network::{Ethereum, TransactionResponse};
use alloy::primitives::{Address, BlockNumber, B256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Block, BlockNumberOrTag, Filter, Log, Transaction};
use async_trait::async_trait;
use governor::clock::{QuantaClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use thiserror::Error;
use url::Url;

use crate::chain::client::{ChainClient, RawLog, RawTransaction};
use crate::types::scan::BlockRange;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Incomplete response: {0}")]
    IncompleteResponse(String),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("No message within {0:?}")]
    Timeout(Duration),
}

impl RpcError {
    /// Check if this error is likely transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport(_) | RpcError::RateLimitExceeded | RpcError::Timeout(_) => true,
            RpcError::InvalidUrl(_) | RpcError::SubscriptionClosed(_) => false,
            // Pending blocks and transactions come back with null fields.
            RpcError::IncompleteResponse(_) => true,
            RpcError::ProviderError(msg) => Self::is_retryable_message(msg),
        }
    }

    fn is_retryable_message(msg: &str) -> bool {
        let msg_lower = msg.to_lowercase();
        [
            "connection",
            "timeout",
            "timed out",
            "reset",
            "broken pipe",
            "network",
            "eof",
            "sending request",
            "rate limit",
            "too many requests",
            "429",
            "502",
            "503",
            "504",
            "internal server error",
            "service unavailable",
            "bad gateway",
            "temporarily",
            "try again",
        ]
        .iter()
        .any(|needle| msg_lower.contains(needle))
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay for a given attempt number (0-indexed); attempt 0 never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1);
        std::cmp::min(Duration::from_millis(delay_ms as u64), self.max_delay)
    }
}

/// Execute an async operation with retry logic
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt);
            tracing::warn!(
                "RPC retry {}/{} for '{}' in {:?}",
                attempt,
                config.max_retries,
                operation_name,
                delay
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!("RPC '{}' succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                tracing::warn!(
                    "RPC '{}' failed (attempt {}/{}): {}",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    e
                );
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::error!(
                        "RPC '{}' failed after {} attempts: {}",
                        operation_name,
                        attempt + 1,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

pub type StandardRateLimiter =
    RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub url: Url,
    /// Concurrent block fetches when walking a range for transactions.
    pub block_concurrency: usize,
    pub rate_limit: Option<RateLimitConfig>,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: NonZeroU32,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl RateLimitConfig {
    pub fn per_second(requests_per_second: NonZeroU32) -> Self {
        Self {
            requests_per_second,
            jitter_min_ms: 5,
            jitter_max_ms: 50,
        }
    }
}

impl RpcClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            block_concurrency: 10,
            rate_limit: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }
}

/// HTTP JSON-RPC client with retry and optional client-side rate limiting.
pub struct RpcClient {
    provider: RootProvider<Ethereum>,
    config: RpcClientConfig,
    rate_limiter: Option<Arc<StandardRateLimiter>>,
    jitter: Option<Jitter>,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Result<Self, RpcError> {
        let provider = RootProvider::<Ethereum>::new_http(config.url.clone());

        let (rate_limiter, jitter) = match config.rate_limit {
            Some(ref rate_config) => {
                let limiter = RateLimiter::direct(Quota::per_second(rate_config.requests_per_second));
                let jitter = Jitter::new(
                    Duration::from_millis(rate_config.jitter_min_ms),
                    Duration::from_millis(rate_config.jitter_max_ms),
                );
                (Some(Arc::new(limiter)), Some(jitter))
            }
            None => (None, None),
        };

        Ok(Self {
            provider,
            config,
            rate_limiter,
            jitter,
        })
    }

    pub fn from_url(url: &str, rate_limit: Option<u32>) -> Result<Self, RpcError> {
        let url = Url::parse(url).map_err(|e| RpcError::InvalidUrl(e.to_string()))?;
        let mut config = RpcClientConfig::new(url);
        if let Some(rps) = rate_limit.and_then(NonZeroU32::new) {
            config = config.with_rate_limit(RateLimitConfig::per_second(rps));
        }
        Self::new(config)
    }

    async fn wait_for_rate_limit(&self) {
        if let (Some(limiter), Some(jitter)) = (&self.rate_limiter, &self.jitter) {
            limiter.until_ready_with_jitter(*jitter).await;
        }
    }

    pub async fn get_block_number(&self) -> Result<BlockNumber, RpcError> {
        with_retry(&self.config.retry, "get_block_number", || async {
            self.wait_for_rate_limit().await;
            self.provider
                .get_block_number()
                .await
                .map_err(|e| RpcError::ProviderError(e.to_string()))
        })
        .await
    }

    pub async fn get_full_block(&self, number: u64) -> Result<Option<Block>, RpcError> {
        let op_name = format!("eth_getBlockByNumber({})", number);
        with_retry(&self.config.retry, &op_name, || async {
            self.wait_for_rate_limit().await;
            self.provider
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .full()
                .await
                .map_err(|e| RpcError::ProviderError(e.to_string()))
        })
        .await
    }

    pub async fn get_transaction_by_hash(&self, hash: B256) -> Result<Option<Transaction>, RpcError> {
        let op_name = format!("eth_getTransactionByHash({:?})", hash);
        with_retry(&self.config.retry, &op_name, || async {
            self.wait_for_rate_limit().await;
            self.provider
                .get_transaction_by_hash(hash)
                .await
                .map_err(|e| RpcError::ProviderError(e.to_string()))
        })
        .await
    }

    pub async fn get_logs_filtered(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        let op_name = format!(
            "eth_getLogs(blocks {:?}-{:?})",
            filter.get_from_block(),
            filter.get_to_block()
        );
        with_retry(&self.config.retry, &op_name, || async {
            self.wait_for_rate_limit().await;
            self.provider
                .get_logs(filter)
                .await
                .map_err(|e| RpcError::ProviderError(e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn latest_block(&self) -> Result<u64, RpcError> {
        self.get_block_number().await
    }

    async fn get_logs(
        &self,
        range: BlockRange,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<RawLog>, RpcError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let filter = log_filter(range, addresses, topics);
        self.get_logs_filtered(&filter)
            .await?
            .into_iter()
            .map(raw_log_from_rpc)
            .collect()
    }

    async fn get_block_transactions(
        &self,
        range: BlockRange,
    ) -> Result<Vec<RawTransaction>, RpcError> {
        let numbers: Vec<u64> = (range.start..range.end).collect();
        let mut out = Vec::new();

        for chunk in numbers.chunks(self.config.block_concurrency.max(1)) {
            let blocks =
                futures::future::try_join_all(chunk.iter().map(|&n| self.get_full_block(n))).await?;

            for (number, block) in chunk.iter().zip(blocks) {
                let block = block.ok_or_else(|| {
                    RpcError::IncompleteResponse(format!("block {} not available", number))
                })?;
                let block_hash = block.header.hash;
                for tx in block.transactions.into_transactions() {
                    out.push(raw_transaction_from_rpc(tx, Some((block_hash, *number)))?);
                }
            }
        }

        Ok(out)
    }

    async fn get_transaction(&self, hash: B256) -> Result<Option<RawTransaction>, RpcError> {
        match self.get_transaction_by_hash(hash).await? {
            Some(tx) => raw_transaction_from_rpc(tx, None).map(Some),
            None => Ok(None),
        }
    }
}

/// `eth_getLogs` filter for a half-open range. Empty address or topic lists
/// leave that field unfiltered.
pub fn log_filter(range: BlockRange, addresses: &[Address], topics: &[B256]) -> Filter {
    let mut filter = Filter::new()
        .from_block(range.start)
        .to_block(range.end.saturating_sub(1));
    if !addresses.is_empty() {
        filter = filter.address(addresses.to_vec());
    }
    if !topics.is_empty() {
        filter = filter.event_signature(topics.to_vec());
    }
    filter
}

pub fn raw_log_from_rpc(log: Log) -> Result<RawLog, RpcError> {
    let missing = |field: &str| RpcError::IncompleteResponse(format!("log without {}", field));
    Ok(RawLog {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
        block_hash: log.block_hash.ok_or_else(|| missing("block_hash"))?,
        block_number: log.block_number.ok_or_else(|| missing("block_number"))?,
        transaction_hash: log.transaction_hash.ok_or_else(|| missing("transaction_hash"))?,
        transaction_index: log
            .transaction_index
            .ok_or_else(|| missing("transaction_index"))?,
        log_index: log.log_index.ok_or_else(|| missing("log_index"))?,
        removed: log.removed,
    })
}

fn raw_transaction_from_rpc(
    tx: Transaction,
    block: Option<(B256, u64)>,
) -> Result<RawTransaction, RpcError> {
    let hash = TransactionResponse::tx_hash(&tx);
    let (block_hash, block_number) = match block {
        Some(known) => known,
        None => (
            TransactionResponse::block_hash(&tx).ok_or_else(|| {
                RpcError::IncompleteResponse(format!("transaction {} is pending", hash))
            })?,
            TransactionResponse::block_number(&tx).unwrap_or_default(),
        ),
    };

    Ok(RawTransaction {
        hash,
        block_hash,
        block_number,
        transaction_index: TransactionResponse::transaction_index(&tx).unwrap_or_default(),
        from: TransactionResponse::from(&tx),
        to: ConsensusTransaction::to(&tx),
        value: ConsensusTransaction::value(&tx),
        input: ConsensusTransaction::input(&tx).clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_grow_and_cap() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RpcError::Transport("reset".into()).is_retryable());
        assert!(RpcError::ProviderError("HTTP 429 Too Many Requests".into()).is_retryable());
        assert!(!RpcError::ProviderError("execution reverted".into()).is_retryable());
        assert!(!RpcError::InvalidUrl("nope".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_errors() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1));
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = with_retry(&config, "flaky", || async {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 2 {
                Err(RpcError::Transport("connection reset".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_permanent_error() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1));
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&config, "fatal", || async {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(RpcError::InvalidUrl("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_log_filter_uses_inclusive_upper_bound() {
        let filter = log_filter(BlockRange::new(100, 200), &[], &[]);
        assert_eq!(filter.get_from_block(), Some(100));
        assert_eq!(filter.get_to_block(), Some(199));
    }
}

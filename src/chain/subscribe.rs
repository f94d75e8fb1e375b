use alloy::primitives::{Address, B256};
use async_trait::async_trait;

use crate::chain::client::RawLog;
use crate::rpc::RpcError;

/// Opens push-based log subscriptions.
#[async_trait]
pub trait LogSubscriber: Send + Sync {
    async fn subscribe(
        &self,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Box<dyn LogStream>, RpcError>;
}

#[async_trait]
pub trait LogStream: Send {
    /// Next pushed log. An error means the stream is unusable and the caller
    /// should reconnect.
    async fn next_log(&mut self) -> Result<RawLog, RpcError>;
}

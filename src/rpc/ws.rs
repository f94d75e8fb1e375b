use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::pubsub::Subscription;
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;

use crate::chain::client::RawLog;
use crate::chain::subscribe::{LogStream, LogSubscriber};
use crate::rpc::rpc::raw_log_from_rpc;
use crate::rpc::RpcError;

/// `eth_subscribe("logs")` over a websocket endpoint.
pub struct WsLogSubscriber {
    url: String,
}

impl WsLogSubscriber {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl LogSubscriber for WsLogSubscriber {
    async fn subscribe(
        &self,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Box<dyn LogStream>, RpcError> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(self.url.clone()))
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?
            .erased();

        let mut filter = Filter::new();
        if !addresses.is_empty() {
            filter = filter.address(addresses.to_vec());
        }
        if !topics.is_empty() {
            filter = filter.event_signature(topics.to_vec());
        }

        let subscription = provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        Ok(Box::new(WsLogStream {
            _provider: provider,
            subscription,
        }))
    }
}

struct WsLogStream {
    // The subscription's backend lives as long as its provider.
    _provider: DynProvider,
    subscription: Subscription<Log>,
}

#[async_trait]
impl LogStream for WsLogStream {
    async fn next_log(&mut self) -> Result<RawLog, RpcError> {
        loop {
            match self.subscription.recv().await {
                Ok(log) => return raw_log_from_rpc(log),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Log subscription lagged");
                }
                Err(RecvError::Closed) => {
                    return Err(RpcError::SubscriptionClosed("channel closed".to_string()))
                }
            }
        }
    }
}

mod rpc;
mod ws;

pub use rpc::{with_retry, RetryConfig, RpcClient, RpcError};
pub use ws::WsLogSubscriber;

pub mod abi;
pub mod client;
pub mod facade;
#[cfg(test)]
pub mod mock;
pub mod registry;
pub mod subscribe;

pub use client::{ChainClient, RawLog, RawTransaction};
pub use facade::ContractFacade;
pub use registry::{ClientFactory, ClientRegistry, RpcClientFactory};

use thiserror::Error;

use crate::chain::abi::AbiError;
use crate::db::DbError;
use crate::rpc::RpcError;
use crate::types::config::scan::ConfigError;
use crate::types::scan::{ScanKind, TaskStatus};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Transport error: {0}")]
    Transport(#[from] RpcError),

    #[error("Decode error: {0}")]
    Decode(#[from] AbiError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Reconciliation aborted: {0}")]
    Reconciliation(String),

    #[error("Scan config {0} not found")]
    ConfigNotFound(i64),

    #[error("{kind} task {id} not found")]
    TaskNotFound { kind: ScanKind, id: i64 },

    #[error("{kind} task {id} is {status:?}, expected {expected:?}")]
    InvalidTaskStatus {
        kind: ScanKind,
        id: i64,
        status: TaskStatus,
        expected: TaskStatus,
    },
}

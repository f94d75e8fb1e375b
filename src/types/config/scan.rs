//! Engine-wide scan settings and the validation applied to operator configs.

use std::collections::HashSet;

use serde::Deserialize;

use crate::chain::abi::ContractAbi;
use crate::types::scan::{NewScanConfig, ScanKind, ScanMode};

/// Tunables for the scan engine. Every field has a default so the `scan`
/// section of the config file may be omitted entirely.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanSettings {
    /// Delivery touches a new record receives when its config sets none.
    #[serde(default = "default_max_deliver_retry")]
    pub default_max_deliver_retry: i32,

    /// Records younger than this are left alone by the delivery marker.
    #[serde(default = "default_entity_touch_offset_minutes")]
    pub entity_touch_offset_minutes: i64,

    /// Create healing tasks and reopen tasks when an audit finds problems.
    #[serde(default = "default_audit_auto_fix")]
    pub audit_auto_fix_missing_task: bool,

    /// Width of the sub-windows an audit slice is split into.
    #[serde(default = "default_audit_task_merge_minutes")]
    pub audit_task_merge_minutes: i64,

    #[serde(default = "default_audit_slice_hours")]
    pub audit_slice_hours: i64,

    /// Upper bound on the block span of a single `eth_getLogs` request.
    #[serde(default = "default_max_scan_block")]
    pub max_scan_block: u64,

    /// Reorg margin used when a config sets no `stable_block_offset`.
    #[serde(default = "default_safe_block_num_offset")]
    pub safe_block_num_offset: u64,

    /// Maximum blocks per scan task.
    #[serde(default = "default_task_batch_scan_block")]
    pub task_batch_scan_block: u64,

    /// Look-back used when a config has no previous task.
    #[serde(default = "default_batch")]
    pub default_batch: u64,

    #[serde(default = "default_max_workers")]
    pub event_scan_max_workers: usize,

    #[serde(default = "default_max_workers")]
    pub trans_scan_max_workers: usize,

    #[serde(default = "default_enable_realtime_scan")]
    pub enable_realtime_scan: bool,

    #[serde(default = "default_realtime_recv_timeout_secs")]
    pub realtime_recv_timeout_secs: u64,

    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    #[serde(default = "default_touch_interval_secs")]
    pub touch_interval_secs: u64,

    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
}

fn default_max_deliver_retry() -> i32 {
    15
}

fn default_entity_touch_offset_minutes() -> i64 {
    10
}

fn default_audit_auto_fix() -> bool {
    true
}

fn default_audit_task_merge_minutes() -> i64 {
    60
}

fn default_audit_slice_hours() -> i64 {
    24
}

fn default_max_scan_block() -> u64 {
    1000
}

fn default_safe_block_num_offset() -> u64 {
    6
}

fn default_task_batch_scan_block() -> u64 {
    100
}

fn default_batch() -> u64 {
    100
}

fn default_max_workers() -> usize {
    4
}

fn default_enable_realtime_scan() -> bool {
    true
}

fn default_realtime_recv_timeout_secs() -> u64 {
    300
}

fn default_scan_interval_secs() -> u64 {
    15
}

fn default_touch_interval_secs() -> u64 {
    60
}

fn default_audit_interval_secs() -> u64 {
    3600
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            default_max_deliver_retry: default_max_deliver_retry(),
            entity_touch_offset_minutes: default_entity_touch_offset_minutes(),
            audit_auto_fix_missing_task: default_audit_auto_fix(),
            audit_task_merge_minutes: default_audit_task_merge_minutes(),
            audit_slice_hours: default_audit_slice_hours(),
            max_scan_block: default_max_scan_block(),
            safe_block_num_offset: default_safe_block_num_offset(),
            task_batch_scan_block: default_task_batch_scan_block(),
            default_batch: default_batch(),
            event_scan_max_workers: default_max_workers(),
            trans_scan_max_workers: default_max_workers(),
            enable_realtime_scan: default_enable_realtime_scan(),
            realtime_recv_timeout_secs: default_realtime_recv_timeout_secs(),
            scan_interval_secs: default_scan_interval_secs(),
            touch_interval_secs: default_touch_interval_secs(),
            audit_interval_secs: default_audit_interval_secs(),
        }
    }
}

impl ScanSettings {
    pub fn max_workers(&self, kind: ScanKind) -> usize {
        match kind {
            ScanKind::Event => self.event_scan_max_workers,
            ScanKind::Transaction => self.trans_scan_max_workers,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_scan_block == 0 {
            return Err(ConfigError::InvalidSetting("max_scan_block must be positive"));
        }
        if self.task_batch_scan_block == 0 {
            return Err(ConfigError::InvalidSetting(
                "task_batch_scan_block must be positive",
            ));
        }
        if self.audit_task_merge_minutes <= 0 || self.audit_slice_hours <= 0 {
            return Err(ConfigError::InvalidSetting(
                "audit window sizes must be positive",
            ));
        }
        if self.event_scan_max_workers == 0 || self.trans_scan_max_workers == 0 {
            return Err(ConfigError::InvalidSetting("worker pools need at least one worker"));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown contract '{0}'")]
    UnknownContract(String),

    #[error("Unknown chain id {0}")]
    UnknownChain(u64),

    #[error("Contract '{contract}' declares no event named '{name}'")]
    UnknownEvent { contract: String, name: String },

    #[error("Contract '{contract}' declares no function named '{name}'")]
    UnknownFunction { contract: String, name: String },

    #[error("Realtime mode is only supported for event scans ({0})")]
    RealtimeTransactionScan(String),

    #[error("Chain '{0}' has no websocket endpoint configured for realtime scans")]
    MissingWebsocket(String),

    #[error("Duplicate contract name '{0}'")]
    DuplicateContract(String),

    #[error("Missing environment variable {0}")]
    MissingEnv(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(&'static str),

    #[error("Invalid signature '{signature}': {reason}")]
    InvalidSignature { signature: String, reason: String },

    #[error("Contract '{contract}' declares nothing to {kind} scan")]
    EmptyAbi { contract: String, kind: ScanKind },
}

/// Check an operator config against the ABI of the contract it names.
pub fn validate_scan_config(config: &NewScanConfig, abi: &ContractAbi) -> Result<(), ConfigError> {
    if config.mode == ScanMode::Realtime && config.scan_kind == ScanKind::Transaction {
        return Err(ConfigError::RealtimeTransactionScan(config.contract.clone()));
    }

    let empty = match config.scan_kind {
        ScanKind::Event => abi.events().next().is_none(),
        ScanKind::Transaction => abi.functions().next().is_none(),
    };
    if empty {
        return Err(ConfigError::EmptyAbi {
            contract: config.contract.clone(),
            kind: config.scan_kind,
        });
    }

    let events: HashSet<&str> = abi.events().map(|e| e.name.as_str()).collect();
    for name in &config.topic_filter {
        if !events.contains(name.as_str()) {
            return Err(ConfigError::UnknownEvent {
                contract: config.contract.clone(),
                name: name.clone(),
            });
        }
    }

    let functions: HashSet<&str> = abi.functions().map(|f| f.name.as_str()).collect();
    for name in &config.function_filter {
        if !functions.contains(name.as_str()) {
            return Err(ConfigError::UnknownFunction {
                contract: config.contract.clone(),
                name: name.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abi() -> ContractAbi {
        ContractAbi::from_signatures(
            &["Transfer(address indexed from, address indexed to, uint256 value)".to_string()],
            &["transfer(address to, uint256 amount)".to_string()],
        )
        .unwrap()
    }

    fn config(json: &str) -> NewScanConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let settings: ScanSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.default_max_deliver_retry, 15);
        assert_eq!(settings.entity_touch_offset_minutes, 10);
        assert!(settings.audit_auto_fix_missing_task);
        assert_eq!(settings.audit_task_merge_minutes, 60);
        assert_eq!(settings.max_scan_block, 1000);
        assert_eq!(settings.safe_block_num_offset, 6);
        assert_eq!(settings.task_batch_scan_block, 100);
        assert_eq!(settings.max_workers(ScanKind::Event), 4);
        assert_eq!(settings.realtime_recv_timeout_secs, 300);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let settings = ScanSettings {
            task_batch_scan_block: 0,
            ..ScanSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_validate_scan_config_names() {
        let ok = config(r#"{"contract": "token", "scan_kind": "event", "topic_filter": ["Transfer"]}"#);
        assert!(validate_scan_config(&ok, &abi()).is_ok());

        let bad_event =
            config(r#"{"contract": "token", "scan_kind": "event", "topic_filter": ["Approval"]}"#);
        assert!(matches!(
            validate_scan_config(&bad_event, &abi()),
            Err(ConfigError::UnknownEvent { .. })
        ));

        let bad_fn = config(
            r#"{"contract": "token", "scan_kind": "transaction", "function_filter": ["approve"]}"#,
        );
        assert!(matches!(
            validate_scan_config(&bad_fn, &abi()),
            Err(ConfigError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_scan_kind_needs_abi_entries() {
        let events_only = ContractAbi::from_signatures(
            &["Transfer(address indexed from, address indexed to, uint256 value)".to_string()],
            &[],
        )
        .unwrap();
        let cfg = config(r#"{"contract": "token", "scan_kind": "transaction"}"#);
        assert!(matches!(
            validate_scan_config(&cfg, &events_only),
            Err(ConfigError::EmptyAbi { .. })
        ));
    }

    #[test]
    fn test_realtime_transaction_scan_rejected() {
        let cfg = config(r#"{"contract": "token", "scan_kind": "transaction", "mode": "realtime"}"#);
        assert!(matches!(
            validate_scan_config(&cfg, &abi()),
            Err(ConfigError::RealtimeTransactionScan(_))
        ));
    }
}

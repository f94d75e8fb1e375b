//! The scan-task engine: partitioning, execution, scheduling, reconciliation,
//! realtime ingestion and delivery bookkeeping.

pub mod coverage;
pub mod delivery;
pub mod error;
pub mod executor;
pub mod operator;
pub mod partitioner;
pub mod realtime;
pub mod reconciler;
pub mod scheduler;

use std::sync::Arc;

use crate::chain::ClientRegistry;
use crate::db::ScanStore;
use crate::types::config::scan::ScanSettings;

pub use error::ScanError;

/// Shared handles every engine component runs against. Cheap to clone.
#[derive(Clone)]
pub struct ScanContext {
    pub store: Arc<dyn ScanStore>,
    pub registry: Arc<ClientRegistry>,
    pub settings: Arc<ScanSettings>,
}

impl ScanContext {
    pub fn new(
        store: Arc<dyn ScanStore>,
        registry: Arc<ClientRegistry>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings: Arc::new(settings),
        }
    }
}

#[cfg(test)]
pub mod fixtures {
    use std::sync::Arc;

    use crate::chain::mock::MockChain;
    use crate::chain::registry::tests::{test_registry, MockFactory};
    use crate::db::memory::MemoryStore;
    use crate::db::ScanStore;
    use crate::types::config::scan::ScanSettings;
    use crate::types::scan::{
        AuditLevel, ConfigStatus, ScanConfig, ScanKind, ScanMode,
    };

    use super::ScanContext;

    pub struct Harness {
        pub ctx: ScanContext,
        pub store: Arc<MemoryStore>,
        pub chain: Arc<MockChain>,
        pub factory: Arc<MockFactory>,
    }

    pub fn harness() -> Harness {
        harness_with(ScanSettings::default())
    }

    pub fn harness_with(settings: ScanSettings) -> Harness {
        harness_with_factory(settings, MockFactory::new)
    }

    pub fn harness_with_factory(
        settings: ScanSettings,
        build: impl FnOnce(Arc<MockChain>) -> MockFactory,
    ) -> Harness {
        let chain = Arc::new(MockChain::new());
        let factory = Arc::new(build(chain.clone()));
        let store = Arc::new(MemoryStore::new());
        let ctx = ScanContext::new(
            store.clone(),
            Arc::new(test_registry(factory.clone())),
            settings,
        );
        Harness {
            ctx,
            store,
            chain,
            factory,
        }
    }

    pub fn scan_config(contract: &str, kind: ScanKind) -> ScanConfig {
        ScanConfig {
            id: 0,
            contract: contract.to_string(),
            scan_kind: kind,
            mode: ScanMode::Polling,
            to_address_filter: vec![],
            from_address_filter: vec![],
            topic_filter: vec![],
            function_filter: vec![],
            stable_block_offset: 6,
            max_deliver_retry: 15,
            audit_level: AuditLevel::Enabled,
            scan_group: None,
            status: ConfigStatus::Enabled,
        }
    }

    pub async fn saved(h: &Harness, config: ScanConfig) -> ScanConfig {
        h.store.create_config(config).await.unwrap()
    }
}

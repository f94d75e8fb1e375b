//! Push-based ingestion for realtime event configs.
//!
//! Each realtime config keeps one log subscription open and writes what it
//! receives through the same insert-or-ignore path as the polling executor.
//! Polling and audit stay authoritative; this only lowers latency.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::chain::{ContractFacade, RawLog};
use crate::rpc::{RetryConfig, RpcError};
use crate::scan::executor::{event_record, persist_record};
use crate::scan::{ScanContext, ScanError};
use crate::types::scan::{IndexedRecord, InsertOutcome, ScanConfig, ScanKind, ScanMode};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub received: usize,
    pub stored: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub failures: usize,
    pub reconnects: usize,
}

pub struct RealtimeIngestor {
    ctx: ScanContext,
    retry: RetryConfig,
}

impl RealtimeIngestor {
    pub fn new(ctx: ScanContext) -> Self {
        Self {
            ctx,
            retry: RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60)),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run one subscription per enabled realtime config until `shutdown`
    /// flips to true. Returns only on shutdown, even when there is nothing to
    /// subscribe to.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ScanError> {
        if !self.ctx.settings.enable_realtime_scan {
            tracing::info!("Realtime scan disabled");
            wait_for_shutdown(shutdown).await;
            return Ok(());
        }

        let configs: Vec<ScanConfig> = self
            .ctx
            .store
            .enabled_configs(ScanKind::Event)
            .await?
            .into_iter()
            .filter(|c| c.mode == ScanMode::Realtime)
            .collect();
        if configs.is_empty() {
            tracing::info!("No realtime scan configs");
            wait_for_shutdown(shutdown).await;
            return Ok(());
        }
        tracing::info!("Starting {} realtime subscription(s)", configs.len());

        let this = Arc::new(self);
        let mut join_set = JoinSet::new();
        for config in configs {
            let this = this.clone();
            let shutdown = shutdown.clone();
            join_set.spawn(async move {
                let stats = this.ingest(&config, shutdown).await;
                (config, stats)
            });
        }

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((config, stats)) => tracing::info!(
                    "Realtime {} stopped: {} received, {} stored, {} reconnect(s)",
                    config,
                    stats.received,
                    stats.stored,
                    stats.reconnects
                ),
                Err(e) => tracing::error!("Realtime subscription panicked: {}", e),
            }
        }
        wait_for_shutdown(shutdown).await;
        Ok(())
    }

    /// Subscribe for `config` and ingest until shutdown, reconnecting on
    /// receive timeouts and stream errors. Configuration errors end the
    /// subscription for this config only.
    pub async fn ingest(&self, config: &ScanConfig, mut shutdown: watch::Receiver<bool>) -> IngestStats {
        let mut stats = IngestStats::default();
        let recv_timeout = Duration::from_secs(self.ctx.settings.realtime_recv_timeout_secs);
        let mut attempt: u32 = 0;

        let (subscriber, facade) = match (
            self.ctx.registry.subscriber(&config.contract).await,
            self.ctx.registry.facade(&config.contract).await,
        ) {
            (Ok(subscriber), Ok(facade)) => (subscriber, facade),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Cannot start realtime scan for {}: {}", config, e);
                return stats;
            }
        };
        let topics = match facade.abi().topics_for(&config.topic_filter) {
            Ok(topics) => topics,
            Err(e) => {
                tracing::error!("Invalid topic filter for {}: {}", config, e);
                return stats;
            }
        };
        let addresses = facade.address_filter(&config.to_address_filter);
        let from_filter: HashSet<Address> = config.from_address_filter.iter().copied().collect();

        while !*shutdown.borrow() {
            if attempt > 0 {
                let delay = self.retry.delay_for_attempt(attempt);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let mut stream = match subscriber.subscribe(&addresses, &topics).await {
                Ok(stream) => {
                    tracing::info!("Subscribed to logs for {}", config);
                    attempt = 0;
                    stream
                }
                Err(e) => {
                    tracing::warn!("Subscription for {} failed: {}", config, e);
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return stats;
                        }
                        continue;
                    }
                    next = timeout(recv_timeout, stream.next_log()) => next,
                };
                match next {
                    Ok(Ok(log)) => {
                        stats.received += 1;
                        self.handle_log(config, &facade, &from_filter, log, &mut stats)
                            .await;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("Realtime stream for {} closed: {}", config, e);
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Realtime stream for {} stalled: {}, reconnecting",
                            config,
                            RpcError::Timeout(recv_timeout)
                        );
                        break;
                    }
                }
            }

            stats.reconnects += 1;
            attempt = attempt.saturating_add(1);
        }
        stats
    }

    async fn handle_log(
        &self,
        config: &ScanConfig,
        facade: &ContractFacade,
        from_filter: &HashSet<Address>,
        log: RawLog,
        stats: &mut IngestStats,
    ) {
        if log.removed {
            tracing::debug!("Ignoring removed log {}:{}", log.transaction_hash, log.log_index);
            stats.skipped += 1;
            return;
        }

        let mut from_address = None;
        if !from_filter.is_empty() {
            match facade.sender_of(log.transaction_hash).await {
                Ok(Some(sender)) if from_filter.contains(&sender) => from_address = Some(sender),
                Ok(_) => {
                    stats.skipped += 1;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to resolve sender of {} for {}: {}",
                        log.transaction_hash,
                        config,
                        e
                    );
                    stats.failures += 1;
                    return;
                }
            }
        }

        let decoded = match facade.abi().decode_log(&log.topics, &log.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("Failed to decode realtime log for {}: {}", config, e);
                stats.failures += 1;
                return;
            }
        };
        let record = IndexedRecord::Event(event_record(&config.contract, &log, decoded, from_address));
        match persist_record(self.ctx.store.as_ref(), &record, config.max_deliver_retry).await {
            Ok(InsertOutcome::Created(_)) => stats.stored += 1,
            Ok(InsertOutcome::Conflict) => stats.conflicts += 1,
            Err(e) => {
                tracing::warn!("Failed to store realtime record {}: {}", record.key(), e);
                stats.failures += 1;
            }
        }
    }
}

/// Resolves once `shutdown` is true or its sender is gone.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::chain::mock::{transfer_log, MockSubscriber};
    use crate::chain::registry::tests::MockFactory;
    use crate::scan::fixtures::{harness_with_factory, saved, scan_config, Harness};
    use crate::scan::scheduler::run_cycle;
    use crate::types::config::scan::ScanSettings;

    fn scripted(scripts: Vec<Vec<Result<RawLog, RpcError>>>) -> Harness {
        harness_with_factory(ScanSettings::default(), move |chain| MockFactory {
            chain,
            subscriber: Arc::new(MockSubscriber::new(scripts)),
            builds: AtomicUsize::new(0),
        })
    }

    fn realtime_config() -> ScanConfig {
        let mut config = scan_config("token", ScanKind::Event);
        config.mode = ScanMode::Realtime;
        config
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(u32::MAX)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_dual_path_stores_one_row() {
        let h = scripted(vec![vec![Ok(transfer_log(150, 0))]]);
        h.chain.push_log(transfer_log(150, 0));
        h.chain.set_head(206);
        let config = saved(&h, realtime_config()).await;

        let (tx, rx) = watch::channel(false);
        let ingestor = RealtimeIngestor::new(h.ctx.clone()).with_retry(fast_retry());
        let handle = tokio::spawn(async move { ingestor.ingest(&config, rx).await });

        let store = h.store.clone();
        wait_for(|| store.records(ScanKind::Event).len() == 1).await;

        let summary = run_cycle(&h.ctx, ScanKind::Event).await.unwrap();
        assert_eq!(summary.tasks_finished, 1);
        assert_eq!(h.store.records(ScanKind::Event).len(), 1);

        tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.stored, 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_closed_stream() {
        let h = scripted(vec![
            vec![
                Ok(transfer_log(10, 0)),
                Err(RpcError::SubscriptionClosed("socket dropped".to_string())),
            ],
            vec![Ok(transfer_log(11, 0)), Ok(transfer_log(10, 0))],
        ]);
        let config = saved(&h, realtime_config()).await;

        let (tx, rx) = watch::channel(false);
        let ingestor = RealtimeIngestor::new(h.ctx.clone()).with_retry(fast_retry());
        let handle = tokio::spawn(async move { ingestor.ingest(&config, rx).await });

        let factory = h.factory.clone();
        let store = h.store.clone();
        wait_for(|| {
            factory.subscriber.subscriptions() == 2 && store.records(ScanKind::Event).len() == 2
        })
        .await;

        tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.conflicts, 1);
    }

    #[tokio::test]
    async fn test_removed_logs_ignored() {
        let mut removed = transfer_log(10, 0);
        removed.removed = true;
        let h = scripted(vec![vec![Ok(removed), Ok(transfer_log(12, 0))]]);
        let config = saved(&h, realtime_config()).await;

        let (tx, rx) = watch::channel(false);
        let ingestor = RealtimeIngestor::new(h.ctx.clone()).with_retry(fast_retry());
        let handle = tokio::spawn(async move { ingestor.ingest(&config, rx).await });

        let store = h.store.clone();
        wait_for(|| store.records(ScanKind::Event).len() == 1).await;
        tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_run_without_realtime_configs_waits_for_shutdown() {
        let h = scripted(vec![]);
        saved(&h, scan_config("token", ScanKind::Event)).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(RealtimeIngestor::new(h.ctx.clone()).run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(h.factory.subscriber.subscriptions(), 0);

        tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_with_realtime_disabled_waits_for_shutdown() {
        let settings = ScanSettings {
            enable_realtime_scan: false,
            ..ScanSettings::default()
        };
        let h = harness_with_factory(settings, MockFactory::new);
        saved(&h, realtime_config()).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(RealtimeIngestor::new(h.ctx.clone()).run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(h.factory.subscriber.subscriptions(), 0);
    }
}

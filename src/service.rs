//! Boots every background worker against one bus and one manager.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::Result;
use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::feeds::FeedClient;
use crate::ratelimit::RateLimiter;
use crate::scraper::StreamExtractor;
use crate::search::SearchIndex;
use crate::store::{AircraftRepository, ChaseRepository};
use crate::webhook::WebhookSender;
use crate::worker::{
    AircraftEvents, AircraftSync, Indexer, Manager, MediaExtraction, Stats, UserEvents, Weather,
};

/// Collaborators handed to [`Background::start`]. Workers whose collaborator
/// is missing are not started.
pub struct Deps {
    pub bus: Arc<EventBus>,
    pub chases: Arc<dyn ChaseRepository>,
    pub aircraft: Arc<dyn AircraftRepository>,
    pub search: Option<Arc<dyn SearchIndex>>,
    pub webhook: Option<Arc<dyn WebhookSender>>,
    pub extractor: Option<Arc<dyn StreamExtractor>>,
    pub feeds: Option<Arc<FeedClient>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl Deps {
    pub fn new(
        bus: Arc<EventBus>,
        chases: Arc<dyn ChaseRepository>,
        aircraft: Arc<dyn AircraftRepository>,
    ) -> Self {
        Deps {
            bus,
            chases,
            aircraft,
            search: None,
            webhook: None,
            extractor: None,
            feeds: None,
            rate_limiter: None,
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchIndex>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_webhook(mut self, webhook: Arc<dyn WebhookSender>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn StreamExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_feeds(mut self, feeds: Arc<FeedClient>) -> Self {
        self.feeds = Some(feeds);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Health {
    pub broker_connected: bool,
    /// Background tasks still running.
    pub workers: usize,
}

pub struct Background {
    manager: Manager,
    bus: Arc<EventBus>,
    config: AppConfig,
}

impl Background {
    /// Spawn every worker. Must be called inside a tokio runtime.
    pub fn start(config: AppConfig, deps: Deps) -> Self {
        let manager = Manager::new();
        let workers = &config.workers;

        Arc::new(AircraftSync::new(deps.aircraft.clone(), workers)).spawn(&manager);
        Arc::new(Stats::new(deps.chases.clone(), workers)).spawn(&manager);

        if let Some(search) = deps.search {
            Indexer::new(search)
                .with_retention(deps.bus.config().max_age)
                .spawn(deps.bus.clone(), &manager);
        } else {
            warn!("search index not configured, indexer disabled");
        }
        UserEvents::new(deps.webhook).spawn(deps.bus.clone(), &manager);
        AircraftEvents.spawn(deps.bus.clone(), &manager);

        if let Some(extractor) = deps.extractor {
            let media = MediaExtraction::new(deps.chases.clone(), extractor, workers)
                .with_bus(deps.bus.clone());
            Arc::new(media).spawn(&manager);
        }
        if let Some(feeds) = deps.feeds {
            Arc::new(Weather::new(feeds, workers)).spawn(&manager);
        }
        if let Some(limiter) = &deps.rate_limiter {
            limiter.spawn_sweeper(&manager);
        }

        info!(workers = manager.active(), "background workers started");
        Background {
            manager,
            bus: deps.bus,
            config,
        }
    }

    pub fn health(&self) -> Health {
        Health {
            broker_connected: self.bus.is_connected(),
            workers: self.manager.active(),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Stop the workers within the configured timeout, then close the bus.
    ///
    /// The bus is closed even when some workers had to be aborted; the
    /// timeout is still reported.
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = self
            .manager
            .stop(self.config.workers.shutdown_timeout)
            .await;
        self.bus.close().await?;
        stopped
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::BusConfig;
    use crate::store::MemoryStore;
    use crate::Error;

    async fn deps() -> Deps {
        let (bus, _) = EventBus::in_memory(BusConfig::default()).await.unwrap();
        let store = Arc::new(MemoryStore::new());
        Deps::new(Arc::new(bus), store.clone(), store)
    }

    #[tokio::test]
    async fn test_optional_workers_are_skipped() {
        let background = Background::start(AppConfig::default(), deps().await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // aircraft-sync, stats, user-events, aircraft-events
        let health = background.health();
        assert_eq!(health.workers, 4);
        assert!(health.broker_connected);

        background.shutdown().await.unwrap();
        let health = background.health();
        assert_eq!(health.workers, 0);
        assert!(!health.broker_connected);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let background = Background::start(AppConfig::default(), deps().await);
        background.shutdown().await.unwrap();
        background.shutdown().await.unwrap();
        assert!(matches!(
            background.bus().publish("chases.created", Vec::new()).await,
            Err(Error::Closed)
        ));
    }
}

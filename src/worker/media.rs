use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Manager, run_interval};
use crate::Result;
use crate::bus::EventBus;
use crate::config::WorkerConfig;
use crate::event::subjects;
use crate::model::Stream;
use crate::scraper::StreamExtractor;
use crate::store::ChaseRepository;

pub const NAME: &str = "media-extraction";

/// Looks for stream URLs on the source pages of live chases that have none yet.
pub struct MediaExtraction {
    chases: Arc<dyn ChaseRepository>,
    extractor: Arc<dyn StreamExtractor>,
    bus: Option<Arc<EventBus>>,
    interval: Duration,
}

impl MediaExtraction {
    pub fn new(
        chases: Arc<dyn ChaseRepository>,
        extractor: Arc<dyn StreamExtractor>,
        config: &WorkerConfig,
    ) -> Self {
        MediaExtraction {
            chases,
            extractor,
            bus: None,
            interval: config.media_interval,
        }
    }

    /// Announce every chase that gained streams on `chases.updated`.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// One pass over the live chases. Returns how many were updated.
    ///
    /// Failures on a single chase are logged and the pass moves on.
    pub async fn sweep(&self) -> Result<usize> {
        let live = self.chases.list_live().await?;
        let mut updated = 0;
        for chase in live {
            if !chase.streams.is_empty() || chase.source_url.is_empty() {
                continue;
            }
            let found = match self.extractor.extract(&chase.source_url).await {
                Ok(found) if !found.is_empty() => found,
                Ok(_) => continue,
                Err(e) => {
                    warn!(chase_id = %chase.id, error = %e, "media extraction failed");
                    continue;
                }
            };

            let streams = merge(chase.streams, found);
            let count = streams.len();
            let saved = match self.chases.update_streams(chase.id, streams).await {
                Ok(Some(saved)) => saved,
                Ok(None) => continue,
                Err(e) => {
                    warn!(chase_id = %chase.id, error = %e, "failed to save extracted streams");
                    continue;
                }
            };
            info!(chase_id = %chase.id, streams = count, "extracted streams for chase");
            updated += 1;

            if let Some(bus) = &self.bus {
                if let Err(e) = bus.publish_chase(subjects::CHASES_UPDATED, &saved).await {
                    warn!(chase_id = %chase.id, error = %e, "failed to publish chase update");
                }
            }
        }
        Ok(updated)
    }

    pub async fn run(&self, token: CancellationToken) {
        run_interval(&token, self.interval, || async move {
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "media worker failed to load live chases");
            }
        })
        .await;
    }

    pub fn spawn(self: Arc<Self>, manager: &Manager) {
        manager.go(NAME, move |token| async move { self.run(token).await });
    }
}

/// Existing streams first, then new ones with unseen URLs.
fn merge(existing: Vec<Stream>, found: Vec<Stream>) -> Vec<Stream> {
    let mut seen: HashSet<String> = existing.iter().map(|s| s.url.clone()).collect();
    let mut merged = existing;
    merged.extend(found.into_iter().filter(|s| seen.insert(s.url.clone())));
    merged
}

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Manager, subscribe_until_cancelled};
use crate::Result;
use crate::bus::{EventBus, EventHandler};
use crate::event::{Event, subjects};
use crate::model::Chase;
use crate::search::SearchIndex;

pub const NAME: &str = "indexer";
pub const DURABLE: &str = "indexer";

struct Applied {
    newest: HashMap<Uuid, DateTime<Utc>>,
    next_sweep: DateTime<Utc>,
}

/// Mirrors chase lifecycle events into the search index.
///
/// Events can arrive out of order across subjects, so the indexer remembers
/// the newest `occurred_at` applied per chase and drops anything older.
/// Versions older than the retention are forgotten; the broker no longer
/// holds events that old. Index failures are logged and the event is still
/// acknowledged.
pub struct Indexer {
    search: Arc<dyn SearchIndex>,
    retention: TimeDelta,
    applied: Mutex<Applied>,
}

impl Indexer {
    pub fn new(search: Arc<dyn SearchIndex>) -> Self {
        Indexer {
            search,
            // stream max age
            retention: TimeDelta::days(1),
            applied: Mutex::new(Applied {
                newest: HashMap::new(),
                next_sweep: DateTime::<Utc>::MIN_UTC,
            }),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        self
    }

    pub fn spawn(self, bus: Arc<EventBus>, manager: &Manager) {
        subscribe_until_cancelled(manager, bus, NAME, subjects::CHASES_ALL, DURABLE, self);
    }

    /// Record `at` for `id` unless a newer event was already applied.
    fn claim(&self, id: Uuid, at: DateTime<Utc>) -> bool {
        self.claim_at(id, at, Utc::now())
    }

    fn claim_at(&self, id: Uuid, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let mut applied = self.applied.lock();
        if now >= applied.next_sweep {
            if let Some(cutoff) = now.checked_sub_signed(self.retention) {
                let before = applied.newest.len();
                applied.newest.retain(|_, last| *last >= cutoff);
                let removed = before - applied.newest.len();
                if removed > 0 {
                    debug!(count = removed, "forgot expired chase versions");
                }
            }
            applied.next_sweep = now
                .checked_add_signed(self.retention / 4)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
        match applied.newest.get(&id) {
            Some(last) if *last > at => false,
            _ => {
                applied.newest.insert(id, at);
                true
            }
        }
    }

    #[cfg(test)]
    fn remembered(&self) -> usize {
        self.applied.lock().newest.len()
    }

    async fn upsert(&self, chase: &Chase) {
        if let Err(e) = self.search.upsert_document(chase).await {
            warn!(chase_id = %chase.id, error = %e, "indexer upsert failed");
        }
    }

    async fn delete(&self, chase: &Chase) {
        if let Err(e) = self.search.delete_document(chase.id).await {
            warn!(chase_id = %chase.id, error = %e, "indexer delete failed");
        }
    }
}

#[async_trait]
impl EventHandler for Indexer {
    async fn handle(&self, event: &Event) -> Result<()> {
        let envelope = match event.decode::<Chase>() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(subject = %event.subject, error = %e, "dropping undecodable chase event");
                return Ok(());
            }
        };
        let chase = &envelope.entity;
        if !self.claim(chase.id, envelope.occurred_at) {
            debug!(chase_id = %chase.id, subject = %event.subject, "skipping stale chase event");
            return Ok(());
        }

        match event.subject.as_str() {
            subjects::CHASES_CREATED | subjects::CHASES_UPDATED | subjects::CHASES_LIVE => {
                self.upsert(chase).await
            }
            subjects::CHASES_DELETED | subjects::CHASES_ENDED => self.delete(chase).await,
            other => debug!(subject = other, "no index action"),
        }
        Ok(())
    }
}

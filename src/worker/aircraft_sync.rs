use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{Manager, run_interval};
use crate::config::WorkerConfig;
use crate::store::AircraftRepository;
use crate::{Error, Result};

pub const NAME: &str = "aircraft-sync";

/// Upper bound on one prune call against the store.
pub const PRUNE_TIMEOUT: Duration = Duration::from_secs(30);

/// Periodically drops aircraft that have not reported within the TTL.
pub struct AircraftSync {
    aircraft: Arc<dyn AircraftRepository>,
    interval: Duration,
    ttl: Duration,
}

impl AircraftSync {
    pub fn new(aircraft: Arc<dyn AircraftRepository>, config: &WorkerConfig) -> Self {
        AircraftSync {
            aircraft,
            interval: config.aircraft_sync_interval,
            ttl: config.aircraft_ttl,
        }
    }

    /// Delete aircraft last seen before `now - ttl`.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let ttl = TimeDelta::from_std(self.ttl)
            .map_err(|e| Error::Config(format!("aircraft ttl out of range: {e}")))?;
        let removed = tokio::time::timeout(PRUNE_TIMEOUT, self.aircraft.delete_stale(now - ttl))
            .await
            .map_err(|_| Error::Timeout(PRUNE_TIMEOUT))??;
        if removed > 0 {
            info!(removed, "pruned stale aircraft");
        }
        Ok(removed)
    }

    pub async fn run(&self, token: CancellationToken) {
        run_interval(&token, self.interval, || async move {
            if let Err(e) = self.prune(Utc::now()).await {
                error!(error = %e, "failed to prune stale aircraft");
            }
        })
        .await;
    }

    pub fn spawn(self: Arc<Self>, manager: &Manager) {
        manager.go(NAME, move |token| async move { self.run(token).await });
    }
}

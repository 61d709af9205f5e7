use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Manager, run_interval};
use crate::Result;
use crate::config::WorkerConfig;
use crate::store::ChaseRepository;

pub const NAME: &str = "stats";

pub struct Stats {
    chases: Arc<dyn ChaseRepository>,
    interval: Duration,
}

impl Stats {
    pub fn new(chases: Arc<dyn ChaseRepository>, config: &WorkerConfig) -> Self {
        Stats {
            chases,
            interval: config.stats_interval,
        }
    }

    /// Returns `(total, live)`.
    pub async fn aggregate(&self) -> Result<(i64, i64)> {
        let (total, live) = self.chases.count().await?;
        info!(total_chases = total, live_chases = live, "stats aggregation");
        Ok((total, live))
    }

    pub async fn run(&self, token: CancellationToken) {
        run_interval(&token, self.interval, || async move {
            if let Err(e) = self.aggregate().await {
                warn!(error = %e, "stats aggregation failed");
            }
        })
        .await;
    }

    pub fn spawn(self: Arc<Self>, manager: &Manager) {
        manager.go(NAME, move |token| async move { self.run(token).await });
    }
}

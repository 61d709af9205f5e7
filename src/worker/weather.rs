use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Manager, run_interval};
use crate::Result;
use crate::config::WorkerConfig;
use crate::feeds::FeedClient;

pub const NAME: &str = "weather";

/// Polls active weather alerts.
pub struct Weather {
    feeds: Arc<FeedClient>,
    interval: Duration,
}

impl Weather {
    pub fn new(feeds: Arc<FeedClient>, config: &WorkerConfig) -> Self {
        Weather {
            feeds,
            interval: config.weather_interval,
        }
    }

    /// Fetch nationwide alerts and return how many there are.
    pub async fn poll(&self) -> Result<usize> {
        let alerts = self.feeds.weather_alerts("").await?;
        let count = alerts
            .get("features")
            .and_then(|f| f.as_array())
            .map_or(0, Vec::len);
        info!(alerts = count, "weather polling complete");
        Ok(count)
    }

    pub async fn run(&self, token: CancellationToken) {
        run_interval(&token, self.interval, || async move {
            if let Err(e) = self.poll().await {
                warn!(error = %e, "weather polling failed");
            }
        })
        .await;
    }

    pub fn spawn(self: Arc<Self>, manager: &Manager) {
        manager.go(NAME, move |token| async move { self.run(token).await });
    }
}

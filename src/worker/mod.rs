//! Background work: the [`Manager`] and the tasks it runs.
//!
//! Timer-driven workers (`aircraft_sync`, `media`, `stats`, `weather`) tick via
//! [`run_interval`]. Event-driven workers (`indexer`, `user_events`,
//! `aircraft_events`) hold a durable bus subscription for as long as the
//! manager runs.

pub mod aircraft_events;
pub mod aircraft_sync;
pub mod indexer;
mod manager;
pub mod media;
pub mod stats;
pub mod user_events;
pub mod weather;

pub use aircraft_events::AircraftEvents;
pub use aircraft_sync::AircraftSync;
pub use indexer::Indexer;
pub use manager::{Manager, RestartPolicy, run_interval};
pub use media::MediaExtraction;
pub use stats::Stats;
pub use user_events::UserEvents;
pub use weather::Weather;

use std::sync::Arc;

use tracing::error;

use crate::bus::{EventBus, EventHandler};

/// Register a task that binds `handler` to `pattern` and unsubscribes on shutdown.
pub(crate) fn subscribe_until_cancelled<H: EventHandler>(
    manager: &Manager,
    bus: Arc<EventBus>,
    name: &str,
    pattern: &'static str,
    durable: &'static str,
    handler: H,
) {
    manager.go(name, move |token| async move {
        match bus.subscribe(pattern, durable, handler).await {
            Ok(subscription) => {
                token.cancelled().await;
                subscription.unsubscribe();
            }
            Err(e) => error!(durable, pattern, error = %e, "failed to subscribe"),
        }
    });
}

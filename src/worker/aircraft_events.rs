use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Manager, subscribe_until_cancelled};
use crate::Result;
use crate::bus::{EventBus, EventHandler};
use crate::event::{Event, subjects};

pub const NAME: &str = "aircraft-events";
pub const DURABLE: &str = "aircraft-events";

/// Logs aircraft position updates as they arrive.
#[derive(Debug, Default)]
pub struct AircraftEvents;

impl AircraftEvents {
    pub fn spawn(self, bus: Arc<EventBus>, manager: &Manager) {
        subscribe_until_cancelled(manager, bus, NAME, subjects::AIRCRAFT_ALL, DURABLE, self);
    }
}

#[async_trait]
impl EventHandler for AircraftEvents {
    async fn handle(&self, event: &Event) -> Result<()> {
        if event.subject.as_str() == subjects::AIRCRAFT_UPDATED {
            info!(bytes = event.payload.len(), "aircraft.updated event received");
        }
        Ok(())
    }
}

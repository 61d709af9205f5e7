use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Manager, subscribe_until_cancelled};
use crate::Result;
use crate::bus::{EventBus, EventHandler};
use crate::event::{Event, subjects};
use crate::model::User;
use crate::webhook::{Message, WebhookSender};

pub const NAME: &str = "user-events";
pub const DURABLE: &str = "user-events";

/// Announces new registrations on the outbound webhook, when one is configured.
pub struct UserEvents {
    webhook: Option<Arc<dyn WebhookSender>>,
}

impl UserEvents {
    pub fn new(webhook: Option<Arc<dyn WebhookSender>>) -> Self {
        UserEvents { webhook }
    }

    pub fn spawn(self, bus: Arc<EventBus>, manager: &Manager) {
        subscribe_until_cancelled(manager, bus, NAME, subjects::USERS_ALL, DURABLE, self);
    }
}

#[async_trait]
impl EventHandler for UserEvents {
    async fn handle(&self, event: &Event) -> Result<()> {
        if event.subject.as_str() != subjects::USERS_CREATED {
            debug!(subject = %event.subject, "ignoring user event");
            return Ok(());
        }
        let user = match event.decode::<User>() {
            Ok(envelope) => envelope.entity,
            Err(e) => {
                warn!(error = %e, "dropping undecodable user event");
                return Ok(());
            }
        };
        info!(user_id = %user.id, email = %user.email, "users.created event");

        if let Some(webhook) = &self.webhook {
            let message = Message::text(format!("New user registered: {}", user.email));
            if let Err(e) = webhook.send(&message).await {
                warn!(user_id = %user.id, error = %e, "failed to send registration webhook");
            }
        }
        Ok(())
    }
}

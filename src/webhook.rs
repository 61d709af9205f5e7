use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub color: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// An outbound chat message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl Message {
    pub fn text(content: impl Into<String>) -> Self {
        Message {
            content: content.into(),
            embeds: Vec::new(),
        }
    }
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Posts messages to a Discord webhook URL.
pub struct DiscordWebhook {
    url: String,
    http: reqwest::Client,
}

impl DiscordWebhook {
    pub fn new(url: &str) -> Result<Self> {
        if url.is_empty() {
            return Err(Error::Config("discord webhook URL is required".into()));
        }
        Ok(DiscordWebhook {
            url: url.to_string(),
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
        })
    }
}

#[async_trait]
impl WebhookSender for DiscordWebhook {
    async fn send(&self, message: &Message) -> Result<()> {
        let response = self.http.post(&self.url).json(message).send().await?;
        let status = response.status().as_u16();
        if status >= 300 {
            return Err(Error::Status {
                status,
                url: self.url.clone(),
            });
        }
        Ok(())
    }
}

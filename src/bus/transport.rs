use std::{fmt, pin::Pin, time::Duration};

use async_trait::async_trait;
use futures_util::Stream;

use crate::event::{Event, Subject, SubjectPattern, subjects};
use crate::Result;

/// Messages handed to one durable subscription, in delivery order.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// A persistent, subject-filtered log kept by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
}

impl StreamSpec {
    pub fn new(name: &str, subject: &str, max_age: Duration) -> Self {
        StreamSpec {
            name: name.to_string(),
            subjects: vec![subject.to_string()],
            max_age,
        }
    }
}

/// The `chases`, `users` and `aircraft` streams.
pub fn default_streams(max_age: Duration) -> Vec<StreamSpec> {
    vec![
        StreamSpec::new("chases", subjects::CHASES_ALL, max_age),
        StreamSpec::new("users", subjects::USERS_ALL, max_age),
        StreamSpec::new("aircraft", subjects::AIRCRAFT_ALL, max_age),
    ]
}

/// Settles one delivered message with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Ask for redelivery.
    async fn nak(&self) -> Result<()>;
}

/// A message delivered to a durable subscription. It must be acked or naked.
pub struct Delivery {
    pub event: Event,
    /// 1 on first delivery.
    pub attempt: u32,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(event: Event, attempt: u32, acker: Box<dyn Acknowledge>) -> Self {
        Delivery {
            event,
            attempt,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nak(self) -> Result<()> {
        self.acker.nak().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// A broker connection able to persist and redeliver events.
///
/// Implementations must be safe to share across tasks. Only the owner of the
/// process-wide connection calls [`close`](Transport::close).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create the given streams if they do not exist yet.
    async fn ensure_streams(&self, streams: &[StreamSpec]) -> Result<()>;

    /// Returns once the broker has persisted the event.
    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<()>;

    /// Bind the durable consumer `durable` to `pattern`, creating it on first use.
    /// Messages left unacknowledged by an earlier binding are redelivered first.
    async fn subscribe(&self, pattern: &SubjectPattern, durable: &str) -> Result<MessageStream>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

use std::{
    fmt::Display,
    sync::atomic::{AtomicBool, Ordering},
};

use async_nats::jetstream::{
    self, AckKind,
    consumer::{AckPolicy, pull},
    stream::{self as js_stream, StorageType},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Acknowledge, Delivery, MessageStream, StreamSpec, Transport};
use crate::{
    Error, Result,
    config::BusConfig,
    event::{Event, Subject, SubjectPattern},
};

fn broker_err(e: impl Display) -> Error {
    Error::Broker(e.to_string())
}

struct Connection {
    client: async_nats::Client,
    js: jetstream::Context,
}

/// JetStream transport: file-backed streams and durable pull consumers with explicit acks.
///
/// `close` flushes and releases the connection handles; the socket goes away
/// once the last consumer stream is dropped.
pub struct NatsTransport {
    conn: Mutex<Option<Connection>>,
    config: BusConfig,
    closed: AtomicBool,
}

impl NatsTransport {
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let wait = config.reconnect_wait;
        let client = async_nats::ConnectOptions::new()
            .name(format!("{}-jetstream", config.client_id))
            .max_reconnects(config.max_reconnects)
            .reconnect_delay_callback(move |_| wait)
            .connect(config.url.as_str())
            .await
            .map_err(broker_err)?;
        info!(url = %config.url, client_id = %config.client_id, "connected to NATS");
        Ok(NatsTransport {
            conn: Mutex::new(Some(Connection {
                js: jetstream::new(client.clone()),
                client,
            })),
            config: config.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn js(&self) -> Result<jetstream::Context> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.conn
            .lock()
            .as_ref()
            .map(|c| c.js.clone())
            .ok_or(Error::Closed)
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn ensure_streams(&self, streams: &[StreamSpec]) -> Result<()> {
        let js = self.js()?;
        for spec in streams {
            js.get_or_create_stream(js_stream::Config {
                    name: spec.name.clone(),
                    subjects: spec.subjects.clone(),
                    max_age: spec.max_age,
                    storage: StorageType::File,
                    ..Default::default()
                })
                .await
                .map_err(broker_err)?;
            debug!(stream = %spec.name, "stream ready");
        }
        Ok(())
    }

    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<()> {
        self.js()?
            .publish(subject.as_str().to_string(), payload.into())
            .await
            .map_err(broker_err)?
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &SubjectPattern, durable: &str) -> Result<MessageStream> {
        let js = self.js()?;
        let stream_name = pattern
            .root()
            .ok_or_else(|| Error::Broker(format!("no stream matches pattern {pattern}")))?;
        let stream = js.get_stream(stream_name).await.map_err(broker_err)?;
        let consumer: pull::Consumer = stream
            .get_or_create_consumer(
                durable,
                pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: pattern.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: i64::from(self.config.max_deliver),
                    ..Default::default()
                },
            )
            .await
            .map_err(broker_err)?;
        let messages = consumer.messages().await.map_err(broker_err)?;
        Ok(Box::pin(messages.map(|res| res.map_err(broker_err).and_then(to_delivery))))
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.conn.lock().as_ref().is_some_and(|c| {
                matches!(
                    c.client.connection_state(),
                    async_nats::connection::State::Connected
                )
            })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        let flushed = conn.client.flush().await.map_err(broker_err);
        drop(conn);
        info!("NATS connection closed");
        flushed
    }
}

fn to_delivery(msg: jetstream::Message) -> Result<Delivery> {
    let (attempt, occurred_at) = match msg.info() {
        Ok(info) => (
            u32::try_from(info.delivered).unwrap_or(u32::MAX),
            utc_from_unix(info.published.unix_timestamp(), info.published.nanosecond()),
        ),
        Err(_) => (1, Utc::now()),
    };
    let event = Event {
        subject: Subject::new(msg.subject.as_str())?,
        payload: msg.payload.to_vec(),
        occurred_at,
    };
    Ok(Delivery::new(event, attempt, Box::new(NatsAck(msg))))
}

/// Broker-side publish time. Falls back to now when out of range.
fn utc_from_unix(secs: i64, nanos: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nanos).unwrap_or_else(Utc::now)
}

struct NatsAck(jetstream::Message);

#[async_trait]
impl Acknowledge for NatsAck {
    async fn ack(&self) -> Result<()> {
        self.0.ack().await.map_err(broker_err)
    }

    async fn nak(&self) -> Result<()> {
        self.0.ack_with(AckKind::Nak(None)).await.map_err(broker_err)
    }
}

//! Durable publish/subscribe over a [`Transport`].
//!
//! [`EventBus`] is the single process-wide handle. Publishers persist events on
//! subjects such as `chases.created`; subscribers bind a durable consumer to a
//! pattern such as `chases.*` and settle each delivery through their handler's
//! result: `Ok` acknowledges, `Err` (or a panic) asks for redelivery.

mod memory;
#[cfg(feature = "nats")]
mod nats;
mod transport;

pub use memory::MemoryBroker;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;
pub use transport::{Acknowledge, Delivery, MessageStream, StreamSpec, Transport, default_streams};

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::{select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    Error, Result,
    config::BusConfig,
    event::{Entity, Envelope, Event, Subject, SubjectPattern},
    model::{Aircraft, Chase, User},
};

/// Processes events delivered to one durable subscription.
///
/// Implemented for any `Fn(Event) -> impl Future<Output = Result>`.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self)(event.clone()).await
    }
}

/// A live durable subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    durable: String,
    pattern: String,
    token: CancellationToken,
}

impl Subscription {
    pub fn durable(&self) -> &str {
        &self.durable
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Stop delivery. The durable consumer keeps its position and unacked messages.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

pub struct EventBus {
    transport: Arc<dyn Transport>,
    config: BusConfig,
    token: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new(transport: Arc<dyn Transport>, config: BusConfig) -> Self {
        EventBus {
            transport,
            config,
            token: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// A bus over a fresh [`MemoryBroker`] with the default streams in place.
    pub async fn in_memory(config: BusConfig) -> Result<(Self, MemoryBroker)> {
        let broker = MemoryBroker::new(&config);
        let bus = EventBus::new(Arc::new(broker.clone()), config);
        bus.ensure_streams().await?;
        Ok((bus, broker))
    }

    /// Connect to JetStream and create the default streams.
    #[cfg(feature = "nats")]
    pub async fn connect(config: BusConfig) -> Result<Self> {
        let transport = NatsTransport::connect(&config).await?;
        let bus = EventBus::new(Arc::new(transport), config);
        bus.ensure_streams().await?;
        Ok(bus)
    }

    /// Create the `chases`, `users` and `aircraft` streams if missing.
    pub async fn ensure_streams(&self) -> Result<()> {
        self.check_open()?;
        self.transport
            .ensure_streams(&default_streams(self.config.max_age))
            .await
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Persist `payload` on `subject`. Returns once the broker has stored it.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.check_open()?;
        let subject = Subject::new(subject)?;
        self.transport.publish(&subject, payload).await?;
        debug!(%subject, "event published");
        Ok(())
    }

    pub async fn publish_chase(&self, subject: &str, chase: &Chase) -> Result<()> {
        self.publish_entity(subject, chase.clone()).await
    }

    pub async fn publish_user(&self, subject: &str, user: &User) -> Result<()> {
        self.publish_entity(subject, user.clone()).await
    }

    pub async fn publish_aircraft(&self, subject: &str, aircraft: &Aircraft) -> Result<()> {
        self.publish_entity(subject, aircraft.clone()).await
    }

    async fn publish_entity<T: Entity>(&self, subject: &str, entity: T) -> Result<()> {
        let payload = Envelope::new(subject, entity).to_json()?;
        self.publish(subject, payload).await
    }

    /// Bind `durable` to `pattern` and feed every delivery to `handler`.
    pub async fn subscribe<H: EventHandler>(
        &self,
        pattern: &str,
        durable: &str,
        handler: H,
    ) -> Result<Subscription> {
        self.check_open()?;
        let pattern = SubjectPattern::new(pattern)?;
        let stream = self.transport.subscribe(&pattern, durable).await?;
        let token = self.token.child_token();
        let durable: Arc<str> = Arc::from(durable);

        let mut tasks = self.tasks.lock();
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                error!(error = %e, "delivery task failed to join");
            }
        }
        tasks.spawn(deliver(stream, handler, durable.clone(), token.clone()));
        drop(tasks);
        info!(durable = %durable, %pattern, "subscribed");

        Ok(Subscription {
            durable: durable.to_string(),
            pattern: pattern.to_string(),
            token,
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.transport.is_connected()
    }

    /// Cancel every subscription and close the transport. Handlers still running
    /// are dropped and their messages stay unacknowledged, so the broker
    /// redelivers them. Later calls return `Ok` without doing anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.token.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "delivery task failed to join");
            }
        }
        self.transport.close().await?;
        info!("event bus closed");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

async fn deliver<H: EventHandler>(
    mut stream: MessageStream,
    handler: H,
    durable: Arc<str>,
    token: CancellationToken,
) {
    loop {
        let delivery = select! {
            biased;
            _ = token.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(durable = %durable, error = %e, "failed to receive message");
                    continue;
                }
                None => break,
            },
        };

        let subject = delivery.event.subject.clone();
        let attempt = delivery.attempt;
        let outcome = select! {
            biased;
            _ = token.cancelled() => {
                // Left unacked; the broker redelivers it to the next binding.
                debug!(durable = %durable, %subject, attempt, "handler cancelled");
                break;
            }
            outcome = AssertUnwindSafe(handler.handle(&delivery.event)).catch_unwind() => outcome,
        };
        let settled = match outcome {
            Ok(Ok(())) => delivery.ack().await,
            Ok(Err(e)) => {
                warn!(durable = %durable, %subject, attempt, error = %e, "handler failed, message will be redelivered");
                delivery.nak().await
            }
            Err(_) => {
                error!(durable = %durable, %subject, attempt, "handler panic");
                delivery.nak().await
            }
        };
        if let Err(e) = settled {
            warn!(durable = %durable, %subject, error = %e, "failed to settle message");
        }
    }
    debug!(durable = %durable, "delivery stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, AtomicUsize},
        time::Duration,
    };

    use tokio::sync::mpsc;

    use super::*;
    use crate::model::ChaseType;

    async fn bus() -> (EventBus, MemoryBroker) {
        EventBus::in_memory(BusConfig::default().with_max_deliver(3))
            .await
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_wildcard_routing() {
        let (bus, _) = bus().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("chases.*", "routing", move |event: Event| {
            let tx = tx.clone();
            async move {
                tx.send(event.subject.to_string()).unwrap();
                Ok::<_, Error>(())
            }
        })
        .await
        .unwrap();

        bus.publish("chases.created", b"{}".to_vec()).await.unwrap();
        bus.publish("users.created", b"{}".to_vec()).await.unwrap();
        bus.publish("chases.updated", b"{}".to_vec()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "chases.created");
        assert_eq!(rx.recv().await.unwrap(), "chases.updated");
        settle().await;
        assert!(rx.try_recv().is_err());
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ok_acks_and_err_naks() {
        let (bus, broker) = bus().await;
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        bus.subscribe("users.*", "flaky", move |_event: Event| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Repository("down".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        bus.publish("users.created", b"{}".to_vec()).await.unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(broker.pending("flaky"), 0);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_is_redelivered() {
        let (bus, broker) = bus().await;
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        bus.subscribe("aircraft.*", "panicky", move |_event: Event| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first delivery");
                }
                Ok::<_, Error>(())
            }
        })
        .await
        .unwrap();

        bus.publish("aircraft.updated", b"{}".to_vec()).await.unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(broker.pending("panicky"), 0);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_durable_position() {
        let (bus, _) = bus().await;
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        let sub = bus
            .subscribe("chases.*", "resumable", move |_event: Event| {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                }
            })
            .await
            .unwrap();
        bus.publish("chases.created", b"1".to_vec()).await.unwrap();
        settle().await;
        sub.unsubscribe();
        assert!(!sub.is_active());
        settle().await;

        bus.publish("chases.updated", b"2".to_vec()).await.unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let s = seen.clone();
        bus.subscribe("chases.*", "resumable", move |_event: Event| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_typed_publish_envelope() {
        let (bus, _) = bus().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("chases.*", "typed", move |event: Event| {
            let tx = tx.clone();
            async move {
                tx.send(event.decode::<Chase>()?).unwrap();
                Ok::<_, Error>(())
            }
        })
        .await
        .unwrap();

        let chase = Chase::new("Pursuit on the 405", ChaseType::Chase);
        bus.publish_chase("chases.created", &chase).await.unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, "chases.created");
        assert_eq!(envelope.entity.id, chase.id);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (bus, _) = bus().await;
        assert!(bus.is_connected());
        bus.close().await.unwrap();
        bus.close().await.unwrap();
        assert!(!bus.is_connected());
        assert!(matches!(
            bus.publish("chases.created", Vec::new()).await,
            Err(Error::Closed)
        ));
        assert!(matches!(
            bus.subscribe("chases.*", "late", |_e: Event| async { Ok::<_, Error>(()) }).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_stuck_handler() {
        let (bus, broker) = bus().await;
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        bus.subscribe("chases.*", "stuck", move |_event: Event| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<()>>().await
            }
        })
        .await
        .unwrap();

        bus.publish("chases.created", b"{}".to_vec()).await.unwrap();
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_secs(1), bus.close())
            .await
            .expect("close blocked on a handler")
            .unwrap();
        assert_eq!(broker.pending("stuck"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_handler_message_is_redelivered() {
        let (bus, _) = bus().await;
        let sub = bus
            .subscribe("chases.*", "handover", |_event: Event| {
                std::future::pending::<Result<()>>()
            })
            .await
            .unwrap();
        bus.publish("chases.live", b"{}".to_vec()).await.unwrap();
        settle().await;
        sub.unsubscribe();
        settle().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("chases.*", "handover", move |event: Event| {
            let tx = tx.clone();
            async move {
                tx.send(event.subject.to_string()).unwrap();
                Ok::<_, Error>(())
            }
        })
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "chases.live");
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_delivery_tasks_are_reaped() {
        let (bus, _) = bus().await;
        for i in 0..5 {
            let sub = bus
                .subscribe("users.*", &format!("cycle-{i}"), |_event: Event| async {
                    Ok::<_, Error>(())
                })
                .await
                .unwrap();
            sub.unsubscribe();
            settle().await;
        }
        bus.subscribe("users.*", "last", |_event: Event| async { Ok::<_, Error>(()) })
            .await
            .unwrap();
        assert_eq!(bus.tasks.lock().len(), 1);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_subject_rejected() {
        let (bus, _) = bus().await;
        assert!(matches!(
            bus.publish("chases.*", Vec::new()).await,
            Err(Error::InvalidParameter(_))
        ));
    }
}

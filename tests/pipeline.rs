use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chaseapp_core::bus::EventBus;
use chaseapp_core::config::{AppConfig, BusConfig};
use chaseapp_core::event::subjects;
use chaseapp_core::model::{Chase, ChaseType};
use chaseapp_core::search::SearchIndex;
use chaseapp_core::store::MemoryStore;
use chaseapp_core::webhook::{Message, WebhookSender};
use chaseapp_core::{Background, Deps, Error, Event, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Index {
    upserts: Mutex<Vec<Uuid>>,
    deletes: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl SearchIndex for Index {
    async fn upsert_document(&self, chase: &Chase) -> Result<()> {
        self.upserts.lock().push(chase.id);
        Ok(())
    }

    async fn delete_document(&self, id: Uuid) -> Result<()> {
        self.deletes.lock().push(id);
        Ok(())
    }
}

#[derive(Default)]
struct Webhook {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl WebhookSender for Webhook {
    async fn send(&self, message: &Message) -> Result<()> {
        self.sent.lock().push(message.content.clone());
        Ok(())
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_chase_created_reaches_search_index() {
    init_tracing();
    let (bus, _) = EventBus::in_memory(BusConfig::default()).await.unwrap();
    let bus = Arc::new(bus);
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(Index::default());

    let background = Background::start(
        AppConfig::default(),
        Deps::new(bus.clone(), store.clone(), store).with_search(index.clone()),
    );

    let chase = Chase::new("Pursuit on the 101", ChaseType::Chase);
    bus.publish_chase(subjects::CHASES_CREATED, &chase)
        .await
        .unwrap();
    eventually(|| index.upserts.lock().contains(&chase.id)).await;

    bus.publish_chase(subjects::CHASES_DELETED, &chase)
        .await
        .unwrap();
    eventually(|| index.deletes.lock().contains(&chase.id)).await;

    background.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_user_registration_is_announced() {
    init_tracing();
    let (bus, _) = EventBus::in_memory(BusConfig::default()).await.unwrap();
    let bus = Arc::new(bus);
    let store = Arc::new(MemoryStore::new());
    let webhook = Arc::new(Webhook::default());

    let background = Background::start(
        AppConfig::default(),
        Deps::new(bus.clone(), store.clone(), store).with_webhook(webhook.clone()),
    );

    let payload = serde_json::json!({
        "event": "users.created",
        "user": {
            "id": Uuid::new_v4(),
            "external_id": "firebase|42",
            "email": "rookie@example.com",
            "provider": "google",
            "notifications_enabled": true,
            "created_at": "2024-05-01T12:00:00Z",
            "updated_at": "2024-05-01T12:00:00Z"
        },
        "occurred_at": "2024-05-01T12:00:00.000000000Z"
    });
    bus.publish(subjects::USERS_CREATED, serde_json::to_vec(&payload).unwrap())
        .await
        .unwrap();

    eventually(|| {
        webhook
            .sent
            .lock()
            .iter()
            .any(|m| m == "New user registered: rookie@example.com")
    })
    .await;
    background.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wildcard_subscriptions_fan_out() {
    init_tracing();
    let (bus, _) = EventBus::in_memory(BusConfig::default()).await.unwrap();
    let (chases_tx, mut chases_rx) = mpsc::unbounded_channel();
    let (all_tx, mut all_rx) = mpsc::unbounded_channel();

    bus.subscribe("chases.*", "chases-only", move |event: Event| {
        let tx = chases_tx.clone();
        async move {
            tx.send(event.subject.to_string()).ok();
            Ok::<_, Error>(())
        }
    })
    .await
    .unwrap();
    bus.subscribe("users.>", "users-tail", move |event: Event| {
        let tx = all_tx.clone();
        async move {
            tx.send(event.subject.to_string()).ok();
            Ok::<_, Error>(())
        }
    })
    .await
    .unwrap();

    bus.publish("chases.created", b"{}".to_vec()).await.unwrap();
    bus.publish("users.created", b"{}".to_vec()).await.unwrap();
    bus.publish("chases.live", b"{}".to_vec()).await.unwrap();

    assert_eq!(chases_rx.recv().await.unwrap(), "chases.created");
    assert_eq!(chases_rx.recv().await.unwrap(), "chases.live");
    assert_eq!(all_rx.recv().await.unwrap(), "users.created");

    bus.close().await.unwrap();
    assert!(chases_rx.recv().await.is_none());
}

#[tokio::test]
async fn test_health_reports_broker_outage() {
    let (bus, broker) = EventBus::in_memory(BusConfig::default()).await.unwrap();
    let bus = Arc::new(bus);
    let store = Arc::new(MemoryStore::new());
    let background = Background::start(AppConfig::default(), Deps::new(bus.clone(), store.clone(), store));

    assert!(background.health().broker_connected);
    broker.set_connected(false);
    assert!(!background.health().broker_connected);
    assert!(matches!(
        bus.publish("chases.created", Vec::new()).await,
        Err(Error::NotConnected)
    ));
    broker.set_connected(true);
    background.shutdown().await.unwrap();
}

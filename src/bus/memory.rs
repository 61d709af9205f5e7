use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, warn};

use super::{Acknowledge, Delivery, MessageStream, StreamSpec, Transport};
use crate::{
    Error, Result,
    config::BusConfig,
    event::{Event, Subject, SubjectPattern},
};

struct Stored {
    seq: u64,
    event: Event,
    stored_at: Instant,
}

struct StreamLog {
    spec: StreamSpec,
    filters: Vec<SubjectPattern>,
    messages: VecDeque<Stored>,
    last_seq: u64,
}

impl StreamLog {
    fn covers(&self, subject: &str) -> bool {
        self.filters.iter().any(|f| f.matches(subject))
    }

    fn get(&self, seq: u64) -> Option<&Stored> {
        let idx = self.messages.partition_point(|m| m.seq < seq);
        self.messages.get(idx).filter(|m| m.seq == seq)
    }

    fn expire(&mut self, now: Instant) {
        while let Some(front) = self.messages.front() {
            if now.duration_since(front.stored_at) <= self.spec.max_age {
                break;
            }
            self.messages.pop_front();
        }
    }
}

/// Position of one durable consumer within its stream.
struct Consumer {
    stream: String,
    filter: SubjectPattern,
    /// Next stream sequence not yet looked at.
    next_seq: u64,
    /// Delivered but not acknowledged, with their delivery counts.
    pending: BTreeMap<u64, u32>,
    /// Pending sequences waiting to be sent again, oldest first.
    redeliver: VecDeque<u64>,
    bound: bool,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamLog>,
    consumers: HashMap<String, Consumer>,
}

impl State {
    fn next_for(&mut self, durable: &str, max_deliver: u32) -> Option<(Event, u64, u32)> {
        let consumer = self.consumers.get_mut(durable)?;
        let stream = self.streams.get(&consumer.stream)?;

        while let Some(seq) = consumer.redeliver.pop_front() {
            let Some(count) = consumer.pending.get(&seq).copied() else {
                continue;
            };
            match stream.get(seq) {
                Some(stored) if count < max_deliver => {
                    consumer.pending.insert(seq, count + 1);
                    return Some((stored.event.clone(), seq, count + 1));
                }
                Some(stored) => {
                    warn!(
                        durable,
                        subject = %stored.event.subject,
                        seq,
                        deliveries = count,
                        "dropping message after max deliveries"
                    );
                    consumer.pending.remove(&seq);
                }
                None => {
                    consumer.pending.remove(&seq);
                }
            }
        }

        let start = stream.messages.partition_point(|m| m.seq < consumer.next_seq);
        for stored in stream.messages.range(start..) {
            consumer.next_seq = stored.seq + 1;
            if consumer.filter.matches(stored.event.subject.as_str()) {
                consumer.pending.insert(stored.seq, 1);
                return Some((stored.event.clone(), stored.seq, 1));
            }
        }
        None
    }
}

struct Shared {
    state: Mutex<State>,
    notify: watch::Sender<u64>,
    connected: AtomicBool,
    closed: AtomicBool,
    max_deliver: u32,
}

impl Shared {
    fn wake(&self) {
        self.notify.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// An in-process broker with durable streams and consumers.
///
/// Events are kept per stream for `max_age`. Each durable consumer remembers
/// which messages it has been sent and which it has acknowledged, so a
/// subscriber that goes away and binds again gets every unacknowledged message
/// redelivered before new ones.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new(config: &BusConfig) -> Self {
        let (notify, _) = watch::channel(0);
        MemoryBroker {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify,
                connected: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                max_deliver: config.max_deliver,
            }),
        }
    }

    /// Simulate losing or regaining the broker link.
    pub fn set_connected(&self, connected: bool) {
        self.shared.connected.store(connected, Ordering::Release);
        if connected {
            self.shared.wake();
        }
    }

    /// Messages currently retained by `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.shared
            .state
            .lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.messages.len())
    }

    /// Messages delivered to `durable` but not acknowledged yet.
    pub fn pending(&self, durable: &str) -> usize {
        self.shared
            .state
            .lock()
            .consumers
            .get(durable)
            .map_or(0, |c| c.pending.len())
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn ensure_streams(&self, streams: &[StreamSpec]) -> Result<()> {
        self.check_open()?;
        let mut state = self.shared.state.lock();
        for spec in streams {
            if state.streams.contains_key(&spec.name) {
                continue;
            }
            let filters = spec
                .subjects
                .iter()
                .map(SubjectPattern::new)
                .collect::<Result<Vec<_>>>()?;
            debug!(stream = %spec.name, subjects = ?spec.subjects, "stream created");
            state.streams.insert(
                spec.name.clone(),
                StreamLog {
                    spec: spec.clone(),
                    filters,
                    messages: VecDeque::new(),
                    last_seq: 0,
                },
            );
        }
        Ok(())
    }

    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<()> {
        self.check_open()?;
        {
            let mut state = self.shared.state.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.covers(subject.as_str()))
                .ok_or_else(|| Error::Broker(format!("no stream matches subject {subject}")))?;
            let now = Instant::now();
            stream.expire(now);
            stream.last_seq += 1;
            stream.messages.push_back(Stored {
                seq: stream.last_seq,
                event: Event {
                    subject: subject.clone(),
                    payload,
                    occurred_at: Utc::now(),
                },
                stored_at: now,
            });
        }
        self.shared.wake();
        Ok(())
    }

    async fn subscribe(&self, pattern: &SubjectPattern, durable: &str) -> Result<MessageStream> {
        self.check_open()?;
        {
            let mut state = self.shared.state.lock();
            let stream_name = pattern
                .root()
                .and_then(|root| {
                    state
                        .streams
                        .iter()
                        .find(|(_, s)| s.filters.iter().any(|f| f.root() == Some(root)))
                        .map(|(name, _)| name.clone())
                })
                .ok_or_else(|| Error::Broker(format!("no stream matches pattern {pattern}")))?;

            let consumer = state
                .consumers
                .entry(durable.to_string())
                .or_insert_with(|| Consumer {
                    stream: stream_name.clone(),
                    filter: pattern.clone(),
                    next_seq: 0,
                    pending: BTreeMap::new(),
                    redeliver: VecDeque::new(),
                    bound: false,
                });
            if consumer.filter != *pattern || consumer.stream != stream_name {
                return Err(Error::Broker(format!(
                    "durable '{durable}' is bound to {} and cannot change to {pattern}",
                    consumer.filter
                )));
            }
            if consumer.bound {
                return Err(Error::SubscriptionExists(durable.to_string()));
            }
            consumer.bound = true;
            consumer.redeliver = consumer.pending.keys().copied().collect();
        }

        let binding = Binding {
            shared: self.shared.clone(),
            durable: Arc::from(durable),
        };
        let rx = self.shared.notify.subscribe();
        let stream = futures_util::stream::unfold((binding, rx), |(binding, mut rx)| async move {
            loop {
                let _ = rx.borrow_and_update();
                if binding.shared.closed.load(Ordering::Acquire) {
                    return None;
                }
                if binding.shared.connected.load(Ordering::Acquire) {
                    let next = binding
                        .shared
                        .state
                        .lock()
                        .next_for(&binding.durable, binding.shared.max_deliver);
                    if let Some((event, seq, attempt)) = next {
                        let acker = MemoryAck {
                            shared: binding.shared.clone(),
                            durable: binding.durable.clone(),
                            seq,
                        };
                        let delivery = Delivery::new(event, attempt, Box::new(acker));
                        return Some((Ok(delivery), (binding, rx)));
                    }
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        });
        Ok(Box::pin(stream))
    }

    fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire) && self.shared.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            debug!("memory broker closed");
            self.shared.wake();
        }
        Ok(())
    }
}

/// Releases a durable consumer when its message stream is dropped.
struct Binding {
    shared: Arc<Shared>,
    durable: Arc<str>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        if let Some(consumer) = self.shared.state.lock().consumers.get_mut(&*self.durable) {
            consumer.bound = false;
            consumer.redeliver.clear();
        }
    }
}

struct MemoryAck {
    shared: Arc<Shared>,
    durable: Arc<str>,
    seq: u64,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(&self) -> Result<()> {
        if let Some(consumer) = self.shared.state.lock().consumers.get_mut(&*self.durable) {
            consumer.pending.remove(&self.seq);
        }
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if let Some(consumer) = state.consumers.get_mut(&*self.durable) {
                if consumer.pending.contains_key(&self.seq) && consumer.bound {
                    consumer.redeliver.push_back(self.seq);
                }
            }
        }
        self.shared.wake();
        Ok(())
    }
}

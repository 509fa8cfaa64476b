//! Pluggable pub/sub drivers.
//!
//! A queue (shard) is one topic + consumer group on some driver. Drivers are
//! constructed from URL descriptors of the form
//! `scheme://host1,host2/topic/group` through an explicit registry built at
//! startup; unknown schemes fall back to the no-op driver so a node with a
//! stale queue list keeps running.
//!
//! Delivery is at-least-once: a driver keeps redelivering an event until the
//! handler returns `Ok`, and only then advances its offset. Consumers must
//! therefore be idempotent on `apirequestid`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::errors::{CoreError, Result};
use crate::event::Event;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Delay between redeliveries of an event whose handler failed.
const REDELIVERY_DELAY: Duration = Duration::from_millis(200);

/// The pub/sub capability every driver provides.
#[async_trait]
pub trait Pubsub: Send + Sync {
    /// Queue id: equals the topic, which equals the runtime container id.
    fn id(&self) -> &str;

    async fn send(&self, event: Event) -> Result<()>;

    /// Start consuming; `handler` is invoked per decoded event. Returning
    /// `Err` from the handler leaves the offset uncommitted and the event is
    /// redelivered.
    async fn received(&self, handler: EventHandler) -> Result<()>;

    /// Commit consumed offsets. Drivers that commit on handler success keep
    /// this a no-op.
    async fn commit(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Parsed queue descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMeta {
    pub scheme: String,
    pub brokers: Vec<String>,
    pub topic: String,
    pub group: String,
    pub url: String,
}

/// Parses `scheme://host1,host2/topic/group`.
pub fn parse_queue_url(url_text: &str) -> Result<QueueMeta> {
    let (scheme, rest) = url_text
        .split_once("://")
        .ok_or_else(|| CoreError::InvalidParam(format!("queue url missing scheme: {}", url_text)))?;

    let (hosts, path) = match rest.split_once('/') {
        Some((hosts, path)) => (hosts, path),
        None => {
            return Err(CoreError::InvalidParam(format!(
                "queue url missing topic/group path: {}",
                url_text
            )))
        }
    };

    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() != 2 || segments.iter().any(|s| s.is_empty()) {
        return Err(CoreError::InvalidParam(format!(
            "queue url path must be /topic/group: {}",
            url_text
        )));
    }

    let brokers: Vec<String> = hosts
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    Ok(QueueMeta {
        scheme: scheme.to_string(),
        brokers,
        topic: segments[0].to_string(),
        group: segments[1].to_string(),
        url: url_text.to_string(),
    })
}

// --- loopback driver -------------------------------------------------------

struct TopicChannel {
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

/// In-process topic bus backing the loopback driver. All loopback queues of
/// one process share a bus, which is what makes single-node clusters and
/// integration tests run without a broker.
#[derive(Default)]
pub struct LoopbackBus {
    topics: DashMap<String, Arc<TopicChannel>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> Arc<TopicChannel> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Arc::new(TopicChannel {
                    tx,
                    rx: Mutex::new(Some(rx)),
                })
            })
            .clone()
    }
}

pub struct LoopbackPubsub {
    meta: QueueMeta,
    bus: Arc<LoopbackBus>,
}

impl LoopbackPubsub {
    pub fn new(meta: QueueMeta, bus: Arc<LoopbackBus>) -> Self {
        Self { meta, bus }
    }
}

#[async_trait]
impl Pubsub for LoopbackPubsub {
    fn id(&self) -> &str {
        &self.meta.topic
    }

    async fn send(&self, event: Event) -> Result<()> {
        debug!(topic = %self.meta.topic, event_id = %event.id, "pubsub.loopback send");
        self.bus
            .topic(&self.meta.topic)
            .tx
            .send(event)
            .map_err(|_| CoreError::Unavailable(format!("topic closed: {}", self.meta.topic)))
    }

    async fn received(&self, handler: EventHandler) -> Result<()> {
        let channel = self.bus.topic(&self.meta.topic);
        let mut rx = channel.rx.lock().await.take().ok_or_else(|| {
            CoreError::Internal(format!("topic already consumed: {}", self.meta.topic))
        })?;

        let topic = self.meta.topic.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // At-least-once: retry the same event until the handler
                // commits it by returning Ok.
                loop {
                    match handler(event.clone()).await {
                        Ok(()) => break,
                        Err(e) => {
                            warn!(topic = %topic, event_id = %event.id, error = %e,
                                "handler failed, redelivering");
                            tokio::time::sleep(REDELIVERY_DELAY).await;
                        }
                    }
                }
            }
            debug!(topic = %topic, "loopback consumer stopped");
        });
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.bus.topics.remove(&self.meta.topic);
        Ok(())
    }
}

// --- noop driver ------------------------------------------------------------

/// Sink for unknown schemes: sends vanish, consumption never yields.
pub struct NoopPubsub {
    id: String,
}

impl NoopPubsub {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl Pubsub for NoopPubsub {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, event: Event) -> Result<()> {
        debug!(id = %self.id, event_id = %event.id, "pubsub.noop send");
        Ok(())
    }

    async fn received(&self, _handler: EventHandler) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// --- registry ---------------------------------------------------------------

type PubsubConstructor = Box<dyn Fn(&QueueMeta) -> Result<Arc<dyn Pubsub>> + Send + Sync>;

/// Explicit driver registry built at startup.
pub struct PubsubRegistry {
    constructors: HashMap<String, PubsubConstructor>,
}

impl PubsubRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the built-in `loopback` and `noop` drivers, all
    /// loopback queues sharing `bus`.
    pub fn with_defaults(bus: Arc<LoopbackBus>) -> Self {
        let mut registry = Self::new();
        registry.register("loopback", move |meta| {
            Ok(Arc::new(LoopbackPubsub::new(meta.clone(), bus.clone())) as Arc<dyn Pubsub>)
        });
        registry.register("noop", |meta| {
            Ok(Arc::new(NoopPubsub::new(&meta.topic)) as Arc<dyn Pubsub>)
        });
        registry
    }

    pub fn register<F>(&mut self, scheme: &str, constructor: F)
    where
        F: Fn(&QueueMeta) -> Result<Arc<dyn Pubsub>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(scheme.to_string(), Box::new(constructor));
    }

    /// Build a driver for a queue descriptor. Unknown schemes fall back to
    /// the no-op driver.
    pub fn create(&self, meta: &QueueMeta) -> Result<Arc<dyn Pubsub>> {
        match self.constructors.get(&meta.scheme) {
            Some(constructor) => constructor(meta),
            None => {
                warn!(scheme = %meta.scheme, topic = %meta.topic,
                    "unknown pubsub scheme, using noop driver");
                Ok(Arc::new(NoopPubsub::new(&meta.topic)))
            }
        }
    }
}

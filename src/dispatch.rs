//! Dispatcher: routes events to queues by consistent hash of the entity id.
//!
//! One queue = one pub/sub topic = one runtime container. At startup the
//! dispatcher reconciles its configured queue records with the repository
//! (higher version wins), instantiates a driver per descriptor through the
//! registry, and builds a small consistent-hash ring over the queue ids so
//! every mutation of one entity always lands on the same shard.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{CoreError, Result};
use crate::event::Event;
use crate::metrics;
use crate::pubsub::{parse_queue_url, EventHandler, Pubsub, PubsubRegistry};
use crate::repository::{QueueRecord, Repository};
use crate::ring::HashRing;

pub struct QueueBinding {
    pub record: QueueRecord,
    pub driver: Arc<dyn Pubsub>,
    /// True when this node's runtime consumes the queue.
    pub local: bool,
}

pub struct Dispatcher {
    queues: HashMap<String, QueueBinding>,
    ring: HashRing,
}

impl Dispatcher {
    /// Build the dispatcher from the configured queue descriptors.
    pub async fn new(
        config: &Config,
        registry: &PubsubRegistry,
        repo: &Repository,
    ) -> Result<Self> {
        let mut queues = HashMap::new();
        let mut ring = HashRing::new();

        for url in &config.queues {
            let meta = parse_queue_url(url)?;
            let mut record = QueueRecord {
                id: meta.topic.clone(),
                name: meta.topic.clone(),
                queue_type: meta.scheme.clone(),
                version: 1,
                node_name: config.server.name.clone(),
                consumers: vec![meta.group.clone()],
                consumer_type: "dispatcher".to_string(),
                ..QueueRecord::default()
            };

            // Startup reconciliation: the higher queue version wins.
            match repo.get_queue(&record.id).await? {
                Some(stored) if stored.version > record.version => {
                    debug!(queue = %record.id, stored = stored.version,
                        "keeping stored queue record");
                    record = stored;
                }
                _ => repo.put_queue(&record).await?,
            }

            let driver = registry.create(&meta)?;
            let local = record.node_name == config.server.name;
            ring.add(&record.id, &record.queue_type, 0);
            queues.insert(
                record.id.clone(),
                QueueBinding {
                    record,
                    driver,
                    local,
                },
            );
        }

        info!(queues = queues.len(), "dispatcher initialized");
        Ok(Self { queues, ring })
    }

    /// The queue owning `entity_id` on the current shard layout.
    pub fn queue_for(&self, entity_id: &str) -> Result<&QueueBinding> {
        let queue_id = self.ring.get_host(entity_id)?.name.clone();
        self.queues
            .get(&queue_id)
            .ok_or(CoreError::HostNotFound(queue_id))
    }

    /// Route one event. Local and remote queues go through the same driver
    /// call; remote just means another node's runtime consumes the topic.
    /// Returns promptly after the enqueue; delivery is asynchronous.
    pub async fn dispatch(&self, event: Event) -> Result<()> {
        event.validate()?;
        let binding = self.queue_for(&event.entityid)?;
        debug!(
            queue = %binding.record.id,
            entity_id = %event.entityid,
            event_id = %event.id,
            "dispatching event"
        );
        metrics::EVENTS_DISPATCHED
            .with_label_values(&[binding.record.id.as_str()])
            .inc();
        binding.driver.send(event).await
    }

    /// Start consumption on every local queue. `make_handler` builds the
    /// per-queue handler (the runtime container feed).
    pub async fn start_consuming<F>(&self, make_handler: F) -> Result<()>
    where
        F: Fn(&str) -> EventHandler,
    {
        for binding in self.queues.values().filter(|b| b.local) {
            binding
                .driver
                .received(make_handler(&binding.record.id))
                .await?;
            info!(queue = %binding.record.id, "consuming queue");
        }
        Ok(())
    }

    pub fn local_queue_ids(&self) -> Vec<String> {
        self.queues
            .values()
            .filter(|b| b.local)
            .map(|b| b.record.id.clone())
            .collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub async fn close(&self) -> Result<()> {
        for binding in self.queues.values() {
            binding.driver.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::LoopbackBus;
    use crate::store::MemoryStore;

    async fn dispatcher(config: &Config) -> (Dispatcher, Arc<Repository>) {
        let repo = Arc::new(Repository::new(Arc::new(MemoryStore::new())));
        let registry = PubsubRegistry::with_defaults(Arc::new(LoopbackBus::new()));
        let dispatcher = Dispatcher::new(config, &registry, &repo).await.unwrap();
        (dispatcher, repo)
    }

    #[tokio::test]
    async fn queues_registered_and_local() {
        let config = Config::for_testing();
        let (dispatcher, repo) = dispatcher(&config).await;
        assert_eq!(dispatcher.queue_count(), 2);
        assert_eq!(dispatcher.local_queue_ids().len(), 2);
        // Records landed in the repository.
        assert!(repo.get_queue("core-0").await.unwrap().is_some());
        assert!(repo.get_queue("core-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stored_higher_version_wins() {
        let config = Config::for_testing();
        let repo = Arc::new(Repository::new(Arc::new(MemoryStore::new())));
        repo.put_queue(&QueueRecord {
            id: "core-0".into(),
            name: "core-0".into(),
            queue_type: "loopback".into(),
            version: 9,
            node_name: "elsewhere".into(),
            ..QueueRecord::default()
        })
        .await
        .unwrap();

        let registry = PubsubRegistry::with_defaults(Arc::new(LoopbackBus::new()));
        let dispatcher = Dispatcher::new(&config, &registry, &repo).await.unwrap();

        // The stored record survived, so the queue is not local here.
        assert_eq!(dispatcher.local_queue_ids(), vec!["core-1".to_string()]);
        assert_eq!(
            repo.get_queue("core-0").await.unwrap().unwrap().version,
            9
        );
    }

    #[tokio::test]
    async fn same_entity_always_same_queue() {
        let config = Config::for_testing();
        let (dispatcher, _) = dispatcher(&config).await;
        let first = dispatcher.queue_for("device-42").unwrap().record.id.clone();
        for _ in 0..10 {
            assert_eq!(dispatcher.queue_for("device-42").unwrap().record.id, first);
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_invalid_events() {
        let config = Config::for_testing();
        let (dispatcher, _) = dispatcher(&config).await;
        let event = Event::new("api.request", "test"); // no entityid
        assert!(matches!(
            dispatcher.dispatch(event).await,
            Err(CoreError::InvalidParam(_))
        ));
    }
}

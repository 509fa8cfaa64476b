//! Runtime: one single-threaded cooperative event loop (container) per queue.
//!
//! A container exclusively owns every entity whose shard maps to its queue.
//! Messages are processed strictly serially, so per-entity order is total and
//! no lock guards entity state. Containers on different queues run in
//! parallel.
//!
//! Per message the container:
//! 1. replays the cached first outcome for an already-seen `apirequestid`
//!    (effective exactly-once for API callers over at-least-once delivery),
//! 2. locates or hydrates the entity state machine,
//! 3. invokes the pure transition (panics are caught, never escape the loop),
//! 4. persists the snapshot; a write failure leaves the offset uncommitted
//!    so the message is redelivered,
//! 5. fires dependent mappers through the tentacle index and dispatches
//!    their patch events downstream,
//! 6. POSTs the reply to the callback URL when the request carried one.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::entity::{encode_entity, path_segments, Entity, PatchData, PatchOp};
use crate::errors::{CoreError, Result};
use crate::event::{ApiIdentify, Event, EVENT_TYPE_ENTITY};
use crate::holder::Response;
use crate::machine;
use crate::mapper::TentacleIndex;
use crate::metrics;
use crate::placement::OwnedStates;
use crate::pubsub::EventHandler;
use crate::repository::{MapperChange, Repository};
use crate::respond::CallbackClient;

struct Delivery {
    event: Event,
    /// Resolves when the message is definitively handled; `Err` leaves the
    /// pub/sub offset uncommitted.
    ack: oneshot::Sender<Result<()>>,
}

struct Shared {
    repo: Arc<Repository>,
    dispatcher: Arc<Dispatcher>,
    callback: Arc<CallbackClient>,
    index: Arc<RwLock<TentacleIndex>>,
    owned: Arc<OwnedStates>,
    replay_cache_size: usize,
}

/// The per-node runtime: lazily creates one container per consumed queue.
#[derive(Clone)]
pub struct RuntimeNode {
    shared: Arc<Shared>,
    containers: Arc<dashmap::DashMap<String, mpsc::Sender<Delivery>>>,
}

impl RuntimeNode {
    pub fn new(
        repo: Arc<Repository>,
        dispatcher: Arc<Dispatcher>,
        callback: Arc<CallbackClient>,
        owned: Arc<OwnedStates>,
        replay_cache_size: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                repo,
                dispatcher,
                callback,
                index: Arc::new(RwLock::new(TentacleIndex::new())),
                owned,
                replay_cache_size: replay_cache_size.max(1),
            }),
            containers: Arc::new(dashmap::DashMap::new()),
        }
    }

    pub fn index(&self) -> Arc<RwLock<TentacleIndex>> {
        self.shared.index.clone()
    }

    /// Load mappers, watch for mapper changes, and start consuming every
    /// local queue.
    pub async fn start(&self) -> Result<()> {
        info!("starting runtime node");
        self.load_mappers().await?;
        self.watch_mappers();

        let node = self.clone();
        self.shared
            .dispatcher
            .start_consuming(move |queue_id| node.handler(queue_id))
            .await
    }

    /// Stop all containers: closing the channels ends each loop after its
    /// in-flight message.
    pub fn shutdown(&self) {
        info!("runtime node shutting down");
        self.containers.clear();
    }

    async fn load_mappers(&self) -> Result<()> {
        let mappers = self.shared.repo.range_mappers().await?;
        let mut index = self.shared.index.write().expect("tentacle index lock");
        for mapper in mappers {
            let id = mapper.id.clone();
            if let Err(e) = index.upsert(mapper) {
                warn!(mapper_id = %id, error = %e, "skipping unparsable mapper");
            }
        }
        info!(mappers = index.len(), "mapper environment initialized");
        Ok(())
    }

    fn watch_mappers(&self) {
        let mut rx = self.shared.repo.watch_mappers();
        let index = self.shared.index.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((revision, MapperChange::Put(mapper))) => {
                        debug!(mapper_id = %mapper.id, revision, "mapper updated");
                        let mut index = index.write().expect("tentacle index lock");
                        let id = mapper.id.clone();
                        if let Err(e) = index.upsert(mapper) {
                            warn!(mapper_id = %id, error = %e, "rejecting mapper update");
                        }
                    }
                    Ok((revision, MapperChange::Delete(id))) => {
                        debug!(mapper_id = %id, revision, "mapper removed");
                        index.write().expect("tentacle index lock").remove(&id);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "mapper watch lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Handler handed to the queue driver; feeds the container and waits for
    /// the ack that commits (or withholds) the offset.
    fn handler(&self, queue_id: &str) -> EventHandler {
        let node = self.clone();
        let queue_id = queue_id.to_string();
        Arc::new(move |event| {
            let node = node.clone();
            let queue_id = queue_id.clone();
            Box::pin(async move { node.deliver(&queue_id, event).await })
        })
    }

    /// Feed one event into a container and wait for its definitive outcome.
    /// `Err` means the pub/sub offset must stay uncommitted.
    pub async fn deliver(&self, queue_id: &str, event: Event) -> Result<()> {
        let sender = self
            .containers
            .entry(queue_id.to_string())
            .or_insert_with(|| {
                info!(queue = %queue_id, "creating container");
                let (tx, rx) = mpsc::channel(64);
                let container = Container::new(queue_id, self.shared.clone());
                tokio::spawn(container.run(rx));
                tx
            })
            .clone();

        let (ack_tx, ack_rx) = oneshot::channel();
        sender
            .send(Delivery {
                event,
                ack: ack_tx,
            })
            .await
            .map_err(|_| CoreError::Internal(format!("container stopped: {}", queue_id)))?;
        ack_rx
            .await
            .map_err(|_| CoreError::Internal(format!("container dropped ack: {}", queue_id)))?
    }
}

/// One shard's event loop state. Exclusively owned by its task.
struct Container {
    queue_id: String,
    shared: Arc<Shared>,
    entities: HashMap<String, Entity>,
    /// First outcome per recent `apirequestid`, replayed on redelivery.
    replay: LruCache<String, Response>,
}

impl Container {
    fn new(queue_id: &str, shared: Arc<Shared>) -> Self {
        let capacity =
            NonZeroUsize::new(shared.replay_cache_size).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            queue_id: queue_id.to_string(),
            shared,
            entities: HashMap::new(),
            replay: LruCache::new(capacity),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            let outcome = self.process(delivery.event).await;
            let _ = delivery.ack.send(outcome);
        }
        debug!(queue = %self.queue_id, "container stopped");
    }

    fn applied(&self, status: &str) {
        metrics::EVENTS_APPLIED
            .with_label_values(&[self.queue_id.as_str(), status])
            .inc();
    }

    async fn process(&mut self, event: Event) -> Result<()> {
        if let Err(e) = event.validate() {
            // Decode/validate failures are dropped, not redelivered.
            warn!(queue = %self.queue_id, error = %e, "dropping invalid event");
            self.applied("dropped");
            return Ok(());
        }

        let entity_id = event.entityid.clone();
        let req_id = event.apirequestid.clone();

        let identify = match event.identify() {
            Ok(identify) => identify,
            Err(e) => {
                warn!(queue = %self.queue_id, entity_id = %entity_id, error = %e,
                    "dropping event with unknown api identify");
                self.applied("dropped");
                return Ok(());
            }
        };

        // Redelivered request: return the first outcome without re-applying.
        if !req_id.is_empty() {
            if let Some(cached) = self.replay.get(&req_id).cloned() {
                debug!(queue = %self.queue_id, req_id = %req_id, "replaying cached outcome");
                self.applied("replayed");
                self.reply(&event, cached).await;
                return Ok(());
            }
        }

        // Locate the state machine, hydrating from the snapshot if needed.
        let current = match self.hydrate(&entity_id).await {
            Ok(current) => current,
            Err(CoreError::InvalidParam(msg)) => {
                // Corrupt snapshot: redelivery cannot help.
                self.finish_error(
                    &event,
                    &req_id,
                    CoreError::Internal(format!("corrupt snapshot: {}", msg)),
                )
                .await;
                return Ok(());
            }
            Err(e) => return Err(e), // store unreachable: redeliver
        };

        // Resolve the template for creates; missing template is definitive.
        let template = match self.resolve_template(identify, &event).await {
            Ok(template) => template,
            Err(CoreError::Unavailable(e)) => return Err(CoreError::Unavailable(e)),
            Err(e) => {
                self.finish_error(&event, &req_id, e).await;
                return Ok(());
            }
        };

        // The transition is pure; a panic inside it (or in TQL evaluation
        // downstream) must not take the loop down.
        let transition = catch_unwind(AssertUnwindSafe(|| {
            machine::handle(current, template.as_ref(), &event)
        }))
        .unwrap_or_else(|_| {
            error!(queue = %self.queue_id, entity_id = %entity_id, "transition panicked");
            Err(CoreError::Internal("transition panicked".into()))
        });

        let feed = match transition {
            Ok(feed) => feed,
            Err(e) => {
                // The request is definitively answered: reply and commit.
                self.finish_error(&event, &req_id, e).await;
                return Ok(());
            }
        };

        // Persist before committing the offset.
        if feed.deleted {
            if let Err(e) = self.shared.repo.del_entity(&entity_id).await {
                warn!(queue = %self.queue_id, entity_id = %entity_id, error = %e,
                    "snapshot delete failed, leaving offset uncommitted");
                return Err(e);
            }
            self.entities.remove(&entity_id);
            self.shared.owned.remove(&entity_id);
        } else if identify != ApiIdentify::GetEntity {
            match self.shared.repo.put_entity(&feed.entity).await {
                Ok(()) => {}
                Err(CoreError::Conflict(msg)) => {
                    // A newer owner already wrote; redelivery cannot help.
                    self.finish_error(&event, &req_id, CoreError::Conflict(msg)).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(queue = %self.queue_id, entity_id = %entity_id, error = %e,
                        "snapshot write failed, leaving offset uncommitted");
                    return Err(e);
                }
            }
            self.entities.insert(entity_id.clone(), feed.entity.clone());
            self.shared
                .owned
                .upsert(&entity_id, feed.entity.version);
        }

        // Derived events: fire every mapper whose sources intersect the
        // changed paths.
        if !feed.changed.is_empty() {
            self.fire_mappers(&entity_id, &feed).await;
        }

        self.applied("ok");
        self.reply(
            &event,
            Response::ok(&req_id, encode_entity(&feed.entity).unwrap_or_default()),
        )
        .await;
        Ok(())
    }

    async fn hydrate(&mut self, entity_id: &str) -> Result<Option<Entity>> {
        if let Some(entity) = self.entities.get(entity_id) {
            return Ok(Some(entity.clone()));
        }
        match self.shared.repo.get_entity(entity_id).await? {
            Some(entity) => {
                debug!(queue = %self.queue_id, entity_id = %entity_id, "hydrated from snapshot");
                self.entities.insert(entity_id.to_string(), entity.clone());
                self.shared.owned.upsert(entity_id, entity.version);
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    async fn resolve_template(
        &self,
        identify: ApiIdentify,
        event: &Event,
    ) -> Result<Option<Entity>> {
        if identify != ApiIdentify::CreateEntity || event.templateid.is_empty() {
            return Ok(None);
        }
        match self.shared.repo.get_entity(&event.templateid).await? {
            Some(template) => Ok(Some(template)),
            None => Err(CoreError::TemplateNotFound(event.templateid.clone())),
        }
    }

    async fn fire_mappers(&self, entity_id: &str, feed: &machine::Feed) {
        // Collect the derived patch events under the read lock, dispatch
        // after releasing it.
        let mut derived: Vec<Event> = Vec::new();
        {
            let index = self.shared.index.read().expect("tentacle index lock");
            let root = feed.entity.properties_root();
            for instance in index.mappers_for(entity_id, &feed.changed) {
                let mut inputs = std::collections::BTreeMap::new();
                for source in instance.tql.sources() {
                    let Some((src_entity, src_path)) = source.split_once('.') else {
                        continue;
                    };
                    if src_entity != entity_id {
                        continue;
                    }
                    let Ok(segments) = path_segments(src_path) else {
                        continue;
                    };
                    if let Some(value) = root.get_path(&segments) {
                        inputs.insert(source.clone(), value.clone());
                    }
                }

                let outputs = instance.tql.eval(&inputs);
                if outputs.is_empty() {
                    continue;
                }

                let patches: Vec<PatchData> = outputs
                    .into_iter()
                    .map(|(alias, value)| PatchData {
                        op: PatchOp::Add,
                        path: format!("/{}", alias.replace('.', "/")),
                        value: Some(value),
                        from: None,
                    })
                    .collect();

                match crate::entity::encode_patches(&patches) {
                    Ok(data) => {
                        let mut ev = Event::new(EVENT_TYPE_ENTITY, entity_id);
                        ev.entityid = instance.tql.target().to_string();
                        ev.receiver = instance.tql.target().to_string();
                        ev.entitytype = instance.mapper.entity_type.clone();
                        ev.sender = instance.mapper.id.clone();
                        ev.apiidentify = ApiIdentify::PatchEntityProps.as_str().to_string();
                        ev.data = data;
                        derived.push(ev);
                    }
                    Err(e) => {
                        warn!(mapper_id = %instance.mapper.id, error = %e,
                            "cannot encode mapper output");
                    }
                }
            }
        }

        for ev in derived {
            let target = ev.entityid.clone();
            if let Err(e) = self.shared.dispatcher.dispatch(ev).await {
                warn!(queue = %self.queue_id, target = %target, error = %e,
                    "dropping derived mapper event");
            }
        }
    }

    async fn finish_error(&mut self, event: &Event, req_id: &str, err: CoreError) {
        warn!(
            queue = %self.queue_id,
            entity_id = %event.entityid,
            req_id = %req_id,
            error = %err,
            "transition failed"
        );
        self.applied("error");
        self.reply(event, Response::error(req_id, &err)).await;
    }

    /// Send (and for definitive outcomes cache) the reply. Requests without
    /// a callback (mapper-derived events) have nobody waiting.
    async fn reply(&mut self, event: &Event, response: Response) {
        if !event.apirequestid.is_empty() {
            self.replay
                .put(event.apirequestid.clone(), response.clone());
        }
        if event.callback.is_empty() || event.apirequestid.is_empty() {
            return;
        }
        if let Err(e) = self
            .shared
            .callback
            .post_reply(&event.callback, &response)
            .await
        {
            warn!(req_id = %response.req_id, error = %e, "reply delivery failed");
        }
    }
}

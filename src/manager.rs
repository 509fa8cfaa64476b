//! APIManager: the bridge between synchronous callers and the event bus.
//!
//! Every call is encoded as an `api.request` event carrying a fresh request
//! id and this node's callback URL, dispatched onto the owning shard, and
//! answered asynchronously: the runtime POSTs the reply to `/v1/respond`,
//! which wakes the registered holder waiter. The caller blocks on the holder
//! with the configured deadline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::entity::{decode_entity, encode_entity, encode_patches, Entity, PatchData};
use crate::errors::{CoreError, Result};
use crate::event::{ApiIdentify, Event, EVENT_TYPE_API_REQUEST, SENDER_API_MANAGER};
use crate::holder::{Holder, Response};
use crate::mapper::{Mapper, MapperInstance, Subscription};
use crate::metrics;
use crate::repository::Repository;
use crate::respond;
use crate::utils;

pub struct ApiManager {
    holder: Arc<Holder>,
    dispatcher: Arc<Dispatcher>,
    repo: Arc<Repository>,
    callback_addr: String,
    timeout: Duration,
}

impl ApiManager {
    pub fn new(
        config: &Config,
        repo: Arc<Repository>,
        dispatcher: Arc<Dispatcher>,
        holder: Arc<Holder>,
    ) -> Self {
        let callback_addr =
            respond::callback_addr(&utils::resolve_addr(), config.server.callback_port());
        info!(callback = %callback_addr, "api manager started");
        Self {
            holder,
            dispatcher,
            repo,
            callback_addr,
            timeout: Duration::from_secs(config.runtime.request_timeout_secs),
        }
    }

    /// Bridge from the `/v1/respond` endpoint.
    pub fn on_respond(&self, response: Response) {
        self.holder.on_respond(response);
    }

    pub fn holder(&self) -> Arc<Holder> {
        self.holder.clone()
    }

    // ------------------------------- APIs --------------------------------

    /// Create an entity, optionally cloning `template_id`. An empty entity
    /// id is assigned a UUID.
    pub async fn create_entity(
        &self,
        mut base: Entity,
        template_id: Option<&str>,
    ) -> Result<Entity> {
        if base.id.is_empty() {
            base.id = utils::uuid();
        }
        let req_id = utils::uuid();
        let elapsed = utils::Elapsed::new();
        info!(entity_id = %base.id, entity_type = %base.entity_type,
            req_id = %req_id, owner = %base.owner, "entity.CreateEntity");

        // Check the template before anything is dispatched.
        let template_id = template_id.unwrap_or_default();
        if !template_id.is_empty() && !self.repo.has_entity(template_id).await? {
            error!(entity_id = %base.id, template = %template_id, req_id = %req_id,
                "template entity not found");
            return Err(CoreError::TemplateNotFound(template_id.to_string()));
        }

        let mut ev = self.make_event(&base, ApiIdentify::CreateEntity, &req_id)?;
        ev.templateid = template_id.to_string();

        let entity = self.call(ev, &req_id).await?;
        info!(entity_id = %entity.id, req_id = %req_id, elapsed_ms = elapsed.ms(),
            "processing completed");
        Ok(entity)
    }

    pub async fn update_entity(&self, base: Entity) -> Result<Entity> {
        let req_id = utils::uuid();
        let elapsed = utils::Elapsed::new();
        info!(entity_id = %base.id, req_id = %req_id, "entity.UpdateEntity");

        let ev = self.make_event(&base, ApiIdentify::UpdateEntity, &req_id)?;
        let entity = self.call(ev, &req_id).await?;
        info!(entity_id = %entity.id, req_id = %req_id, elapsed_ms = elapsed.ms(),
            "processing completed");
        Ok(entity)
    }

    pub async fn get_entity(&self, entity_id: &str) -> Result<Entity> {
        let req_id = utils::uuid();
        debug!(entity_id = %entity_id, req_id = %req_id, "entity.GetEntity");

        let base = Entity {
            id: entity_id.to_string(),
            ..Entity::default()
        };
        let ev = self.make_event(&base, ApiIdentify::GetEntity, &req_id)?;
        self.call(ev, &req_id).await
    }

    pub async fn delete_entity(&self, entity_id: &str) -> Result<()> {
        let req_id = utils::uuid();
        let elapsed = utils::Elapsed::new();
        info!(entity_id = %entity_id, req_id = %req_id, "entity.DeleteEntity");

        let base = Entity {
            id: entity_id.to_string(),
            ..Entity::default()
        };
        let ev = self.make_event(&base, ApiIdentify::DeleteEntity, &req_id)?;
        self.call(ev, &req_id).await?;
        info!(entity_id = %entity_id, req_id = %req_id, elapsed_ms = elapsed.ms(),
            "processing completed");
        Ok(())
    }

    pub async fn update_entity_props(&self, base: Entity) -> Result<Entity> {
        let req_id = utils::uuid();
        info!(entity_id = %base.id, req_id = %req_id, "entity.UpdateEntityProps");

        let ev = self.make_event(&base, ApiIdentify::UpdateEntityProps, &req_id)?;
        self.call(ev, &req_id).await
    }

    pub async fn patch_entity_props(
        &self,
        entity_id: &str,
        patches: &[PatchData],
    ) -> Result<Entity> {
        let req_id = utils::uuid();
        info!(entity_id = %entity_id, req_id = %req_id, patches = patches.len(),
            "entity.PatchEntityProps");

        let ev = self.make_patch_event(entity_id, ApiIdentify::PatchEntityProps, &req_id, patches)?;
        self.call(ev, &req_id).await
    }

    pub async fn update_entity_configs(&self, base: Entity) -> Result<Entity> {
        let req_id = utils::uuid();
        info!(entity_id = %base.id, req_id = %req_id, "entity.UpdateEntityConfigs");

        let ev = self.make_event(&base, ApiIdentify::UpdateEntityConfigs, &req_id)?;
        self.call(ev, &req_id).await
    }

    pub async fn patch_entity_configs(
        &self,
        entity_id: &str,
        patches: &[PatchData],
    ) -> Result<Entity> {
        let req_id = utils::uuid();
        info!(entity_id = %entity_id, req_id = %req_id, patches = patches.len(),
            "entity.PatchEntityConfigs");

        let ev =
            self.make_patch_event(entity_id, ApiIdentify::PatchEntityConfigs, &req_id, patches)?;
        self.call(ev, &req_id).await
    }

    /// Upsert a mapper after validating its TQL and target.
    pub async fn append_mapper(&self, mapper: Mapper) -> Result<()> {
        info!(mapper_id = %mapper.id, entity_id = %mapper.entity_id, "entity.AppendMapper");
        MapperInstance::compile(mapper.clone())?;
        self.repo.put_mapper(&mapper).await
    }

    pub async fn remove_mapper(&self, mapper_id: &str) -> Result<()> {
        info!(mapper_id = %mapper_id, "entity.RemoveMapper");
        self.repo.del_mapper(mapper_id).await
    }

    /// Validate a subscription entity: the five fields and a parseable
    /// filter.
    pub fn check_subscription(&self, entity: &Entity) -> Result<()> {
        let subscription = Subscription::from_properties(&entity.properties, &entity.source);
        info!(entity_id = %entity.id, mode = %subscription.mode, topic = %subscription.topic,
            pubsub = %subscription.pubsub_name, "check subscription");
        subscription.check()
    }

    // ----------------------------- internals -----------------------------

    /// Dispatch the event and wait for the correlated reply; decode the
    /// entity payload.
    async fn call(&self, event: Event, req_id: &str) -> Result<Entity> {
        let rx = self.holder.register(req_id);

        if let Err(e) = self.dispatcher.dispatch(event).await {
            // Nothing will ever answer; release the waiter.
            self.holder.cancel(req_id);
            error!(req_id = %req_id, error = %e, "dispatch failed");
            return Err(e);
        }

        debug!(req_id = %req_id, "holding request, waiting for response");
        let response = self.holder.wait(req_id, rx, self.timeout).await;
        let data = response.into_result()?;
        decode_entity(&data)
            .map_err(|e| CoreError::Internal(format!("decode api response: {}", e)))
    }

    fn event_base(&self, base: &Entity, identify: ApiIdentify, req_id: &str) -> Event {
        metrics::API_REQUESTS
            .with_label_values(&[identify.as_str()])
            .inc();
        let mut ev = Event::new(EVENT_TYPE_API_REQUEST, &base.source);
        ev.entityid = base.id.clone();
        ev.entitytype = base.entity_type.clone();
        ev.entityowner = base.owner.clone();
        ev.entitysource = base.source.clone();
        ev.receiver = base.id.clone();
        ev.sender = SENDER_API_MANAGER.to_string();
        ev.callback = self.callback_addr.clone();
        ev.apirequestid = req_id.to_string();
        ev.apiidentify = identify.as_str().to_string();
        ev
    }

    fn make_event(&self, base: &Entity, identify: ApiIdentify, req_id: &str) -> Result<Event> {
        let mut ev = self.event_base(base, identify, req_id);
        ev.data = encode_entity(base)?;
        ev.validate()?;
        Ok(ev)
    }

    fn make_patch_event(
        &self,
        entity_id: &str,
        identify: ApiIdentify,
        req_id: &str,
        patches: &[PatchData],
    ) -> Result<Event> {
        let base = Entity {
            id: entity_id.to_string(),
            ..Entity::default()
        };
        let mut ev = self.event_base(&base, identify, req_id);
        ev.data = encode_patches(patches)?;
        ev.validate()?;
        Ok(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PropertyNode;
    use crate::pubsub::{LoopbackBus, PubsubRegistry};
    use crate::store::MemoryStore;

    async fn manager() -> (ApiManager, Arc<Repository>) {
        let config = Config::for_testing();
        let repo = Arc::new(Repository::new(Arc::new(MemoryStore::new())));
        let registry = PubsubRegistry::with_defaults(Arc::new(LoopbackBus::new()));
        let dispatcher = Arc::new(
            Dispatcher::new(&config, &registry, &repo).await.unwrap(),
        );
        let holder = Arc::new(Holder::new());
        (
            ApiManager::new(&config, repo.clone(), dispatcher, holder),
            repo,
        )
    }

    #[tokio::test]
    async fn create_rejects_missing_template() {
        let (manager, _) = manager().await;
        let base = Entity {
            id: "e1".into(),
            source: "dm".into(),
            ..Entity::default()
        };
        let err = manager
            .create_entity(base, Some("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TemplateNotFound(_)));
    }

    #[tokio::test]
    async fn append_mapper_validates_target() {
        let (manager, repo) = manager().await;
        let mismatched = Mapper {
            id: "m1".into(),
            tql: "insert into other select src.x".into(),
            name: "m1".into(),
            entity_id: "e1".into(),
            entity_type: "device".into(),
            description: String::new(),
        };
        assert!(manager.append_mapper(mismatched).await.is_err());
        assert!(repo.range_mappers().await.unwrap().is_empty());

        let good = Mapper {
            id: "m1".into(),
            tql: "insert into e1 select src.x".into(),
            name: "m1".into(),
            entity_id: "e1".into(),
            entity_type: "device".into(),
            description: String::new(),
        };
        manager.append_mapper(good).await.unwrap();
        assert_eq!(repo.range_mappers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn check_subscription_requires_fields() {
        let (manager, _) = manager().await;
        let mut entity = Entity {
            id: "sub1".into(),
            source: "dm".into(),
            ..Entity::default()
        };
        assert!(manager.check_subscription(&entity).is_err());

        entity.properties.insert(
            "mode".into(),
            PropertyNode::String("realtime".into()),
        );
        entity
            .properties
            .insert("topic".into(), PropertyNode::String("t".into()));
        entity.properties.insert(
            "filter".into(),
            PropertyNode::String("insert into sub1 select d.x".into()),
        );
        entity.properties.insert(
            "pubsub_name".into(),
            PropertyNode::String("loopback".into()),
        );
        assert!(manager.check_subscription(&entity).is_ok());
    }

    #[tokio::test]
    async fn dispatch_failure_releases_waiter() {
        // A manager over a dispatcher with unroutable events: entityid empty
        // fails validation inside dispatch.
        let (manager, _) = manager().await;
        let base = Entity::default(); // empty id is replaced, so use make_event directly
        let ev = manager.make_event(&base, ApiIdentify::GetEntity, "req-x");
        assert!(ev.is_err()); // validation failed: no entity id
        assert_eq!(manager.holder().pending(), 0);
    }
}

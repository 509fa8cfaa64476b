//! Repository: typed access to the KV store.
//!
//! Key layout:
//! - `entity/<id>`        MessagePack entity snapshot
//! - `mapper/<id>`        mapper record
//! - `queue/<id>`         queue (shard) record
//! - `expr/<owner>/<id>`  expression text
//!
//! Mapper writes bump a monotone revision and are broadcast to watchers,
//! the in-process analogue of an etcd lease-revision watch, which is how the
//! runtime keeps its tentacle index current.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::entity::{decode_entity, encode_entity, Entity};
use crate::errors::{CoreError, Result};
use crate::mapper::Mapper;
use crate::store::Store;

/// Shard binding record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueueRecord {
    pub id: String,
    pub name: String,
    pub queue_type: String,
    /// Monotone; a higher local version replaces a lower stored one.
    pub version: i64,
    pub node_name: String,
    #[serde(default)]
    pub consumers: Vec<String>,
    #[serde(default)]
    pub consumer_type: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A watched mapper mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapperChange {
    Put(Mapper),
    Delete(String),
}

pub struct Repository {
    store: Arc<dyn Store>,
    revision: AtomicI64,
    mapper_tx: broadcast::Sender<(i64, MapperChange)>,
}

impl Repository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (mapper_tx, _) = broadcast::channel(128);
        Self {
            store,
            revision: AtomicI64::new(0),
            mapper_tx,
        }
    }

    fn bump(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Revision of the last mutation, for watch resumption.
    pub fn last_revision(&self) -> i64 {
        self.revision.load(Ordering::SeqCst)
    }

    // --- entities ---

    /// Persist a snapshot. A version older than the stored snapshot is a
    /// `Conflict`: the caller raced a newer owner.
    pub async fn put_entity(&self, entity: &Entity) -> Result<()> {
        let key = format!("entity/{}", entity.id);
        if let Some(stored) = self.store.get(&key).await? {
            let stored = decode_entity(&stored)?;
            if stored.version > entity.version {
                return Err(CoreError::Conflict(format!(
                    "entity {} stored version {} > {}",
                    entity.id, stored.version, entity.version
                )));
            }
        }
        self.store.set(&key, encode_entity(entity)?).await
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        match self.store.get(&format!("entity/{}", id)).await? {
            Some(bytes) => Ok(Some(decode_entity(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn has_entity(&self, id: &str) -> Result<bool> {
        Ok(self.store.get(&format!("entity/{}", id)).await?.is_some())
    }

    pub async fn del_entity(&self, id: &str) -> Result<()> {
        self.store.del(&format!("entity/{}", id)).await
    }

    // --- mappers ---

    pub async fn put_mapper(&self, mapper: &Mapper) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(mapper)
            .map_err(|e| CoreError::Internal(format!("encode mapper: {}", e)))?;
        self.store
            .set(&format!("mapper/{}", mapper.id), bytes)
            .await?;
        let revision = self.bump();
        let _ = self
            .mapper_tx
            .send((revision, MapperChange::Put(mapper.clone())));
        Ok(())
    }

    pub async fn del_mapper(&self, id: &str) -> Result<()> {
        self.store.del(&format!("mapper/{}", id)).await?;
        let revision = self.bump();
        let _ = self
            .mapper_tx
            .send((revision, MapperChange::Delete(id.to_string())));
        Ok(())
    }

    pub async fn range_mappers(&self) -> Result<Vec<Mapper>> {
        let mut mappers = Vec::new();
        for (_, bytes) in self.store.range("mapper/").await? {
            let mapper: Mapper = rmp_serde::from_slice(&bytes)
                .map_err(|e| CoreError::InvalidParam(format!("decode mapper: {}", e)))?;
            mappers.push(mapper);
        }
        Ok(mappers)
    }

    /// Subscribe to mapper mutations at revisions after the current one.
    pub fn watch_mappers(&self) -> broadcast::Receiver<(i64, MapperChange)> {
        self.mapper_tx.subscribe()
    }

    // --- queues ---

    pub async fn put_queue(&self, queue: &QueueRecord) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(queue)
            .map_err(|e| CoreError::Internal(format!("encode queue: {}", e)))?;
        self.store.set(&format!("queue/{}", queue.id), bytes).await
    }

    pub async fn get_queue(&self, id: &str) -> Result<Option<QueueRecord>> {
        match self.store.get(&format!("queue/{}", id)).await? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes).map_err(|e| {
                CoreError::InvalidParam(format!("decode queue: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    // --- expressions ---

    pub async fn put_expression(&self, owner: &str, id: &str, text: &str) -> Result<()> {
        self.store
            .set(&format!("expr/{}/{}", owner, id), text.as_bytes().to_vec())
            .await?;
        self.bump();
        Ok(())
    }

    pub async fn get_expression(&self, owner: &str, id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&format!("expr/{}/{}", owner, id))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn del_expression(&self, owner: &str, id: &str) -> Result<()> {
        self.store.del(&format!("expr/{}/{}", owner, id)).await?;
        self.bump();
        Ok(())
    }
}

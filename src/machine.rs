//! Entity state machine transitions.
//!
//! A transition is a pure function of the previous entity state and the
//! inbound event; it never touches the repository or the network. The runtime
//! container is responsible for hydration, persistence and replies; this
//! module only computes the next state and the set of changed paths.

use crate::entity::{
    decode_entity, decode_patches, dotted_path, Entity, PropertyNode,
};
use crate::errors::CoreError;
use crate::event::{ApiIdentify, Event};

/// Output of a transition: the new property view plus what changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub entity: Entity,
    /// Dotted property paths that changed, used for mapper activation.
    pub changed: Vec<String>,
    /// Set by `DeleteEntity`; tells the container to drop the machine and the
    /// snapshot.
    pub deleted: bool,
}

impl Feed {
    fn of(entity: Entity) -> Self {
        Feed {
            entity,
            changed: Vec::new(),
            deleted: false,
        }
    }
}

fn require(current: Option<Entity>, id: &str) -> Result<Entity, CoreError> {
    current.ok_or_else(|| CoreError::EntityNotFound(id.to_string()))
}

/// Apply `event` to the previous state.
///
/// `template` is the resolved template entity for `CreateEntity` events that
/// carry a `templateid` extension; the caller resolves it so this function
/// stays free of I/O.
pub fn handle(
    current: Option<Entity>,
    template: Option<&Entity>,
    event: &Event,
) -> Result<Feed, CoreError> {
    let identify = event.identify()?;
    match identify {
        ApiIdentify::CreateEntity => create(current, template, event),
        ApiIdentify::UpdateEntity => update(current, event, true),
        ApiIdentify::GetEntity => {
            let entity = require(current, &event.entityid)?;
            Ok(Feed::of(entity))
        }
        ApiIdentify::DeleteEntity => {
            let entity = require(current, &event.entityid)?;
            let mut feed = Feed::of(entity);
            feed.deleted = true;
            Ok(feed)
        }
        ApiIdentify::UpdateEntityProps => update(current, event, false),
        ApiIdentify::PatchEntityProps => patch_props(current, event),
        ApiIdentify::UpdateEntityConfigs => update_configs(current, event),
        ApiIdentify::PatchEntityConfigs => patch_configs(current, event),
    }
}

fn create(
    current: Option<Entity>,
    template: Option<&Entity>,
    event: &Event,
) -> Result<Feed, CoreError> {
    if current.is_some() {
        return Err(CoreError::Conflict(format!(
            "entity already exists: {}",
            event.entityid
        )));
    }
    let seed = decode_entity(&event.data)?;

    let mut entity = Entity {
        id: event.entityid.clone(),
        entity_type: seed.entity_type,
        owner: seed.owner,
        source: seed.source,
        template_id: event.templateid.clone(),
        config_file: seed.config_file,
        ..Entity::default()
    };
    if let Some(tpl) = template {
        entity.properties = tpl.properties.clone();
        if entity.config_file.is_empty() {
            entity.config_file = tpl.config_file.clone();
        }
    }
    for (key, value) in seed.properties {
        entity.properties.insert(key, value);
    }

    entity.touch(); // version 1
    let changed = entity.properties.keys().cloned().collect();
    Ok(Feed {
        entity,
        changed,
        deleted: false,
    })
}

fn update(current: Option<Entity>, event: &Event, with_configs: bool) -> Result<Feed, CoreError> {
    let mut entity = require(current, &event.entityid)?;
    let seed = decode_entity(&event.data)?;

    let mut changed: Vec<String> = seed.properties.keys().cloned().collect();
    for (key, value) in seed.properties {
        entity.properties.insert(key, value);
    }
    if with_configs && !seed.config_file.is_empty() {
        entity.config_file = seed.config_file;
    }
    changed.sort();

    entity.touch();
    Ok(Feed {
        entity,
        changed,
        deleted: false,
    })
}

fn patch_props(current: Option<Entity>, event: &Event) -> Result<Feed, CoreError> {
    let mut entity = require(current, &event.entityid)?;
    let patches = decode_patches(&event.data)?;

    let mut root = entity.properties_root();
    let mut changed = Vec::with_capacity(patches.len());
    for patch in &patches {
        patch.apply(&mut root)?;
        changed.push(dotted_path(&patch.path));
    }
    entity.set_properties_root(root)?;

    entity.touch();
    Ok(Feed {
        entity,
        changed,
        deleted: false,
    })
}

fn update_configs(current: Option<Entity>, event: &Event) -> Result<Feed, CoreError> {
    let mut entity = require(current, &event.entityid)?;
    let seed = decode_entity(&event.data)?;
    entity.config_file = seed.config_file;
    entity.touch();
    Ok(Feed::of(entity))
}

fn patch_configs(current: Option<Entity>, event: &Event) -> Result<Feed, CoreError> {
    let mut entity = require(current, &event.entityid)?;
    let patches = decode_patches(&event.data)?;

    // The config file is opaque JSON; patch it as a tree and re-encode.
    let mut root: PropertyNode = if entity.config_file.is_empty() {
        PropertyNode::map()
    } else {
        serde_json::from_slice::<serde_json::Value>(&entity.config_file)
            .map(PropertyNode::from)
            .map_err(|e| CoreError::InvalidParam(format!("config file is not JSON: {}", e)))?
    };
    for patch in &patches {
        patch.apply(&mut root)?;
    }
    entity.config_file = serde_json::to_vec(&serde_json::Value::from(&root))
        .map_err(|e| CoreError::Internal(format!("encode config file: {}", e)))?;

    entity.touch();
    Ok(Feed::of(entity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{encode_entity, encode_patches, PatchData, PatchOp};
    use crate::event::{Event, EVENT_TYPE_API_REQUEST};
    use std::collections::BTreeMap;

    fn api_event(id: &str, identify: ApiIdentify, data: Vec<u8>) -> Event {
        let mut ev = Event::new(EVENT_TYPE_API_REQUEST, "test");
        ev.entityid = id.to_string();
        ev.apiidentify = identify.as_str().to_string();
        ev.data = data;
        ev
    }

    fn seed_entity(props: &[(&str, PropertyNode)]) -> Entity {
        Entity {
            id: "e1".into(),
            entity_type: "device".into(),
            owner: "admin".into(),
            source: "dm".into(),
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            ..Entity::default()
        }
    }

    #[test]
    fn create_sets_version_one() {
        let seed = seed_entity(&[("x", PropertyNode::Int(1))]);
        let ev = api_event("e1", ApiIdentify::CreateEntity, encode_entity(&seed).unwrap());
        let feed = handle(None, None, &ev).unwrap();
        assert_eq!(feed.entity.version, 1);
        assert_eq!(feed.entity.get_prop("x"), Some(&PropertyNode::Int(1)));
        assert_eq!(feed.changed, vec!["x".to_string()]);
        assert!(!feed.deleted);
    }

    #[test]
    fn create_on_existing_entity_conflicts() {
        let seed = seed_entity(&[]);
        let ev = api_event("e1", ApiIdentify::CreateEntity, encode_entity(&seed).unwrap());
        let existing = seed_entity(&[]);
        assert!(matches!(
            handle(Some(existing), None, &ev),
            Err(CoreError::Conflict(_))
        ));
    }

    #[test]
    fn create_clones_template_properties() {
        let tpl = seed_entity(&[("y", PropertyNode::String("hi".into()))]);
        let seed = seed_entity(&[]);
        let mut ev = api_event("e2", ApiIdentify::CreateEntity, encode_entity(&seed).unwrap());
        ev.templateid = "tpl".into();
        let feed = handle(None, Some(&tpl), &ev).unwrap();
        assert_eq!(
            feed.entity.get_prop("y"),
            Some(&PropertyNode::String("hi".into()))
        );
        assert_eq!(feed.entity.version, 1);
        assert_eq!(feed.entity.template_id, "tpl");
    }

    #[test]
    fn create_payload_overrides_template() {
        let tpl = seed_entity(&[("y", PropertyNode::Int(1))]);
        let seed = seed_entity(&[("y", PropertyNode::Int(2))]);
        let ev = api_event("e2", ApiIdentify::CreateEntity, encode_entity(&seed).unwrap());
        let feed = handle(None, Some(&tpl), &ev).unwrap();
        assert_eq!(feed.entity.get_prop("y"), Some(&PropertyNode::Int(2)));
    }

    #[test]
    fn update_props_bumps_version_and_merges() {
        let mut existing = seed_entity(&[("x", PropertyNode::Int(1))]);
        existing.version = 3;
        let seed = seed_entity(&[("z", PropertyNode::Bool(true))]);
        let ev = api_event(
            "e1",
            ApiIdentify::UpdateEntityProps,
            encode_entity(&seed).unwrap(),
        );
        let feed = handle(Some(existing), None, &ev).unwrap();
        assert_eq!(feed.entity.version, 4);
        assert_eq!(feed.entity.get_prop("x"), Some(&PropertyNode::Int(1)));
        assert_eq!(feed.entity.get_prop("z"), Some(&PropertyNode::Bool(true)));
        assert_eq!(feed.changed, vec!["z".to_string()]);
    }

    #[test]
    fn update_on_missing_entity_fails() {
        let seed = seed_entity(&[]);
        let ev = api_event("e1", ApiIdentify::UpdateEntity, encode_entity(&seed).unwrap());
        assert!(matches!(
            handle(None, None, &ev),
            Err(CoreError::EntityNotFound(_))
        ));
    }

    #[test]
    fn patch_replace_then_get() {
        let mut existing = seed_entity(&[("x", PropertyNode::Int(1))]);
        existing.version = 1;
        let patches = vec![PatchData {
            op: PatchOp::Replace,
            path: "/x".into(),
            value: Some(PropertyNode::Int(2)),
            from: None,
        }];
        let ev = api_event(
            "e1",
            ApiIdentify::PatchEntityProps,
            encode_patches(&patches).unwrap(),
        );
        let feed = handle(Some(existing), None, &ev).unwrap();
        assert_eq!(feed.entity.version, 2);
        assert_eq!(feed.entity.get_prop("x"), Some(&PropertyNode::Int(2)));
        assert_eq!(feed.changed, vec!["x".to_string()]);

        let get = api_event("e1", ApiIdentify::GetEntity, Vec::new());
        let read = handle(Some(feed.entity.clone()), None, &get).unwrap();
        assert_eq!(read.entity, feed.entity);
        assert!(read.changed.is_empty());
    }

    #[test]
    fn bad_patch_leaves_error() {
        let existing = seed_entity(&[]);
        let patches = vec![PatchData {
            op: PatchOp::Replace,
            path: "/missing".into(),
            value: Some(PropertyNode::Int(2)),
            from: None,
        }];
        let ev = api_event(
            "e1",
            ApiIdentify::PatchEntityProps,
            encode_patches(&patches).unwrap(),
        );
        assert!(handle(Some(existing), None, &ev).is_err());
    }

    #[test]
    fn delete_marks_feed() {
        let existing = seed_entity(&[]);
        let ev = api_event("e1", ApiIdentify::DeleteEntity, Vec::new());
        let feed = handle(Some(existing), None, &ev).unwrap();
        assert!(feed.deleted);
    }

    #[test]
    fn patch_configs_rewrites_config_file() {
        let mut existing = seed_entity(&[]);
        existing.config_file = br#"{"temp":{"type":"int"}}"#.to_vec();
        let patches = vec![PatchData {
            op: PatchOp::Replace,
            path: "/temp/type".into(),
            value: Some(PropertyNode::String("float".into())),
            from: None,
        }];
        let ev = api_event(
            "e1",
            ApiIdentify::PatchEntityConfigs,
            encode_patches(&patches).unwrap(),
        );
        let feed = handle(Some(existing), None, &ev).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&feed.entity.config_file).unwrap();
        assert_eq!(parsed["temp"]["type"], "float");
        assert_eq!(feed.entity.version, 1);
    }

    #[test]
    fn update_configs_replaces_blob() {
        let existing = seed_entity(&[]);
        let mut seed = seed_entity(&[]);
        seed.config_file = br#"{"a":1}"#.to_vec();
        let ev = api_event(
            "e1",
            ApiIdentify::UpdateEntityConfigs,
            encode_entity(&seed).unwrap(),
        );
        let feed = handle(Some(existing), None, &ev).unwrap();
        assert_eq!(feed.entity.config_file, br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn unknown_identify_is_invalid() {
        let mut ev = api_event("e1", ApiIdentify::GetEntity, Vec::new());
        ev.apiidentify = "APIBogus".into();
        assert!(matches!(
            handle(None, None, &ev),
            Err(CoreError::InvalidParam(_))
        ));
    }
}

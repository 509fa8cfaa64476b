//! Entity records: the typed property tree, partial updates (patches) and the
//! MessagePack snapshot codec.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::utils;

/// One node of an entity's property tree.
///
/// Untagged so the wire form (JSON over the API, MessagePack in snapshots) is
/// the plain value, not an enum wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyNode {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyNode>),
    Map(BTreeMap<String, PropertyNode>),
}

impl PropertyNode {
    pub fn map() -> Self {
        PropertyNode::Map(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyNode::Null)
    }

    /// String rendering used by subscription field extraction.
    pub fn as_str(&self) -> String {
        match self {
            PropertyNode::Null => String::new(),
            PropertyNode::Bool(b) => b.to_string(),
            PropertyNode::Int(n) => n.to_string(),
            PropertyNode::Float(f) => f.to_string(),
            PropertyNode::String(s) => s.clone(),
            PropertyNode::List(_) | PropertyNode::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    /// Read the node at `segments`, descending through maps by key and lists
    /// by decimal index.
    pub fn get_path(&self, segments: &[&str]) -> Option<&PropertyNode> {
        let mut node = self;
        for seg in segments {
            node = match node {
                PropertyNode::Map(m) => m.get(*seg)?,
                PropertyNode::List(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Write `value` at `segments`, creating intermediate maps when `create`
    /// is set. Fails when a non-container is in the way, or when `create` is
    /// unset and the leaf does not exist.
    pub fn set_path(
        &mut self,
        segments: &[&str],
        value: PropertyNode,
        create: bool,
    ) -> Result<(), CoreError> {
        let Some((last, parents)) = segments.split_last() else {
            *self = value;
            return Ok(());
        };

        let mut node = self;
        for seg in parents {
            node = match node {
                PropertyNode::Map(m) => {
                    if !m.contains_key(*seg) {
                        if !create {
                            return Err(CoreError::InvalidParam(format!(
                                "path segment not found: {}",
                                seg
                            )));
                        }
                        m.insert(seg.to_string(), PropertyNode::map());
                    }
                    m.get_mut(*seg).expect("inserted above")
                }
                PropertyNode::List(items) => {
                    let idx = seg.parse::<usize>().map_err(|_| {
                        CoreError::InvalidParam(format!("non-numeric list index: {}", seg))
                    })?;
                    items.get_mut(idx).ok_or_else(|| {
                        CoreError::InvalidParam(format!("list index out of range: {}", idx))
                    })?
                }
                _ => {
                    return Err(CoreError::InvalidParam(format!(
                        "cannot descend into scalar at: {}",
                        seg
                    )))
                }
            };
        }

        match node {
            PropertyNode::Map(m) => {
                if !create && !m.contains_key(*last) {
                    return Err(CoreError::InvalidParam(format!(
                        "path not found: {}",
                        last
                    )));
                }
                m.insert(last.to_string(), value);
                Ok(())
            }
            PropertyNode::List(items) => {
                let idx = last.parse::<usize>().map_err(|_| {
                    CoreError::InvalidParam(format!("non-numeric list index: {}", last))
                })?;
                if idx < items.len() {
                    items[idx] = value;
                    Ok(())
                } else if create && idx == items.len() {
                    items.push(value);
                    Ok(())
                } else {
                    Err(CoreError::InvalidParam(format!(
                        "list index out of range: {}",
                        idx
                    )))
                }
            }
            _ => Err(CoreError::InvalidParam(format!(
                "cannot write into scalar at: {}",
                last
            ))),
        }
    }

    /// Remove the node at `segments`. The path must exist.
    pub fn remove_path(&mut self, segments: &[&str]) -> Result<PropertyNode, CoreError> {
        let Some((last, parents)) = segments.split_last() else {
            return Err(CoreError::InvalidParam("empty patch path".into()));
        };
        let parent = if parents.is_empty() {
            self
        } else {
            match self.get_path_mut(parents) {
                Some(node) => node,
                None => {
                    return Err(CoreError::InvalidParam(format!(
                        "path not found: {}",
                        parents.join("/")
                    )))
                }
            }
        };
        match parent {
            PropertyNode::Map(m) => m
                .remove(*last)
                .ok_or_else(|| CoreError::InvalidParam(format!("path not found: {}", last))),
            PropertyNode::List(items) => {
                let idx = last.parse::<usize>().map_err(|_| {
                    CoreError::InvalidParam(format!("non-numeric list index: {}", last))
                })?;
                if idx < items.len() {
                    Ok(items.remove(idx))
                } else {
                    Err(CoreError::InvalidParam(format!(
                        "list index out of range: {}",
                        idx
                    )))
                }
            }
            _ => Err(CoreError::InvalidParam(
                "cannot remove from a scalar".into(),
            )),
        }
    }

    fn get_path_mut(&mut self, segments: &[&str]) -> Option<&mut PropertyNode> {
        let mut node = self;
        for seg in segments {
            node = match node {
                PropertyNode::Map(m) => m.get_mut(*seg)?,
                PropertyNode::List(items) => items.get_mut(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(node)
    }
}

impl From<serde_json::Value> for PropertyNode {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropertyNode::Null,
            serde_json::Value::Bool(b) => PropertyNode::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PropertyNode::Int(i)
                } else {
                    PropertyNode::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => PropertyNode::String(s),
            serde_json::Value::Array(items) => {
                PropertyNode::List(items.into_iter().map(PropertyNode::from).collect())
            }
            serde_json::Value::Object(map) => PropertyNode::Map(
                map.into_iter()
                    .map(|(k, v)| (k, PropertyNode::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&PropertyNode> for serde_json::Value {
    fn from(node: &PropertyNode) -> Self {
        match node {
            PropertyNode::Null => serde_json::Value::Null,
            PropertyNode::Bool(b) => serde_json::Value::Bool(*b),
            PropertyNode::Int(i) => serde_json::Value::from(*i),
            PropertyNode::Float(f) => serde_json::Value::from(*f),
            PropertyNode::String(s) => serde_json::Value::String(s.clone()),
            PropertyNode::List(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            PropertyNode::Map(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Splits a JSON-pointer-like path (`/x/y`) or dotted path (`x.y`) into
/// segments. An empty path is invalid.
pub fn path_segments(path: &str) -> Result<Vec<&str>, CoreError> {
    let segments: Vec<&str> = if let Some(stripped) = path.strip_prefix('/') {
        stripped.split('/').collect()
    } else {
        path.split('.').collect()
    };
    if segments.iter().any(|s| s.is_empty()) {
        return Err(CoreError::InvalidParam(format!(
            "malformed patch path: {:?}",
            path
        )));
    }
    Ok(segments)
}

/// Dotted form of a patch path, used as the mapper-activation key.
pub fn dotted_path(path: &str) -> String {
    path.trim_start_matches('/').replace('/', ".")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
    Copy,
}

/// One partial update against a property tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchData {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<PropertyNode>,
    /// Source path for `copy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl PatchData {
    /// Apply this patch to `root` (the properties map node).
    pub fn apply(&self, root: &mut PropertyNode) -> Result<(), CoreError> {
        let segments = path_segments(&self.path)?;
        match self.op {
            PatchOp::Add => {
                let value = self
                    .value
                    .clone()
                    .ok_or_else(|| CoreError::InvalidParam("add requires a value".into()))?;
                root.set_path(&segments, value, true)
            }
            PatchOp::Replace => {
                let value = self
                    .value
                    .clone()
                    .ok_or_else(|| CoreError::InvalidParam("replace requires a value".into()))?;
                root.set_path(&segments, value, false)
            }
            PatchOp::Remove => root.remove_path(&segments).map(|_| ()),
            PatchOp::Copy => {
                let from = self
                    .from
                    .as_deref()
                    .ok_or_else(|| CoreError::InvalidParam("copy requires a source path".into()))?;
                let from_segments = path_segments(from)?;
                let value = root
                    .get_path(&from_segments)
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::InvalidParam(format!("copy source not found: {}", from))
                    })?;
                root.set_path(&segments, value, true)
            }
        }
    }
}

/// Encodes a patch list as the JSON payload of an `api.request` event.
pub fn encode_patches(patches: &[PatchData]) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(patches).map_err(|e| CoreError::Internal(format!("encode patches: {}", e)))
}

pub fn decode_patches(data: &[u8]) -> Result<Vec<PatchData>, CoreError> {
    serde_json::from_slice(data).map_err(|e| CoreError::InvalidParam(format!("decode patches: {}", e)))
}

/// One digital twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub owner: String,
    pub source: String,
    /// Strictly increases on every successful mutation.
    pub version: i64,
    /// Microseconds since the Unix epoch of the last mutation.
    pub last_time: i64,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyNode>,
    /// Opaque JSON schema blob; patched as JSON, stored as bytes.
    #[serde(default)]
    pub config_file: Vec<u8>,
}

impl Entity {
    pub fn get_prop(&self, key: &str) -> Option<&PropertyNode> {
        self.properties.get(key)
    }

    /// Mark a successful mutation: bump the version and stamp the clock.
    pub fn touch(&mut self) {
        self.version += 1;
        self.last_time = utils::unix_micros();
    }

    /// The properties map as a single tree node, for patching and mapping.
    pub fn properties_root(&self) -> PropertyNode {
        PropertyNode::Map(self.properties.clone())
    }

    pub fn set_properties_root(&mut self, root: PropertyNode) -> Result<(), CoreError> {
        match root {
            PropertyNode::Map(m) => {
                self.properties = m;
                Ok(())
            }
            _ => Err(CoreError::Internal("properties root must be a map".into())),
        }
    }
}

/// MessagePack entity codec, used for KV snapshots and `api.request`
/// payloads. Field names are encoded as strings so a snapshot written by any
/// node decodes identically on every other node.
pub fn encode_entity(entity: &Entity) -> Result<Vec<u8>, CoreError> {
    rmp_serde::to_vec_named(entity).map_err(|e| CoreError::Internal(format!("encode entity: {}", e)))
}

pub fn decode_entity(data: &[u8]) -> Result<Entity, CoreError> {
    rmp_serde::from_slice(data).map_err(|e| CoreError::InvalidParam(format!("decode entity: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entity() -> Entity {
        let mut properties = BTreeMap::new();
        properties.insert("temp".to_string(), PropertyNode::Float(21.5));
        properties.insert("on".to_string(), PropertyNode::Bool(true));
        properties.insert(
            "meta".to_string(),
            PropertyNode::Map(BTreeMap::from([
                ("unit".to_string(), PropertyNode::String("C".to_string())),
                (
                    "range".to_string(),
                    PropertyNode::List(vec![PropertyNode::Int(-40), PropertyNode::Int(85)]),
                ),
            ])),
        );
        Entity {
            id: "device123".into(),
            entity_type: "device".into(),
            owner: "admin".into(),
            source: "dm".into(),
            version: 3,
            last_time: 1_700_000_000_000_000,
            template_id: String::new(),
            properties,
            config_file: br#"{"temp":{"type":"float"}}"#.to_vec(),
        }
    }

    #[test]
    fn msgpack_roundtrip_is_identity() {
        let entity = sample_entity();
        let bytes = encode_entity(&entity).unwrap();
        let back = decode_entity(&bytes).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn json_value_conversion_roundtrip() {
        let json: serde_json::Value =
            serde_json::json!({"a": 1, "b": [true, "x", 2.5], "c": {"d": null}});
        let node = PropertyNode::from(json.clone());
        assert_eq!(serde_json::Value::from(&node), json);
    }

    #[test]
    fn path_segments_both_forms() {
        assert_eq!(path_segments("/x/y").unwrap(), vec!["x", "y"]);
        assert_eq!(path_segments("x.y").unwrap(), vec!["x", "y"]);
        assert!(path_segments("/x//y").is_err());
        assert!(path_segments("").is_err());
    }

    #[test]
    fn patch_replace_requires_existing_path() {
        let mut root = sample_entity().properties_root();
        let patch = PatchData {
            op: PatchOp::Replace,
            path: "/nope".into(),
            value: Some(PropertyNode::Int(1)),
            from: None,
        };
        assert!(patch.apply(&mut root).is_err());

        let ok = PatchData {
            op: PatchOp::Replace,
            path: "/temp".into(),
            value: Some(PropertyNode::Float(25.0)),
            from: None,
        };
        ok.apply(&mut root).unwrap();
        assert_eq!(
            root.get_path(&["temp"]),
            Some(&PropertyNode::Float(25.0))
        );
    }

    #[test]
    fn patch_add_creates_intermediate_maps() {
        let mut root = PropertyNode::map();
        let patch = PatchData {
            op: PatchOp::Add,
            path: "/a/b/c".into(),
            value: Some(PropertyNode::Int(9)),
            from: None,
        };
        patch.apply(&mut root).unwrap();
        assert_eq!(root.get_path(&["a", "b", "c"]), Some(&PropertyNode::Int(9)));
    }

    #[test]
    fn patch_remove_missing_path_fails() {
        let mut root = sample_entity().properties_root();
        let patch = PatchData {
            op: PatchOp::Remove,
            path: "/ghost".into(),
            value: None,
            from: None,
        };
        assert!(patch.apply(&mut root).is_err());

        let ok = PatchData {
            op: PatchOp::Remove,
            path: "/meta/unit".into(),
            value: None,
            from: None,
        };
        ok.apply(&mut root).unwrap();
        assert!(root.get_path(&["meta", "unit"]).is_none());
    }

    #[test]
    fn patch_copy_requires_source() {
        let mut root = sample_entity().properties_root();
        let missing_from = PatchData {
            op: PatchOp::Copy,
            path: "/copy".into(),
            value: None,
            from: None,
        };
        assert!(missing_from.apply(&mut root).is_err());

        let ok = PatchData {
            op: PatchOp::Copy,
            path: "/backup_temp".into(),
            value: None,
            from: Some("/temp".into()),
        };
        ok.apply(&mut root).unwrap();
        assert_eq!(
            root.get_path(&["backup_temp"]),
            Some(&PropertyNode::Float(21.5))
        );
    }

    #[test]
    fn patches_wire_roundtrip() {
        let patches = vec![
            PatchData {
                op: PatchOp::Replace,
                path: "/x".into(),
                value: Some(PropertyNode::Int(2)),
                from: None,
            },
            PatchData {
                op: PatchOp::Copy,
                path: "/y".into(),
                value: None,
                from: Some("/x".into()),
            },
        ];
        let bytes = encode_patches(&patches).unwrap();
        assert_eq!(decode_patches(&bytes).unwrap(), patches);
    }

    #[test]
    fn list_index_access() {
        let root = sample_entity().properties_root();
        assert_eq!(
            root.get_path(&["meta", "range", "1"]),
            Some(&PropertyNode::Int(85))
        );
    }

    #[test]
    fn touch_is_strictly_monotone() {
        let mut entity = sample_entity();
        let v = entity.version;
        entity.touch();
        entity.touch();
        assert_eq!(entity.version, v + 2);
    }
}

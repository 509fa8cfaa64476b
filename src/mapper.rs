//! Mappers: declarative TQL derivation rules and the tentacle activation
//! index.
//!
//! The runtime only depends on the TQL contract (parse, target, sources,
//! eval) and on the index that tells it which mappers care about a changed
//! property path. The grammar implemented here is the `insert into ... select
//! ...` core:
//!
//! ```text
//! insert into device123 select device234.temp as temperature, device234.meta.unit
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::entity::PropertyNode;
use crate::errors::CoreError;

/// A parsed TQL rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tql {
    text: String,
    target: String,
    selects: Vec<SelectItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectItem {
    entity: String,
    path: String,
    alias: String,
}

impl Tql {
    /// Parse TQL text. Errors are ordinary values; nothing in here panics.
    pub fn parse(text: &str) -> Result<Tql, CoreError> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let lower: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();

        if lower.len() < 4 || lower[0] != "insert" || lower[1] != "into" {
            return Err(CoreError::InvalidParam(format!(
                "TQL must start with 'insert into <target>': {:?}",
                text
            )));
        }
        let target = tokens[2].to_string();
        if lower[3] != "select" {
            return Err(CoreError::InvalidParam(format!(
                "TQL missing 'select' clause: {:?}",
                text
            )));
        }

        let select_text = tokens[4..].join(" ");
        if select_text.is_empty() {
            return Err(CoreError::InvalidParam("TQL select list is empty".into()));
        }

        let mut selects = Vec::new();
        for item_text in select_text.split(',') {
            selects.push(Self::parse_select_item(item_text.trim())?);
        }

        Ok(Tql {
            text: text.to_string(),
            target,
            selects,
        })
    }

    fn parse_select_item(item: &str) -> Result<SelectItem, CoreError> {
        if item.is_empty() {
            return Err(CoreError::InvalidParam("empty TQL select item".into()));
        }
        let parts: Vec<&str> = item.split_whitespace().collect();
        let (source, alias) = match parts.len() {
            1 => (parts[0], None),
            3 if parts[1].eq_ignore_ascii_case("as") => (parts[0], Some(parts[2])),
            _ => {
                return Err(CoreError::InvalidParam(format!(
                    "malformed TQL select item: {:?}",
                    item
                )))
            }
        };
        let (entity, path) = source.split_once('.').ok_or_else(|| {
            CoreError::InvalidParam(format!(
                "TQL select source must be <entity>.<path>: {:?}",
                source
            ))
        })?;
        if entity.is_empty() || path.is_empty() {
            return Err(CoreError::InvalidParam(format!(
                "TQL select source must be <entity>.<path>: {:?}",
                source
            )));
        }
        Ok(SelectItem {
            entity: entity.to_string(),
            path: path.to_string(),
            alias: alias.unwrap_or(path).to_string(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The entity this rule writes into.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Source property references as `entity_id.path` keys.
    pub fn sources(&self) -> BTreeSet<String> {
        self.selects
            .iter()
            .map(|s| format!("{}.{}", s.entity, s.path))
            .collect()
    }

    /// Evaluate against resolved inputs (`entity_id.path` -> value). Inputs
    /// that are absent simply produce no output; eval never fails.
    pub fn eval(&self, inputs: &BTreeMap<String, PropertyNode>) -> BTreeMap<String, PropertyNode> {
        let mut outputs = BTreeMap::new();
        for item in &self.selects {
            let key = format!("{}.{}", item.entity, item.path);
            if let Some(value) = inputs.get(&key) {
                outputs.insert(item.alias.clone(), value.clone());
            }
        }
        outputs
    }
}

/// Persisted mapper record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Mapper {
    pub id: String,
    pub tql: String,
    pub name: String,
    pub entity_id: String,
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

/// A mapper record with its compiled TQL.
#[derive(Debug, Clone)]
pub struct MapperInstance {
    pub mapper: Mapper,
    pub tql: Tql,
}

impl MapperInstance {
    /// Compile a record: parse the TQL and enforce that it targets the
    /// mapper's own entity.
    pub fn compile(mapper: Mapper) -> Result<Self, CoreError> {
        let tql = Tql::parse(&mapper.tql)?;
        if tql.target() != mapper.entity_id {
            return Err(CoreError::InvalidParam(format!(
                "mapper {} targets {} but belongs to {}",
                mapper.id,
                tql.target(),
                mapper.entity_id
            )));
        }
        Ok(MapperInstance { mapper, tql })
    }
}

/// True when one dotted path is the other or a dot-boundary prefix of it, so
/// a change at `x` fires subscriptions on `x.y` and vice versa.
fn paths_overlap(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    long == short || (long.starts_with(short) && long.as_bytes()[short.len()] == b'.')
}

/// Source-path activation index. One tentacle = one `entity_id.path` entry
/// pointing at the mappers that read it.
#[derive(Debug, Default)]
pub struct TentacleIndex {
    mappers: HashMap<String, MapperInstance>,
    tentacles: HashMap<String, HashSet<String>>,
}

impl TentacleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a mapper; the TQL is re-parsed on every upsert so a
    /// text change re-derives the tentacles.
    pub fn upsert(&mut self, mapper: Mapper) -> Result<(), CoreError> {
        let instance = MapperInstance::compile(mapper)?;
        self.remove(&instance.mapper.id);
        for source in instance.tql.sources() {
            self.tentacles
                .entry(source)
                .or_default()
                .insert(instance.mapper.id.clone());
        }
        self.mappers.insert(instance.mapper.id.clone(), instance);
        Ok(())
    }

    pub fn remove(&mut self, mapper_id: &str) {
        if self.mappers.remove(mapper_id).is_some() {
            self.tentacles.retain(|_, ids| {
                ids.remove(mapper_id);
                !ids.is_empty()
            });
        }
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// Mappers whose source set intersects the changed paths of `entity_id`.
    pub fn mappers_for(&self, entity_id: &str, changed: &[String]) -> Vec<&MapperInstance> {
        let mut hit: BTreeSet<&str> = BTreeSet::new();
        for (source, ids) in &self.tentacles {
            let Some((src_entity, src_path)) = source.split_once('.') else {
                continue;
            };
            if src_entity != entity_id {
                continue;
            }
            if changed.iter().any(|path| paths_overlap(src_path, path)) {
                hit.extend(ids.iter().map(String::as_str));
            }
        }
        hit.iter()
            .filter_map(|id| self.mappers.get(*id))
            .collect()
    }
}

/// Subscription fan-out modes.
pub const SUBSCRIPTION_MODE_REALTIME: &str = "realtime";
pub const SUBSCRIPTION_MODE_ON_CHANGE: &str = "onChange";
pub const SUBSCRIPTION_MODE_PERIODIC: &str = "periodic";

/// Event fan-out rule carried in a subscription entity's properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Subscription {
    pub mode: String,
    pub topic: String,
    pub filter: String,
    pub pubsub_name: String,
    pub source: String,
}

impl Subscription {
    /// Extract a subscription from entity properties (`mode`, `topic`,
    /// `filter`, `pubsub_name` keys).
    pub fn from_properties(
        properties: &BTreeMap<String, PropertyNode>,
        source: &str,
    ) -> Subscription {
        let field = |key: &str| {
            properties
                .get(key)
                .map(PropertyNode::as_str)
                .unwrap_or_default()
        };
        Subscription {
            mode: field("mode"),
            topic: field("topic"),
            filter: field("filter"),
            pubsub_name: field("pubsub_name"),
            source: source.to_string(),
        }
    }

    /// All five fields non-empty, a known mode, and a parseable filter.
    pub fn check(&self) -> Result<(), CoreError> {
        let known_mode = matches!(
            self.mode.as_str(),
            SUBSCRIPTION_MODE_REALTIME | SUBSCRIPTION_MODE_ON_CHANGE | SUBSCRIPTION_MODE_PERIODIC
        );
        if !known_mode
            || self.topic.is_empty()
            || self.filter.is_empty()
            || self.pubsub_name.is_empty()
            || self.source.is_empty()
        {
            return Err(CoreError::InvalidParam(format!(
                "invalid subscription: mode={:?} topic={:?} pubsub={:?} source={:?}",
                self.mode, self.topic, self.pubsub_name, self.source
            )));
        }
        Tql::parse(&self.filter)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_select() {
        let tql = Tql::parse("insert into device123 select device234.temp as temperature").unwrap();
        assert_eq!(tql.target(), "device123");
        assert_eq!(
            tql.sources(),
            BTreeSet::from(["device234.temp".to_string()])
        );
    }

    #[test]
    fn parse_multi_select_with_nested_paths() {
        let tql = Tql::parse(
            "insert into t select a.temp as temperature, b.meta.unit, a.on as powered",
        )
        .unwrap();
        assert_eq!(tql.sources().len(), 3);
        assert!(tql.sources().contains("b.meta.unit"));
    }

    #[test]
    fn parse_rejects_malformed_text() {
        assert!(Tql::parse("").is_err());
        assert!(Tql::parse("select a.b").is_err());
        assert!(Tql::parse("insert into t").is_err());
        assert!(Tql::parse("insert into t select").is_err());
        assert!(Tql::parse("insert into t select noentitypath").is_err());
        assert!(Tql::parse("insert into t select a.b as").is_err());
    }

    #[test]
    fn eval_maps_aliases() {
        let tql = Tql::parse("insert into t select a.temp as temperature, a.on").unwrap();
        let inputs = BTreeMap::from([
            ("a.temp".to_string(), PropertyNode::Float(20.5)),
            ("a.on".to_string(), PropertyNode::Bool(true)),
        ]);
        let out = tql.eval(&inputs);
        assert_eq!(out.get("temperature"), Some(&PropertyNode::Float(20.5)));
        assert_eq!(out.get("on"), Some(&PropertyNode::Bool(true)));
    }

    #[test]
    fn eval_skips_missing_inputs() {
        let tql = Tql::parse("insert into t select a.temp as temperature").unwrap();
        assert!(tql.eval(&BTreeMap::new()).is_empty());
    }

    fn mapper(id: &str, entity_id: &str, tql: &str) -> Mapper {
        Mapper {
            id: id.to_string(),
            tql: tql.to_string(),
            name: id.to_string(),
            entity_id: entity_id.to_string(),
            entity_type: "device".to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn compile_enforces_target() {
        let bad = mapper("m1", "other", "insert into t select a.b");
        assert!(MapperInstance::compile(bad).is_err());
        let good = mapper("m1", "t", "insert into t select a.b");
        assert!(MapperInstance::compile(good).is_ok());
    }

    #[test]
    fn index_fires_only_dependent_mappers() {
        let mut index = TentacleIndex::new();
        index
            .upsert(mapper("m1", "t1", "insert into t1 select dev.temp as temperature"))
            .unwrap();
        index
            .upsert(mapper("m2", "t2", "insert into t2 select dev.on as powered"))
            .unwrap();
        index
            .upsert(mapper("m3", "t3", "insert into t3 select other.temp as x"))
            .unwrap();

        let fired = index.mappers_for("dev", &["temp".to_string()]);
        let ids: Vec<&str> = fired.iter().map(|m| m.mapper.id.as_str()).collect();
        assert_eq!(ids, vec!["m1"]);

        assert!(index.mappers_for("dev", &["humidity".to_string()]).is_empty());
        assert!(index.mappers_for("nobody", &["temp".to_string()]).is_empty());
    }

    #[test]
    fn index_matches_path_prefixes_on_dot_boundary() {
        let mut index = TentacleIndex::new();
        index
            .upsert(mapper("m1", "t1", "insert into t1 select dev.meta.unit as u"))
            .unwrap();

        // A change to the whole subtree fires the nested source.
        assert_eq!(index.mappers_for("dev", &["meta".to_string()]).len(), 1);
        // A deeper change fires it too.
        assert_eq!(
            index
                .mappers_for("dev", &["meta.unit.suffix".to_string()])
                .len(),
            1
        );
        // `metal` is not `meta`.
        assert!(index.mappers_for("dev", &["metal".to_string()]).is_empty());
    }

    #[test]
    fn upsert_reparses_and_replaces_tentacles() {
        let mut index = TentacleIndex::new();
        index
            .upsert(mapper("m1", "t1", "insert into t1 select dev.temp as x"))
            .unwrap();
        index
            .upsert(mapper("m1", "t1", "insert into t1 select dev.on as x"))
            .unwrap();
        assert!(index.mappers_for("dev", &["temp".to_string()]).is_empty());
        assert_eq!(index.mappers_for("dev", &["on".to_string()]).len(), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_clears_tentacles() {
        let mut index = TentacleIndex::new();
        index
            .upsert(mapper("m1", "t1", "insert into t1 select dev.temp as x"))
            .unwrap();
        index.remove("m1");
        assert!(index.is_empty());
        assert!(index.mappers_for("dev", &["temp".to_string()]).is_empty());
    }

    #[test]
    fn subscription_check() {
        let good = Subscription {
            mode: SUBSCRIPTION_MODE_REALTIME.into(),
            topic: "events".into(),
            filter: "insert into sub1 select dev.temp".into(),
            pubsub_name: "loopback".into(),
            source: "dm".into(),
        };
        assert!(good.check().is_ok());

        let mut bad_mode = good.clone();
        bad_mode.mode = "sometimes".into();
        assert!(bad_mode.check().is_err());

        let mut empty_topic = good.clone();
        empty_topic.topic.clear();
        assert!(empty_topic.check().is_err());

        let mut bad_filter = good;
        bad_filter.filter = "not tql".into();
        assert!(bad_filter.check().is_err());
    }

    #[test]
    fn subscription_from_properties() {
        let props = BTreeMap::from([
            ("mode".to_string(), PropertyNode::String("realtime".into())),
            ("topic".to_string(), PropertyNode::String("t".into())),
            (
                "filter".to_string(),
                PropertyNode::String("insert into s select d.x".into()),
            ),
            (
                "pubsub_name".to_string(),
                PropertyNode::String("loopback".into()),
            ),
        ]);
        let sub = Subscription::from_properties(&props, "dm");
        assert_eq!(sub.mode, "realtime");
        assert_eq!(sub.source, "dm");
        assert!(sub.check().is_ok());
    }
}

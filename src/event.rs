//! CloudEvents-compatible event envelope.
//!
//! Everything that moves through a queue is one of these. API calls become
//! `api.request` events; runtime-derived updates (mapper outputs) are
//! `core.event.Entity` events. The extension attributes carry routing and
//! correlation state; the payload is either a MessagePack entity snapshot or
//! a JSON patch list, as declared by `apiidentify`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::CoreError;
use crate::utils;

pub const EVENT_TYPE_API_REQUEST: &str = "api.request";
pub const EVENT_TYPE_ENTITY: &str = "core.event.Entity";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Sender attribute stamped on all APIManager-born events.
pub const SENDER_API_MANAGER: &str = "Core.APIManager";

/// The closed set of API operations an `api.request` event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiIdentify {
    CreateEntity,
    UpdateEntity,
    GetEntity,
    DeleteEntity,
    UpdateEntityProps,
    PatchEntityProps,
    UpdateEntityConfigs,
    PatchEntityConfigs,
}

impl ApiIdentify {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiIdentify::CreateEntity => "APICreateEntity",
            ApiIdentify::UpdateEntity => "APIUpdateEntity",
            ApiIdentify::GetEntity => "APIGetEntity",
            ApiIdentify::DeleteEntity => "APIDeleteEntity",
            ApiIdentify::UpdateEntityProps => "APIUpdateEntityProps",
            ApiIdentify::PatchEntityProps => "APIPatchEntityProps",
            ApiIdentify::UpdateEntityConfigs => "APIUpdateEntityConfigs",
            ApiIdentify::PatchEntityConfigs => "APIPatchEntityConfigs",
        }
    }

    /// True when the payload is a patch list rather than an entity snapshot.
    pub fn carries_patches(&self) -> bool {
        matches!(
            self,
            ApiIdentify::PatchEntityProps | ApiIdentify::PatchEntityConfigs
        )
    }
}

impl fmt::Display for ApiIdentify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiIdentify {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "APICreateEntity" => ApiIdentify::CreateEntity,
            "APIUpdateEntity" => ApiIdentify::UpdateEntity,
            "APIGetEntity" => ApiIdentify::GetEntity,
            "APIDeleteEntity" => ApiIdentify::DeleteEntity,
            "APIUpdateEntityProps" => ApiIdentify::UpdateEntityProps,
            "APIPatchEntityProps" => ApiIdentify::PatchEntityProps,
            "APIUpdateEntityConfigs" => ApiIdentify::UpdateEntityConfigs,
            "APIPatchEntityConfigs" => ApiIdentify::PatchEntityConfigs,
            other => {
                return Err(CoreError::InvalidParam(format!(
                    "unknown api identify: {}",
                    other
                )))
            }
        })
    }
}

/// The event envelope. Extension attribute names follow CloudEvents 1.0
/// (lowercase, no separators).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub datacontenttype: String,

    // -- extensions --
    #[serde(default)]
    pub entityid: String,
    #[serde(default)]
    pub entitytype: String,
    #[serde(default)]
    pub entityowner: String,
    #[serde(default)]
    pub entitysource: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub callback: String,
    #[serde(default)]
    pub apirequestid: String,
    #[serde(default)]
    pub apiidentify: String,
    #[serde(default)]
    pub templateid: String,

    /// MessagePack entity snapshot or JSON patch list.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Event {
    /// A fresh event with a generated id and JSON content type.
    pub fn new(event_type: &str, source: &str) -> Self {
        Event {
            id: utils::uuid(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            datacontenttype: CONTENT_TYPE_JSON.to_string(),
            ..Event::default()
        }
    }

    /// Required-attribute check before an event enters a queue.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.is_empty() {
            return Err(CoreError::InvalidParam("event id is empty".into()));
        }
        if self.entityid.is_empty() {
            return Err(CoreError::InvalidParam("event entityid is empty".into()));
        }
        if self.event_type.is_empty() {
            return Err(CoreError::InvalidParam("event type is empty".into()));
        }
        Ok(())
    }

    pub fn identify(&self) -> Result<ApiIdentify, CoreError> {
        self.apiidentify.parse()
    }

    /// JSON wire encoding used by the pub/sub drivers.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(|e| CoreError::Internal(format!("encode event: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CoreError::InvalidParam(format!("decode event: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_identify_roundtrip() {
        let all = [
            ApiIdentify::CreateEntity,
            ApiIdentify::UpdateEntity,
            ApiIdentify::GetEntity,
            ApiIdentify::DeleteEntity,
            ApiIdentify::UpdateEntityProps,
            ApiIdentify::PatchEntityProps,
            ApiIdentify::UpdateEntityConfigs,
            ApiIdentify::PatchEntityConfigs,
        ];
        for identify in all {
            assert_eq!(identify.as_str().parse::<ApiIdentify>().unwrap(), identify);
        }
        assert!("APIDoSomething".parse::<ApiIdentify>().is_err());
    }

    #[test]
    fn patch_identifies_carry_patches() {
        assert!(ApiIdentify::PatchEntityProps.carries_patches());
        assert!(ApiIdentify::PatchEntityConfigs.carries_patches());
        assert!(!ApiIdentify::CreateEntity.carries_patches());
    }

    #[test]
    fn event_wire_roundtrip() {
        let mut ev = Event::new(EVENT_TYPE_API_REQUEST, "dm");
        ev.entityid = "e1".into();
        ev.entitytype = "device".into();
        ev.apiidentify = ApiIdentify::CreateEntity.as_str().into();
        ev.apirequestid = "req-1".into();
        ev.callback = "http://127.0.0.1:6789/v1/respond".into();
        ev.data = vec![1, 2, 3];

        let bytes = ev.encode().unwrap();
        assert_eq!(Event::decode(&bytes).unwrap(), ev);
    }

    #[test]
    fn validate_requires_id_and_entity() {
        let mut ev = Event::new(EVENT_TYPE_API_REQUEST, "dm");
        assert!(ev.validate().is_err());
        ev.entityid = "e1".into();
        assert!(ev.validate().is_ok());
        ev.id.clear();
        assert!(ev.validate().is_err());
    }

    #[test]
    fn decode_garbage_is_invalid_param() {
        assert!(matches!(
            Event::decode(b"not json"),
            Err(CoreError::InvalidParam(_))
        ));
    }
}

//! Placement state machine: the replicated table of cluster membership,
//! per-entity location entries and the consistent-hash ring.
//!
//! Commands are a tagged sum type. On the wire each committed log entry is a
//! single tag byte followed by the MessagePack-encoded payload; decoding an
//! unknown tag or a bad payload is a soft failure: the entry is logged and
//! skipped, never panicked on, so one malformed proposal cannot take down the
//! ensemble.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::CoreError;
use crate::ring::{HashRing, Host};

/// Per-entity location record. Overwritten only by a same-or-higher version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlacementState {
    pub id: String,
    pub host: String,
    pub version: i64,
}

/// Single-byte wire tags. `TableDisseminate` is reserved for the ring
/// broadcast loop and currently applies as a no-op.
pub const CMD_MEMBER_UPSERT: u8 = 0;
pub const CMD_MEMBER_REMOVE: u8 = 1;
pub const CMD_MASTER_UPSERT: u8 = 2;
pub const CMD_STATE_UPSERT: u8 = 3;
pub const CMD_STATE_REMOVE: u8 = 4;
pub const CMD_TABLE_DISSEMINATE: u8 = 100;

/// A committed placement command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlacementCommand {
    MemberUpsert(Host),
    MemberRemove(String),
    MasterUpsert(Host),
    StateUpsert(PlacementState),
    StateRemove(String),
    TableDisseminate,
}

impl PlacementCommand {
    pub fn tag(&self) -> u8 {
        match self {
            PlacementCommand::MemberUpsert(_) => CMD_MEMBER_UPSERT,
            PlacementCommand::MemberRemove(_) => CMD_MEMBER_REMOVE,
            PlacementCommand::MasterUpsert(_) => CMD_MASTER_UPSERT,
            PlacementCommand::StateUpsert(_) => CMD_STATE_UPSERT,
            PlacementCommand::StateRemove(_) => CMD_STATE_REMOVE,
            PlacementCommand::TableDisseminate => CMD_TABLE_DISSEMINATE,
        }
    }

    /// Metric label for the proposal counter.
    pub fn name(&self) -> &'static str {
        match self {
            PlacementCommand::MemberUpsert(_) => "member_upsert",
            PlacementCommand::MemberRemove(_) => "member_remove",
            PlacementCommand::MasterUpsert(_) => "master_upsert",
            PlacementCommand::StateUpsert(_) => "state_upsert",
            PlacementCommand::StateRemove(_) => "state_remove",
            PlacementCommand::TableDisseminate => "table_disseminate",
        }
    }

    /// `[tag byte] ++ rmp(payload)`.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let payload = match self {
            PlacementCommand::MemberUpsert(host) | PlacementCommand::MasterUpsert(host) => {
                rmp_serde::to_vec_named(host)
            }
            PlacementCommand::MemberRemove(name) | PlacementCommand::StateRemove(name) => {
                rmp_serde::to_vec_named(name)
            }
            PlacementCommand::StateUpsert(state) => rmp_serde::to_vec_named(state),
            PlacementCommand::TableDisseminate => rmp_serde::to_vec_named(&()),
        }
        .map_err(|e| CoreError::Internal(format!("encode placement command: {}", e)))?;

        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(self.tag());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| CoreError::InvalidParam("empty placement command".into()))?;
        let bad = |e: rmp_serde::decode::Error| {
            CoreError::InvalidParam(format!("placement command payload: {}", e))
        };
        Ok(match tag {
            CMD_MEMBER_UPSERT => {
                PlacementCommand::MemberUpsert(rmp_serde::from_slice(payload).map_err(bad)?)
            }
            CMD_MEMBER_REMOVE => {
                PlacementCommand::MemberRemove(rmp_serde::from_slice(payload).map_err(bad)?)
            }
            CMD_MASTER_UPSERT => {
                PlacementCommand::MasterUpsert(rmp_serde::from_slice(payload).map_err(bad)?)
            }
            CMD_STATE_UPSERT => {
                PlacementCommand::StateUpsert(rmp_serde::from_slice(payload).map_err(bad)?)
            }
            CMD_STATE_REMOVE => {
                PlacementCommand::StateRemove(rmp_serde::from_slice(payload).map_err(bad)?)
            }
            CMD_TABLE_DISSEMINATE => PlacementCommand::TableDisseminate,
            other => {
                return Err(CoreError::InvalidParam(format!(
                    "unknown placement command tag: {}",
                    other
                )))
            }
        })
    }
}

/// The replicated placement table. Lives behind an `RwLock` shared between
/// the raft apply path (writer) and the lookup/dispatch paths (readers).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementTable {
    pub states: HashMap<String, PlacementState>,
    pub master: Option<Host>,
    pub ring: HashRing,
}

impl PlacementTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed command. Returns whether the command changed the
    /// table; the result travels back to the proposer.
    pub fn apply(&mut self, cmd: PlacementCommand) -> bool {
        match cmd {
            PlacementCommand::MemberUpsert(host) => {
                self.ring.add(&host.name, &host.app_id, host.port)
            }
            PlacementCommand::MemberRemove(name) => self.ring.remove(&name),
            PlacementCommand::MasterUpsert(host) => {
                self.ring.add(&host.name, &host.app_id, host.port);
                self.master = Some(host);
                true
            }
            PlacementCommand::StateUpsert(state) => {
                match self.states.get(&state.id) {
                    Some(stored) if stored.version > state.version => false,
                    _ => {
                        self.states.insert(state.id.clone(), state);
                        true
                    }
                }
            }
            PlacementCommand::StateRemove(id) => self.states.remove(&id).is_some(),
            PlacementCommand::TableDisseminate => false,
        }
    }

    /// Apply a raw log entry. Malformed entries are logged and skipped.
    pub fn apply_bytes(&mut self, bytes: &[u8]) -> bool {
        match PlacementCommand::decode(bytes) {
            Ok(cmd) => self.apply(cmd),
            Err(e) => {
                warn!(error = %e, "skipping malformed placement log entry");
                false
            }
        }
    }

    /// Stored placement entry for `id`, if any.
    pub fn look_for(&self, id: &str) -> Option<PlacementState> {
        self.states.get(id).cloned()
    }

    /// Ring assignment for `id` (used by the leader for entities without a
    /// stored placement entry).
    pub fn get_host(&self, id: &str) -> Result<Host, CoreError> {
        self.ring.get_host(id).cloned()
    }

    /// Point-in-time copy for snapshotting. The raft layer may persist the
    /// copy concurrently with later applies.
    pub fn snapshot(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| CoreError::Internal(format!("snapshot placement table: {}", e)))
    }

    /// Restore from a snapshot, discarding all prior in-memory state.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        *self = rmp_serde::from_slice(bytes)
            .map_err(|e| CoreError::Internal(format!("restore placement table: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn host(name: &str) -> Host {
        Host {
            name: name.to_string(),
            app_id: format!("{}-app", name),
            port: 31000,
        }
    }

    #[test]
    fn command_wire_roundtrip() {
        let commands = vec![
            PlacementCommand::MemberUpsert(host("core-0")),
            PlacementCommand::MemberRemove("core-0".into()),
            PlacementCommand::MasterUpsert(host("core-1")),
            PlacementCommand::StateUpsert(PlacementState {
                id: "e1".into(),
                host: "core-0".into(),
                version: 7,
            }),
            PlacementCommand::StateRemove("e1".into()),
            PlacementCommand::TableDisseminate,
        ];
        for cmd in commands {
            let bytes = cmd.encode().unwrap();
            assert_eq!(bytes[0], cmd.tag());
            assert_eq!(PlacementCommand::decode(&bytes).unwrap(), cmd);
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(PlacementCommand::decode(&[42, 0, 0]).is_err());
        assert!(PlacementCommand::decode(&[]).is_err());
    }

    #[test]
    fn malformed_entry_is_skipped_not_fatal() {
        let mut table = PlacementTable::new();
        assert!(!table.apply_bytes(&[CMD_MEMBER_UPSERT, 0xc1, 0xc1]));
        assert!(!table.apply_bytes(&[42]));
    }

    #[test]
    fn state_upsert_respects_version() {
        let mut table = PlacementTable::new();
        let newer = PlacementState {
            id: "e1".into(),
            host: "core-1".into(),
            version: 5,
        };
        assert!(table.apply(PlacementCommand::StateUpsert(newer.clone())));

        // Older write loses.
        let older = PlacementState {
            id: "e1".into(),
            host: "core-0".into(),
            version: 3,
        };
        assert!(!table.apply(PlacementCommand::StateUpsert(older)));
        assert_eq!(table.look_for("e1").unwrap(), newer);

        // Equal version overwrites (owner re-reporting after restart).
        let equal = PlacementState {
            id: "e1".into(),
            host: "core-2".into(),
            version: 5,
        };
        assert!(table.apply(PlacementCommand::StateUpsert(equal.clone())));
        assert_eq!(table.look_for("e1").unwrap(), equal);
    }

    #[test]
    fn master_upsert_joins_ring() {
        let mut table = PlacementTable::new();
        table.apply(PlacementCommand::MasterUpsert(host("core-0")));
        assert_eq!(table.master.as_ref().unwrap().name, "core-0");
        assert!(table.ring.contains("core-0"));
        assert_eq!(table.get_host("any-id").unwrap().name, "core-0");
    }

    #[test]
    fn member_remove_excludes_host_from_lookup() {
        let mut table = PlacementTable::new();
        table.apply(PlacementCommand::MemberUpsert(host("core-0")));
        table.apply(PlacementCommand::MemberUpsert(host("core-1")));
        table.apply(PlacementCommand::MemberRemove("core-0".into()));
        for i in 0..50 {
            assert_eq!(table.get_host(&format!("id-{}", i)).unwrap().name, "core-1");
        }
    }

    #[test]
    fn replay_equals_live_state() {
        let log: Vec<PlacementCommand> = vec![
            PlacementCommand::MemberUpsert(host("core-0")),
            PlacementCommand::MasterUpsert(host("core-0")),
            PlacementCommand::MemberUpsert(host("core-1")),
            PlacementCommand::StateUpsert(PlacementState {
                id: "e1".into(),
                host: "core-1".into(),
                version: 1,
            }),
            PlacementCommand::StateUpsert(PlacementState {
                id: "e2".into(),
                host: "core-0".into(),
                version: 1,
            }),
            PlacementCommand::MemberRemove("core-1".into()),
            PlacementCommand::StateRemove("e1".into()),
        ];

        let mut live = PlacementTable::new();
        for cmd in &log {
            live.apply(cmd.clone());
        }

        let mut replayed = PlacementTable::new();
        for cmd in &log {
            replayed.apply_bytes(&cmd.encode().unwrap());
        }

        assert_eq!(live.states, replayed.states);
        assert_eq!(live.master, replayed.master);
        assert_eq!(
            live.get_host("probe").unwrap().name,
            replayed.get_host("probe").unwrap().name
        );
    }

    #[test]
    fn snapshot_restore_discards_prior_state() {
        let mut table = PlacementTable::new();
        table.apply(PlacementCommand::MemberUpsert(host("core-0")));
        table.apply(PlacementCommand::StateUpsert(PlacementState {
            id: "e1".into(),
            host: "core-0".into(),
            version: 2,
        }));
        let snap = table.snapshot().unwrap();

        let mut other = PlacementTable::new();
        other.apply(PlacementCommand::MemberUpsert(host("stale")));
        other.restore(&snap).unwrap();

        assert!(!other.ring.contains("stale"));
        assert_eq!(other.look_for("e1").unwrap().version, 2);
    }
}

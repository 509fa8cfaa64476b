//! Weighted consistent-hash ring over cluster members.
//!
//! The ring is part of the replicated placement state: every node applies the
//! same membership commands in raft log order, so every node computes the
//! identical `id -> host` assignment. The hash function is therefore fixed
//! (SHA-256 truncated to 8 bytes) rather than the std hasher, whose output is
//! not stable across releases.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CoreError;

/// Virtual nodes per host. Fixed cluster-wide; changing it is a breaking
/// membership-protocol change.
pub const VIRTUAL_REPLICAS: usize = 100;

/// One cluster member as seen by the ring and the placement table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Host {
    pub name: String,
    pub app_id: String,
    pub port: u32,
}

/// Consistent-hash ring keyed on `Host::name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
    hosts: HashMap<String, Host>,
}

/// First 8 bytes of SHA-256, big-endian. Also used to derive raft node ids
/// from host names, so it must stay stable across releases and platforms.
pub fn stable_hash64(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 yields 32 bytes"))
}

fn ring_hash(key: &str) -> u64 {
    stable_hash64(key)
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a host. Returns true iff the membership set changed
    /// (new host, or an existing host re-registered with different identity).
    pub fn add(&mut self, name: &str, app_id: &str, port: u32) -> bool {
        let host = Host {
            name: name.to_string(),
            app_id: app_id.to_string(),
            port,
        };
        if self.hosts.get(name) == Some(&host) {
            return false;
        }
        let existed = self.hosts.insert(name.to_string(), host).is_some();
        if !existed {
            for replica in 0..VIRTUAL_REPLICAS {
                let point = ring_hash(&format!("{}#{}", name, replica));
                // Hash collisions between hosts are broken towards the
                // lexicographically smaller name so the outcome does not
                // depend on insertion order.
                match self.ring.get(&point) {
                    Some(current) if current.as_str() <= name => {}
                    _ => {
                        self.ring.insert(point, name.to_string());
                    }
                }
            }
        }
        true
    }

    /// Remove a host. Idempotent; returns true iff the host was present.
    pub fn remove(&mut self, name: &str) -> bool {
        if self.hosts.remove(name).is_none() {
            return false;
        }
        self.ring.retain(|_, owner| owner != name);
        // Re-insert points that the removed host had shadowed on collision.
        let names: Vec<String> = self.hosts.keys().cloned().collect();
        for other in names {
            for replica in 0..VIRTUAL_REPLICAS {
                let point = ring_hash(&format!("{}#{}", other, replica));
                match self.ring.get(&point) {
                    Some(current) if current.as_str() <= other.as_str() => {}
                    _ => {
                        self.ring.insert(point, other.clone());
                    }
                }
            }
        }
        true
    }

    /// Deterministically resolve the host owning `id`.
    pub fn get_host(&self, id: &str) -> Result<&Host, CoreError> {
        if self.hosts.is_empty() {
            return Err(CoreError::HostNotFound(id.to_string()));
        }
        let point = ring_hash(id);
        let owner = self
            .ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, name)| name)
            .ok_or_else(|| CoreError::HostNotFound(id.to_string()))?;
        self.hosts
            .get(owner)
            .ok_or_else(|| CoreError::HostNotFound(id.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hosts.contains_key(name)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(names: &[&str]) -> HashRing {
        let mut ring = HashRing::new();
        for (i, name) in names.iter().enumerate() {
            ring.add(name, &format!("app-{}", i), 31000);
        }
        ring
    }

    #[test]
    fn add_reports_membership_change() {
        let mut ring = HashRing::new();
        assert!(ring.add("core-0", "app", 31000));
        assert!(!ring.add("core-0", "app", 31000));
        // Same name, new port: membership changed.
        assert!(ring.add("core-0", "app", 32000));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut ring = ring_of(&["core-0", "core-1"]);
        assert!(ring.remove("core-0"));
        assert!(!ring.remove("core-0"));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn assignment_is_deterministic() {
        let a = ring_of(&["core-0", "core-1", "core-2"]);
        let b = ring_of(&["core-2", "core-0", "core-1"]); // different insert order
        for id in ["device-1", "device-2", "sensor/abc", ""] {
            assert_eq!(
                a.get_host(id).unwrap().name,
                b.get_host(id).unwrap().name,
                "id {:?} must map identically regardless of insertion order",
                id
            );
        }
    }

    #[test]
    fn removal_reassigns_only_removed_ids() {
        let mut ring = ring_of(&["core-0", "core-1", "core-2"]);
        let ids: Vec<String> = (0..200).map(|i| format!("entity-{}", i)).collect();
        let before: Vec<String> = ids
            .iter()
            .map(|id| ring.get_host(id).unwrap().name.clone())
            .collect();

        ring.remove("core-1");

        for (id, owner) in ids.iter().zip(before.iter()) {
            let now = &ring.get_host(id).unwrap().name;
            if owner != "core-1" {
                assert_eq!(now, owner, "{} moved although its host survived", id);
            } else {
                assert_ne!(now, "core-1");
            }
        }
    }

    #[test]
    fn removed_host_never_returned() {
        let mut ring = ring_of(&["core-0", "core-1"]);
        ring.remove("core-0");
        for i in 0..100 {
            let owner = ring.get_host(&format!("id-{}", i)).unwrap();
            assert_eq!(owner.name, "core-1");
        }
    }

    #[test]
    fn empty_ring_is_host_not_found() {
        let ring = HashRing::new();
        assert!(matches!(
            ring.get_host("x"),
            Err(CoreError::HostNotFound(_))
        ));
    }
}

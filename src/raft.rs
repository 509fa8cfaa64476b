//! Raft consensus for the placement table.
//!
//! Each node embeds an `openraft` (0.9) instance; no external consensus
//! service. The application log entry is an already-encoded placement command
//! (`[tag byte] ++ msgpack payload`, see [`crate::fsm`]); the state machine
//! decodes and applies it to the shared [`PlacementTable`].
//!
//! ## Storage
//!
//! Uses openraft's `Adaptor` to bridge an in-memory combined `RaftStorage`
//! implementation (v1 API) into the v2 `RaftLogStorage` + `RaftStateMachine`
//! split interface required by `Raft::new`. FSM snapshots are additionally
//! persisted under `log_store_path` (last two retained); on startup the
//! newest one is restored into the placement table before the raft instance
//! comes up, so a restarted node does not lose the table.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialized and sent over the `Placement` gRPC service defined in
//! `proto/placement.proto`; the proto `payload: bytes` field carries the
//! serialized openraft payload.
//!
//! ## Implementation note on async traits
//!
//! openraft uses RPITIT (return-position impl Trait in Trait) rather than
//! `async_trait::async_trait`. Implementations of these traits must use plain
//! `async fn` — NOT `#[async_trait]` — to match the expected signature.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use openraft::error::{ClientWriteError, InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta, StorageError,
    StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::CoreError;
use crate::fsm::{PlacementCommand, PlacementTable};
use crate::metrics;
use crate::placement::proto::{placement_client::PlacementClient, RaftPayload};
use crate::ring::stable_hash64;

// ── Type configuration ─────────────────────────────────────────────────────────

/// Application log entry: one wire-encoded placement command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub data: Vec<u8>,
}

/// State machine response after applying a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub applied: bool,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = CommandRequest,
        R            = CommandResponse,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Client-side deadline for one proposal, log replication included.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

const SNAPSHOTS_RETAINED: usize = 2;

/// Derive a stable u64 node ID from the node's host name. Every node derives
/// the same id for the same peer, which is what lets the peer list in the
/// config double as the raft membership.
pub fn node_id_from_str(s: &str) -> u64 {
    stable_hash64(s)
}

// ── In-memory combined storage (openraft v1 RaftStorage) ─────────────────────

/// Combined in-memory raft storage: log entries + the placement state machine.
///
/// Wrapped by `openraft::storage::Adaptor::new(store)` to produce the v2
/// `(RaftLogStorage, RaftStateMachine)` split required by `Raft::new`.
pub struct MemStorage {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    /// The replicated placement table, shared with the placement service and
    /// the dispatcher. Writers hold the lock only for one apply.
    table: Arc<RwLock<PlacementTable>>,
    /// Directory for persisted snapshot files; `None` keeps snapshots purely
    /// in memory (tests).
    snapshot_dir: Option<PathBuf>,
}

impl MemStorage {
    pub fn new(table: Arc<RwLock<PlacementTable>>, snapshot_dir: Option<PathBuf>) -> Self {
        Self {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            table,
            snapshot_dir,
        }
    }
}

/// Snapshot files under `dir`, oldest first (modification time, then path).
fn snapshot_files(dir: &PathBuf) -> Vec<PathBuf> {
    let mut snapshots: Vec<(std::time::SystemTime, PathBuf)> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|x| x == "snap").unwrap_or(false))
                .map(|p| {
                    let modified = p
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(std::time::UNIX_EPOCH);
                    (modified, p)
                })
                .collect()
        })
        .unwrap_or_default();
    snapshots.sort();
    snapshots.into_iter().map(|(_, p)| p).collect()
}

/// Persist a snapshot file and drop all but the newest two.
fn persist_snapshot(dir: &PathBuf, snapshot_id: &str, data: &[u8]) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(error = %e, dir = %dir.display(), "cannot create snapshot directory");
        return;
    }
    let path = dir.join(format!("placement-{}.snap", snapshot_id));
    if let Err(e) = std::fs::write(&path, data) {
        warn!(error = %e, path = %path.display(), "cannot persist snapshot");
        return;
    }

    let mut snapshots = snapshot_files(dir);
    while snapshots.len() > SNAPSHOTS_RETAINED {
        let oldest = snapshots.remove(0);
        let _ = std::fs::remove_file(oldest);
    }
}

/// Restore the newest persisted snapshot into `table`. Returns whether a
/// snapshot was restored. Called once at startup, before the raft instance
/// exists; later log entries from the ensemble re-apply on top (member
/// upserts are idempotent and state upserts are version-guarded).
fn restore_latest_snapshot(table: &Arc<RwLock<PlacementTable>>, dir: &PathBuf) -> bool {
    let Some(newest) = snapshot_files(dir).pop() else {
        return false;
    };
    let data = match std::fs::read(&newest) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, path = %newest.display(), "cannot read persisted snapshot");
            return false;
        }
    };
    let mut table = table.write().expect("placement table lock");
    match table.restore(&data) {
        Ok(()) => {
            info!(path = %newest.display(), "placement table restored from snapshot");
            true
        }
        Err(e) => {
            warn!(error = %e, path = %newest.display(),
                "persisted snapshot undecodable, starting from an empty table");
            *table = PlacementTable::new();
            false
        }
    }
}

// RaftStorage v1 requires MemStorage to implement RaftLogReader directly
// (because RaftStorage: RaftLogReader). Plain async fn, no #[async_trait].
impl RaftLogReader<TypeConfig> for MemStorage {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader backed by a snapshot of the log at a point in time.
pub struct MemLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for MemLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder: serializes the placement table.
pub struct TableSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    table: Arc<RwLock<PlacementTable>>,
    snapshot_dir: Option<PathBuf>,
}

impl RaftSnapshotBuilder<TypeConfig> for TableSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        // Copy-on-snapshot: the table copy is taken under the read lock and
        // serialized after it is released, so applies keep flowing.
        let copy = self.table.read().expect("placement table lock").clone();
        let data = copy.snapshot().unwrap_or_default();

        let snapshot_id = self
            .last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "genesis".to_string());

        if let Some(dir) = &self.snapshot_dir {
            persist_snapshot(dir, &snapshot_id, &data);
        }

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// openraft v1 `RaftStorage` implementation for `MemStorage`.
impl RaftStorage<TypeConfig> for MemStorage {
    type LogReader = MemLogReader;
    type SnapshotBuilder = TableSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        MemLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    // ── State machine ─────────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<CommandResponse>, StorageError<NodeId>> {
        let mut responses = Vec::new();

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(CommandResponse { applied: false });
                }
                openraft::EntryPayload::Normal(req) => {
                    // Malformed commands are logged and skipped inside
                    // apply_bytes; an apply failure is never fatal.
                    let applied = self
                        .table
                        .write()
                        .expect("placement table lock")
                        .apply_bytes(&req.data);
                    responses.push(CommandResponse { applied });
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    responses.push(CommandResponse { applied: true });
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        TableSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            table: self.table.clone(),
            snapshot_dir: self.snapshot_dir.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();

        // Restore discards all prior in-memory state first.
        let mut table = self.table.write().expect("placement table lock");
        if let Err(e) = table.restore(snapshot.get_ref()) {
            warn!(error = %e, "failed to restore placement snapshot, resetting table");
            *table = PlacementTable::new();
        }
        drop(table);

        if let Some(dir) = &self.snapshot_dir {
            persist_snapshot(dir, &meta.snapshot_id, snapshot.get_ref());
        }
        Ok(())
    }

    /// Snapshots are rebuilt on demand from the live table rather than
    /// cached: the table always reflects `last_applied`, so the rebuild is
    /// exactly the snapshot a lagging follower needs.
    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        if self.last_applied.is_none() {
            return Ok(None);
        }
        let copy = self.table.read().expect("placement table lock").clone();
        let data = copy.snapshot().unwrap_or_default();
        let snapshot_id = self
            .last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "genesis".to_string());
        Ok(Some(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

// ── gRPC network transport ─────────────────────────────────────────────────────

/// Per-peer gRPC channel implementing openraft's `RaftNetwork`.
pub struct GrpcNetwork {
    target_addr: String,
    client: Option<PlacementClient<Channel>>,
}

impl GrpcNetwork {
    fn get_client(&mut self) -> Result<&mut PlacementClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            // connect_lazy() returns immediately without a blocking TCP
            // handshake; tonic dials on the first RPC and reconnects
            // automatically. The per-RPC timeout keeps heartbeats failing
            // fast instead of hanging into a follower's election timeout.
            let ch = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(PlacementClient::new(ch));
        }
        Ok(self.client.as_mut().expect("client set above"))
    }
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let term = rpc.vote.leader_id().term;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let resp = client
            .append_entries(RaftPayload { term, payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let term = rpc.vote.leader_id().term;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let resp = client
            .request_vote(RaftPayload { term, payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let term = rpc.vote.leader_id().term;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let resp = client
            .install_snapshot(RaftPayload { term, payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `GrpcNetwork` instances per target peer node.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        GrpcNetwork {
            target_addr: node.addr.clone(),
            client: None,
        }
    }
}

// ── RaftHandle public API ──────────────────────────────────────────────────────

/// A running raft node plus the shared placement table it replicates.
#[derive(Clone)]
pub struct RaftHandle {
    pub raft: Arc<RaftInstance>,
    pub node_id: NodeId,
    table: Arc<RwLock<PlacementTable>>,
    leader_rx: watch::Receiver<bool>,
}

impl RaftHandle {
    /// Returns true if this node is the current raft leader.
    pub fn is_leader(&self) -> bool {
        *self.leader_rx.borrow()
    }

    /// Fires on every leadership transition of this node.
    pub fn leader_watch(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    /// The replicated placement table. Readers take the lock briefly and
    /// never block an apply for long.
    pub fn table(&self) -> Arc<RwLock<PlacementTable>> {
        self.table.clone()
    }

    /// gRPC address of the current leader, resolved from the live raft
    /// membership.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader_id = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader_id)
            .map(|node| node.addr.clone())
    }

    /// Propose a placement command (leader only). Followers get `NotLeader`
    /// and are expected to retry after refreshing the leader address.
    pub async fn propose(&self, cmd: PlacementCommand) -> Result<bool, CoreError> {
        metrics::RAFT_PROPOSALS.with_label_values(&[cmd.name()]).inc();
        let data = cmd.encode()?;

        let write = self.raft.client_write(CommandRequest { data });
        let response: Result<
            ClientWriteResponse<TypeConfig>,
            RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>,
        > = tokio::time::timeout(COMMAND_TIMEOUT, write)
            .await
            .map_err(|_| CoreError::Timeout)?;

        match response {
            Ok(resp) => Ok(resp.data.applied),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(_))) => {
                Err(CoreError::NotLeader)
            }
            Err(e) => Err(CoreError::Unavailable(format!("raft apply: {}", e))),
        }
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Initializes and starts the raft node, returning a shared handle.
///
/// The peer list comes from `placement.raft.servers`; an empty list
/// bootstraps a single-node ensemble on the local placement port. Spawns a
/// background task watching `Raft::metrics()` that drives the leadership
/// watch channel.
pub async fn start_raft_node(
    config: &Config,
    table: Arc<RwLock<PlacementTable>>,
) -> Result<Arc<RaftHandle>, CoreError> {
    let this_node_id = node_id_from_str(&config.server.name);

    let mut peers: Vec<(NodeId, String)> = config
        .placement
        .raft
        .servers
        .iter()
        .map(|peer| (node_id_from_str(&peer.id), peer.addr.clone()))
        .collect();
    if peers.is_empty() {
        peers.push((
            this_node_id,
            format!("127.0.0.1:{}", config.placement.port),
        ));
    }

    let raft_config = Arc::new(
        openraft::Config {
            cluster_name: "twincore-placement".to_string(),
            heartbeat_interval: 500,
            election_timeout_min: 1_500,
            election_timeout_max: 3_000,
            ..Default::default()
        }
        .validate()
        .map_err(|e| CoreError::Internal(format!("invalid raft config: {}", e)))?,
    );

    let snapshot_dir = if config.placement.raft.log_store_path.is_empty() {
        None
    } else {
        Some(PathBuf::from(&config.placement.raft.log_store_path))
    };

    // Crash recovery: seed the table from the newest persisted snapshot
    // before the raft instance comes up. The raft log itself is in memory,
    // so without this a restarted single-node ensemble would start empty.
    if let Some(dir) = &snapshot_dir {
        restore_latest_snapshot(&table, dir);
    }

    let storage = MemStorage::new(table.clone(), snapshot_dir);
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = Arc::new(
        openraft::Raft::new(
            this_node_id,
            raft_config,
            GrpcNetworkFactory,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| CoreError::Internal(format!("create raft instance: {}", e)))?,
    );

    // The lowest-id member bootstraps the ensemble; the rest join via the
    // replicated membership.
    let members: BTreeMap<NodeId, BasicNode> = peers
        .iter()
        .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
        .collect();
    let min_id = peers.iter().map(|(id, _)| *id).min().unwrap_or(this_node_id);
    if this_node_id == min_id {
        if let Err(e) = raft.initialize(members).await {
            info!(error = %e, "raft already initialized (ignoring on restart)");
        }
    }

    let (leader_tx, leader_rx) = watch::channel(false);

    // Watch raft state → leadership channel.
    {
        let mut rx = raft.metrics();
        let node_name = config.server.name.clone();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let m = rx.borrow().clone();
                let is_leader = m.current_leader == Some(this_node_id);
                if *leader_tx.borrow() != is_leader {
                    info!(
                        node = %node_name,
                        node_id = this_node_id,
                        term = m.current_term,
                        leader = ?m.current_leader,
                        is_leader,
                        "raft leadership changed"
                    );
                    let _ = leader_tx.send(is_leader);
                }
            }
        });
    }

    info!(
        node_id = this_node_id,
        peers = peers.len(),
        "raft node started"
    );

    Ok(Arc::new(RaftHandle {
        raft,
        node_id: this_node_id,
        table,
        leader_rx,
    }))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

//! Placement service: the gRPC surface of the raft-replicated placement
//! table.
//!
//! - `LookFor` resolves the host owning an entity id. The stored entry wins;
//!   otherwise the leader answers from the consistent-hash ring and followers
//!   forward to the leader over a cached client connection.
//! - `ReportStatus` is the member → leader heartbeat stream. The first
//!   inbound message carries the member identity (`MemberUpsert`); subsequent
//!   messages carry owned entity states (`StateUpsert`). A graceful close
//!   emits `MemberRemove`; an abrupt close is left to the faulty-host
//!   detector so a network blip does not reshuffle the ring.
//! - The three raft transport RPCs carry openraft payloads between ensemble
//!   members.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::fsm::{PlacementCommand, PlacementState};
use crate::raft::{RaftHandle, TypeConfig};
use crate::ring::Host;
use crate::utils;

/// Generated protobuf types and gRPC service stubs for `Placement`.
pub mod proto {
    tonic::include_proto!("placement");
}

use proto::placement_client::PlacementClient;
use proto::placement_server::{Placement, PlacementServer};
use proto::{LookForReq, LookForResp, RaftPayload, ReportStatusReq, ReportStatusResp, State};

/// Interval of the leadership ticker and of member heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Entity states owned by the local runtimes, reported to the leader on
/// every heartbeat. Runtimes update it as entities are created, mutated and
/// deleted.
#[derive(Default)]
pub struct OwnedStates {
    states: DashMap<String, i64>,
}

impl OwnedStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, entity_id: &str, version: i64) {
        self.states.insert(entity_id.to_string(), version);
    }

    pub fn remove(&self, entity_id: &str) {
        self.states.remove(entity_id);
    }

    pub fn snapshot(&self) -> Vec<(String, i64)> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Server-side implementation of the `Placement` gRPC service.
#[derive(Clone)]
pub struct PlacementService {
    raft: Arc<RaftHandle>,
    host: Host,
    /// Host name → last heartbeat (µs). Only meaningful on the leader.
    heartbeats: Arc<DashMap<String, i64>>,
    /// Cached connection to the current leader, rebuilt on stream errors and
    /// leadership changes.
    leader_client: Arc<Mutex<Option<(String, PlacementClient<Channel>)>>>,
}

impl PlacementService {
    pub fn new(raft: Arc<RaftHandle>, host: Host) -> Self {
        Self {
            raft,
            host,
            heartbeats: Arc::new(DashMap::new()),
            leader_client: Arc::new(Mutex::new(None)),
        }
    }

    pub fn heartbeats(&self) -> Arc<DashMap<String, i64>> {
        self.heartbeats.clone()
    }

    async fn connect(addr: &str) -> Result<PlacementClient<Channel>, Status> {
        let uri = if addr.starts_with("http") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| Status::unavailable(format!("bad leader address: {}", e)))?
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(4))
            .connect_lazy();
        Ok(PlacementClient::new(channel))
    }

    /// Cached leader connection; `refresh` drops the cache first.
    async fn leader_client(&self, refresh: bool) -> Result<PlacementClient<Channel>, Status> {
        let addr = self
            .raft
            .leader_addr()
            .ok_or_else(|| Status::unavailable("no raft leader known"))?;

        let mut cached = self.leader_client.lock().await;
        if refresh {
            *cached = None;
        }
        if let Some((cached_addr, client)) = cached.as_ref() {
            if *cached_addr == addr {
                return Ok(client.clone());
            }
        }
        let client = Self::connect(&addr).await?;
        *cached = Some((addr, client.clone()));
        Ok(client)
    }

    /// Forward a lookup to the leader; one retry after refreshing the cached
    /// connection, then `Unavailable`.
    async fn forward_look_for(&self, req: LookForReq) -> Result<LookForResp, Status> {
        let mut last_err = Status::unavailable("leader unreachable");
        for refresh in [false, true] {
            let mut client = self.leader_client(refresh).await?;
            match client.look_for(req.clone()).await {
                Ok(resp) => return Ok(resp.into_inner()),
                Err(status) => {
                    debug!(error = %status, refresh, "forwarded lookup failed");
                    last_err = status;
                }
            }
        }
        Err(Status::unavailable(format!(
            "lookup forward failed: {}",
            last_err
        )))
    }

    async fn propose_logged(&self, cmd: PlacementCommand) {
        let name = cmd.name();
        if let Err(e) = self.raft.propose(cmd).await {
            warn!(command = name, error = %e, "placement proposal failed");
        }
    }
}

#[tonic::async_trait]
impl Placement for PlacementService {
    async fn look_for(
        &self,
        request: Request<LookForReq>,
    ) -> Result<Response<LookForResp>, Status> {
        let req = request.into_inner();
        if req.id.is_empty() {
            return Err(Status::invalid_argument("entity id is empty"));
        }

        // A stored placement entry wins on every node.
        let stored = {
            let table = self.raft.table();
            let table = table.read().expect("placement table lock");
            table.look_for(&req.id)
        };
        if let Some(state) = stored {
            return Ok(Response::new(LookForResp {
                state: Some(State {
                    id: state.id,
                    host: state.host,
                    version: state.version,
                }),
            }));
        }

        if self.raft.is_leader() {
            let host = {
                let table = self.raft.table();
                let table = table.read().expect("placement table lock");
                table.get_host(&req.id)
            };
            return match host {
                Ok(host) => Ok(Response::new(LookForResp {
                    state: Some(State {
                        id: req.id,
                        host: host.name,
                        version: 0,
                    }),
                })),
                Err(e) => Err(Status::not_found(e.to_string())),
            };
        }

        // Follower: forward to the leader.
        Ok(Response::new(self.forward_look_for(req).await?))
    }

    async fn report_status(
        &self,
        request: Request<Streaming<ReportStatusReq>>,
    ) -> Result<Response<ReportStatusResp>, Status> {
        if !self.raft.is_leader() {
            return Err(Status::failed_precondition(
                "only the leader serves report streams",
            ));
        }

        let mut stream = request.into_inner();
        let mut host_name = String::new();

        loop {
            // Leadership loss closes all server-side streams.
            if !self.raft.is_leader() {
                return Err(Status::failed_precondition("leadership lost"));
            }

            match stream.message().await {
                Ok(Some(req)) => {
                    if host_name.is_empty() {
                        host_name = req.name.clone();
                        info!(member = %host_name, "member joined report stream");
                        self.propose_logged(PlacementCommand::MemberUpsert(Host {
                            name: req.name.clone(),
                            app_id: req.id.clone(),
                            port: req.port,
                        }))
                        .await;
                    }

                    // The timestamp feeds the faulty-host detector.
                    self.heartbeats
                        .insert(req.name.clone(), utils::unix_micros());

                    for state in req.states {
                        self.propose_logged(PlacementCommand::StateUpsert(PlacementState {
                            id: state.id,
                            host: state.host,
                            version: state.version,
                        }))
                        .await;
                    }
                }
                Ok(None) => {
                    // Graceful close: the member said goodbye.
                    if !host_name.is_empty() {
                        info!(member = %host_name, "member left gracefully");
                        self.heartbeats.remove(&host_name);
                        self.propose_logged(PlacementCommand::MemberRemove(host_name.clone()))
                            .await;
                    }
                    return Ok(Response::new(ReportStatusResp {}));
                }
                Err(status) => {
                    if host_name.is_empty() {
                        warn!(error = %status, "stream dropped before member identified");
                    } else {
                        // Abrupt close: no ring change here. The faulty-host
                        // detector removes the member if it stays silent.
                        debug!(member = %host_name, error = %status,
                            "report stream dropped, leaving member to faulty detector");
                    }
                    return Ok(Response::new(ReportStatusResp {}));
                }
            }
        }
    }

    // ── Raft transport ────────────────────────────────────────────────────
    //
    // Each RPC deserializes the proto `payload` bytes back into the openraft
    // request type and forwards it to the local raft instance.

    async fn append_entries(
        &self,
        request: Request<RaftPayload>,
    ) -> Result<Response<RaftPayload>, Status> {
        let payload = request.into_inner().payload;
        let rpc: openraft::raft::AppendEntriesRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("decode AppendEntriesRequest: {}", e))
            })?;
        let term = rpc.vote.leader_id().term;

        let resp = self
            .raft
            .raft
            .append_entries(rpc)
            .await
            .map_err(|e| Status::internal(format!("raft AppendEntries: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("encode response: {}", e)))?;
        Ok(Response::new(RaftPayload { term, payload }))
    }

    async fn request_vote(
        &self,
        request: Request<RaftPayload>,
    ) -> Result<Response<RaftPayload>, Status> {
        let payload = request.into_inner().payload;
        let rpc: openraft::raft::VoteRequest<crate::raft::NodeId> =
            serde_json::from_slice(&payload)
                .map_err(|e| Status::invalid_argument(format!("decode VoteRequest: {}", e)))?;
        let term = rpc.vote.leader_id().term;

        let resp = self
            .raft
            .raft
            .vote(rpc)
            .await
            .map_err(|e| Status::internal(format!("raft Vote: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("encode response: {}", e)))?;
        Ok(Response::new(RaftPayload { term, payload }))
    }

    async fn install_snapshot(
        &self,
        request: Request<RaftPayload>,
    ) -> Result<Response<RaftPayload>, Status> {
        let payload = request.into_inner().payload;
        let rpc: openraft::raft::InstallSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("decode InstallSnapshotRequest: {}", e))
            })?;
        let term = rpc.vote.leader_id().term;

        let resp = self
            .raft
            .raft
            .install_snapshot(rpc)
            .await
            .map_err(|e| Status::internal(format!("raft InstallSnapshot: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("encode response: {}", e)))?;
        Ok(Response::new(RaftPayload { term, payload }))
    }
}

// ── Server startup ────────────────────────────────────────────────────────────

/// Starts the placement gRPC server. Runs until the process exits; spawn it.
pub async fn start_placement_server(service: PlacementService, port: u16) {
    let addr = match format!("0.0.0.0:{}", port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, port, "invalid placement listen address");
            return;
        }
    };

    info!(%addr, "placement gRPC server starting");
    if let Err(e) = Server::builder()
        .add_service(PlacementServer::new(service))
        .serve(addr)
        .await
    {
        error!(error = %e, "placement gRPC server error");
    }
}

// ── Leadership monitor ────────────────────────────────────────────────────────

/// Leader-side ticker: claims mastership on acquire and evicts members whose
/// last heartbeat is older than `faulty_duration`.
pub fn spawn_leadership_monitor(service: PlacementService, config: &Config) {
    let faulty_micros = (config.runtime.faulty_host_duration_secs as i64) * 1_000_000;

    tokio::spawn(async move {
        let mut was_leader = false;
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let is_leader = service.raft.is_leader();

            if is_leader && !was_leader {
                info!(host = %service.host.name, "leadership acquired, claiming mastership");
                service
                    .propose_logged(PlacementCommand::MasterUpsert(service.host.clone()))
                    .await;
                // A fresh leader starts from fresh heartbeat observations.
                service.heartbeats.clear();
            }

            if is_leader {
                let now = utils::unix_micros();
                let faulty: Vec<String> = service
                    .heartbeats
                    .iter()
                    .filter(|entry| now - *entry.value() > faulty_micros)
                    .map(|entry| entry.key().clone())
                    .collect();
                for name in faulty {
                    warn!(member = %name, "member heartbeat stale, removing");
                    service.heartbeats.remove(&name);
                    service
                        .propose_logged(PlacementCommand::MemberRemove(name))
                        .await;
                }
            }

            was_leader = is_leader;
        }
    });
}

// ── Member-side reporter ──────────────────────────────────────────────────────

/// Every node streams heartbeats and its owned entity states to the leader,
/// re-dialing whenever the stream breaks or leadership moves.
pub fn spawn_status_reporter(
    raft: Arc<RaftHandle>,
    host: Host,
    owned: Arc<OwnedStates>,
) {
    tokio::spawn(async move {
        loop {
            let Some(leader_addr) = raft.leader_addr() else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            let client = match PlacementService::connect(&leader_addr).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(leader = %leader_addr, error = %e, "cannot dial leader");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            run_report_stream(client, &raft, &host, &owned, &leader_addr).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

/// One stream generation: identity first, then a heartbeat with the owned
/// states every interval, until the stream breaks or leadership moves.
async fn run_report_stream(
    mut client: PlacementClient<Channel>,
    raft: &Arc<RaftHandle>,
    host: &Host,
    owned: &Arc<OwnedStates>,
    leader_addr: &str,
) {
    let (tx, rx) = mpsc::channel::<ReportStatusReq>(8);

    let feeder = {
        let tx = tx.clone();
        let host = host.clone();
        let owned = owned.clone();
        let mut leader_watch = raft.leader_watch();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // first tick is immediate
            loop {
                let states: Vec<State> = owned
                    .snapshot()
                    .into_iter()
                    .map(|(id, version)| State {
                        id,
                        host: host.name.clone(),
                        version,
                    })
                    .collect();
                let req = ReportStatusReq {
                    id: host.app_id.clone(),
                    name: host.name.clone(),
                    port: host.port,
                    states,
                };
                if tx.send(req).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = leader_watch.changed() => {
                        // Leadership moved; end this generation so the outer
                        // loop re-resolves the leader.
                        if changed.is_err() {
                            break;
                        }
                        break;
                    }
                }
            }
        })
    };

    debug!(leader = %leader_addr, "report stream opening");
    match client.report_status(ReceiverStream::new(rx)).await {
        Ok(_) => debug!(leader = %leader_addr, "report stream closed"),
        Err(status) => debug!(leader = %leader_addr, error = %status, "report stream failed"),
    }
    feeder.abort();
}

use std::sync::{Arc, RwLock};

use tracing::info;
use tracing_subscriber::EnvFilter;

use twincore::config::Config;
use twincore::dispatch::Dispatcher;
use twincore::fsm::PlacementTable;
use twincore::holder::Holder;
use twincore::manager::ApiManager;
use twincore::placement::{
    spawn_leadership_monitor, spawn_status_reporter, start_placement_server, OwnedStates,
    PlacementService,
};
use twincore::pubsub::{LoopbackBus, PubsubRegistry};
use twincore::raft::start_raft_node;
use twincore::repository::Repository;
use twincore::respond::{start_http_server, CallbackClient, HttpState};
use twincore::ring::Host;
use twincore::runtime::RuntimeNode;
use twincore::store::StoreRegistry;
use twincore::{metrics, utils};

/// `--conf <path>` flag, falling back to `TWINCORE_CONF`, then `config.yml`.
fn config_path() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--conf" {
            if let Some(path) = args.next() {
                return path;
            }
        }
    }
    std::env::var("TWINCORE_CONF").unwrap_or_else(|_| "config.yml".to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logger.level.clone())),
        )
        .init();
    metrics::register_all();

    info!(node = %config.server.name, "starting twincore node");

    // The search sink driver is external; the descriptor is still validated
    // here so a bad URL fails at boot, not at first write.
    if !config.search.url.is_empty() {
        let endpoint = utils::parse_search_url(&config.search.url)?;
        info!(driver = %endpoint.driver, endpoints = endpoint.urls.len(), "search sink configured");
    }

    // Placement: raft-replicated table + gRPC service.
    let table = Arc::new(RwLock::new(PlacementTable::new()));
    let raft = start_raft_node(&config, table).await?;

    let host = Host {
        name: config.server.name.clone(),
        app_id: "twincore".to_string(),
        port: config.placement.port as u32,
    };
    let placement = PlacementService::new(raft.clone(), host.clone());
    {
        let placement = placement.clone();
        let port = config.placement.port;
        tokio::spawn(async move { start_placement_server(placement, port).await });
    }
    spawn_leadership_monitor(placement, &config);

    let owned = Arc::new(OwnedStates::new());
    spawn_status_reporter(raft.clone(), host, owned.clone());

    // Persistence.
    let stores = StoreRegistry::with_defaults();
    let repo = Arc::new(Repository::new(stores.create(&config.store.driver)));

    // Dispatch over the configured queues.
    let bus = Arc::new(LoopbackBus::new());
    let pubsubs = PubsubRegistry::with_defaults(bus);
    let dispatcher = Arc::new(Dispatcher::new(&config, &pubsubs, &repo).await?);

    // Runtime containers.
    let callback = Arc::new(CallbackClient::new());
    let runtime = RuntimeNode::new(
        repo.clone(),
        dispatcher.clone(),
        callback,
        owned,
        config.runtime.replay_cache_size,
    );
    runtime.start().await?;

    // API manager + HTTP listener (/v1/respond, /health, /metrics). The
    // HTTP/gRPC entity edge services hold the manager; the node listener
    // only needs the respond bridge.
    let holder = Arc::new(Holder::new());
    let manager = Arc::new(ApiManager::new(
        &config,
        repo,
        dispatcher.clone(),
        holder,
    ));

    {
        let state = HttpState {
            manager: manager.clone(),
            node_name: config.server.name.clone(),
            leader_probe: {
                let raft = raft.clone();
                Arc::new(move || raft.is_leader())
            },
        };
        let port = config.server.http_port;
        tokio::spawn(async move { start_http_server(state, port).await });
    }

    info!(
        node = %config.server.name,
        addr = %utils::resolve_addr(),
        http_port = config.server.http_port,
        placement_port = config.placement.port,
        "twincore node running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    runtime.shutdown();
    dispatcher.close().await?;
    Ok(())
}

use std::{error::Error, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use fedbroker::broker::{
    aggregate::{ResponseCache, SliceBroker},
    fanout::{best_effort, WorkerPool},
    hex::HexDisplayExt,
    hrn::Hrn,
    identity::IdentityService,
    ledger::CallLedger,
    net::{Dispatcher, Endpoint, QuicAggregateClient, QuicRegistryClient, TlsSettings},
    peer::{AggregateClient, RegistryClient},
    record::MemoryRecordStore,
    registry::RegistryBroker,
    topology::{BrokerConfig, Topology},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often peers are asked for their signing keys.
const PEER_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "fedbroker", version, about = "Federation registry and slice broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the registry and slice brokers on one QUIC endpoint.
    Serve {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a configuration file and print the federation it describes.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve { config } => serve(BrokerConfig::load(&config)?).await,
        Command::Check { config } => {
            let config = BrokerConfig::load(&config)?;
            print_topology(&config.hrn(), &config.topology()?);
            Ok(())
        }
    }
}

fn print_topology(hrn: &Hrn, topology: &Topology) {
    println!("authority {}", hrn);
    for peer in topology.registries() {
        println!("  registry  {:<24} {}", peer.hrn.to_string(), peer.url());
    }
    for peer in topology.aggregates() {
        println!("  aggregate {:<24} {}", peer.hrn.to_string(), peer.url());
    }
}

async fn serve(config: BrokerConfig) -> Result<(), Box<dyn Error>> {
    let hrn = config.hrn();
    let topology = Arc::new(config.topology()?);
    let tls = match &config.tls {
        Some(files) => TlsSettings::Pem(files.clone()),
        None => TlsSettings::SelfSigned {
            server_name: hrn.to_string(),
        },
    };
    let endpoint = Endpoint::bind(config.broker.listen, &tls)?;
    let local_addr = endpoint.local_addr()?;

    let identity = Arc::new(match &config.broker.signing_key_path {
        Some(path) => IdentityService::load_or_create(hrn.clone(), path)?,
        None => {
            warn!("no signing_key_path configured, credentials die with this process");
            IdentityService::generate(hrn.clone())
        }
    });
    info!(
        hrn = %hrn,
        key = %identity.encoded_public_key()?.short_hex(),
        "identity ready"
    );
    match &config.broker.admin_credential_path {
        Some(path) => {
            identity.export_own_credential(path)?;
            info!(path = %path.display(), "administrator credential written");
        }
        None => warn!("no admin_credential_path configured, nobody can register records"),
    }

    // one cache and one ledger for the whole process
    let ledger = Arc::new(CallLedger::new());
    let cache = Arc::new(ResponseCache::new());

    let mut registry = RegistryBroker::new(
        identity.clone(),
        topology.clone(),
        Arc::new(MemoryRecordStore::new()),
        ledger.clone(),
    );
    let mut registry_peers = Vec::new();
    for peer in topology.registries() {
        if peer.hrn == hrn {
            continue;
        }
        let client = Arc::new(QuicRegistryClient::new(endpoint.handle(), peer));
        registry = registry.with_peer(peer.hrn.clone(), client.clone());
        registry_peers.push((peer.hrn.clone(), client));
    }

    let mut slices = SliceBroker::new(
        identity.clone(),
        topology.clone(),
        cache,
        ledger,
        WorkerPool::new(config.broker.worker_permits),
    )
    .with_cache_settings(config.cache_settings());
    let mut aggregate_peers = Vec::new();
    for peer in topology.aggregates() {
        if is_self(peer.addr, config.broker.listen, local_addr) {
            warn!(aggregate = %peer.hrn, "aggregate entry points at this broker, skipping");
            continue;
        }
        let client = Arc::new(QuicAggregateClient::new(endpoint.handle(), peer));
        slices = slices.with_aggregate(peer.hrn.clone(), client.clone());
        aggregate_peers.push((peer.hrn.clone(), client));
    }

    tokio::spawn(trust_peers(identity, registry_peers, aggregate_peers));

    let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), Arc::new(slices)));
    info!(listen = %local_addr, "serving");
    tokio::select! {
        _ = endpoint.serve(dispatcher) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            endpoint.close();
        }
    }
    Ok(())
}

fn is_self(peer: SocketAddr, listen: SocketAddr, bound: SocketAddr) -> bool {
    peer == listen || peer == bound
}

/// Learns the signing key of every peer so credentials they mint verify
/// here. Peers that are down are retried on the next round.
async fn trust_peers(
    identity: Arc<IdentityService>,
    registries: Vec<(Hrn, Arc<QuicRegistryClient>)>,
    aggregates: Vec<(Hrn, Arc<QuicAggregateClient>)>,
) {
    let mut ticker = tokio::time::interval(PEER_REFRESH_INTERVAL);
    loop {
        ticker.tick().await;
        for (peer, client) in &registries {
            let lookup = RegistryClient::get_version(client.as_ref());
            if let Some(version) = best_effort("registry version lookup", peer, lookup).await {
                if let Err(err) = identity.trust_version(peer, &version) {
                    warn!(peer = %peer, error = %err, "not trusting registry");
                }
            }
        }
        for (peer, client) in &aggregates {
            let lookup = AggregateClient::get_version(client.as_ref());
            if let Some(version) = best_effort("aggregate version lookup", peer, lookup).await {
                if let Err(err) = identity.trust_version(peer, &version) {
                    warn!(peer = %peer, error = %err, "not trusting aggregate");
                }
            }
        }
    }
}

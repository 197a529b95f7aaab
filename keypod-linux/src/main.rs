// KeyPod Linux: discovery, transport and pairing daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use keypod_core::KeyPoolStore;
use keypod_linux::beacon::{AdvertSource, BeaconOptions, BrowseSource, Presence};
use keypod_linux::merger::{DiscoveryMerger, DiscoverySource, MergerOptions};
use keypod_linux::redb_store::RedbStore;
use keypod_linux::transport::{TcpTransport, Transport};
use keypod_linux::{config, Node, NodeOptions};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failed dials to the same endpoint are not retried sooner than this.
const REDIAL_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "keypod-linux", version, about = "KeyPod pairing daemon")]
struct Cli {
    /// Config file (default: ~/.config/keypod/config.toml, then /etc/keypod/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbosity (-v info, -vv debug, -vvv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let cfg = config::load(cli.config.as_deref()).context("loading config")?;
    let pool_params = cfg.pool_params()?;

    let store = RedbStore::open(cfg.db_path())
        .with_context(|| format!("opening {}", cfg.db_path().display()))?;
    let identity = Arc::new(store.load_or_create_identity()?);
    let pools = Arc::new(KeyPoolStore::new(store));
    info!(peer = %identity.peer_id(), name = %cfg.name, "keypod starting");

    let (transport, events, local) = TcpTransport::bind(identity.clone(), cfg.transport_port)
        .await
        .context("binding transport")?;

    let presence = Presence::new(
        cfg.service.clone(),
        cfg.name.clone(),
        cfg.advertised_host.clone(),
        local.port(),
    );
    let beacon = BeaconOptions {
        discovery_port: cfg.discovery_port,
        interval: cfg.beacon_interval(),
        expiry: cfg.advert_expiry(),
    };
    let adverts = Arc::new(AdvertSource::new(presence.clone(), beacon.clone()));
    let browse = Arc::new(BrowseSource::new(presence, beacon));
    let merger = Arc::new(DiscoveryMerger::start(
        vec![
            adverts.clone() as Arc<dyn DiscoverySource>,
            browse as Arc<dyn DiscoverySource>,
        ],
        MergerOptions {
            poll_interval: cfg.poll_interval(),
            ..MergerOptions::default()
        },
    ));

    let node = Arc::new(Node::new(
        identity.peer_id(),
        pools,
        transport.clone() as Arc<dyn Transport>,
        Some(merger.clone()),
        NodeOptions {
            step_timeout: cfg.step_timeout(),
            pool_params,
            auto_pair: cfg.auto_pair,
            wait_timeout: cfg.wait_timeout(),
        },
    ));

    let routing = node.clone();
    tokio::spawn(async move { routing.run(events).await });
    tokio::spawn(dial_discovered(node.clone(), merger.clone()));

    shutdown_signal().await?;
    info!("shutting down");
    if let Err(e) = adverts.send_goodbye().await {
        debug!(error = %e, "goodbye not sent");
    }
    merger.stop();
    transport.shutdown().await;
    Ok(())
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn,keypod_linux=info,keypod_core=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Connect to every endpoint the merged discovery view reports.
async fn dial_discovered(node: Arc<Node<RedbStore>>, merger: Arc<DiscoveryMerger>) {
    let mut view = merger.subscribe();
    let mut failed: HashMap<String, Instant> = HashMap::new();
    loop {
        let peers = view.borrow_and_update().clone();
        for endpoint in peers {
            if failed
                .get(&endpoint.dedup_key)
                .is_some_and(|at| at.elapsed() < REDIAL_BACKOFF)
            {
                continue;
            }
            match node.connect_discovered(&endpoint).await {
                Ok(peer) => {
                    failed.remove(&endpoint.dedup_key);
                    debug!(%peer, endpoint = %endpoint.endpoint(), "linked");
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.endpoint(), name = %endpoint.name, error = %e, "dial failed");
                    failed.insert(endpoint.dedup_key.clone(), Instant::now());
                }
            }
        }
        if view.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use wgfleet_core::applier::InterfaceApplier;
use wgfleet_core::maintenance::run_maintenance_loop;
use wgfleet_core::peer_manager::PeerManager;
use wgfleet_core::server_manager::{ServerManager, TcpProbe};
use wgfleet_core::store::{FileStore, KeySealer, PeerStore, PgStore};
use wgfleet_core::telemetry::{AnalyticsLog, Fanout, MetricsRegistry, TelemetrySink};
use wgfleet_core::vpn_manager::VpnManager;
use wgfleet_daemon::config::{self, DaemonToml, KEY_SECRET_ENV, StorageSection};
use wgfleet_daemon::netlink::CurrentApplier;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Peer provisioning daemon for a WireGuard server fleet")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/wgfleet/daemon.toml")]
    config: PathBuf,

    /// Health check interval in seconds, overrides the config file
    #[arg(long)]
    health_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    info!(config = %args.config.display(), version = env!("GIT_VERSION"), "starting wgfleet-daemon");

    let settings = config::load(&args.config).await?;
    let secret = settings.key_secret(std::env::var(KEY_SECRET_ENV).ok().as_deref())?;
    let sealer = KeySealer::new(secret);

    let metrics = Arc::new(MetricsRegistry::new());
    let mut sinks: Vec<Arc<dyn TelemetrySink>> = vec![metrics.clone()];
    let mut analytics_writer = None;
    if let Some(path) = &settings.telemetry.analytics_log {
        let (log, writer) = AnalyticsLog::open(path).await?;
        sinks.push(Arc::new(log));
        analytics_writer = Some(writer);
    }
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(Fanout::new(sinks));

    let servers = Arc::new(ServerManager::new(
        TcpProbe,
        Duration::from_secs(settings.health.probe_timeout_secs),
        telemetry.clone(),
    ));
    for server in settings.servers.iter().cloned() {
        servers.add_server(server)?;
    }

    let applier = CurrentApplier::new(settings.interfaces.clone());

    match &settings.storage {
        StorageSection::File { path } => {
            let store = FileStore::open(path.clone(), sealer).await?;
            serve(store, applier, servers, telemetry, &settings, &args).await?;
        }
        StorageSection::Postgres { database_url } => {
            let store = PgStore::connect(database_url, sealer).await?;
            store.migrate().await?;
            serve(store, applier, servers, telemetry, &settings, &args).await?;
        }
    }

    if let Some(writer) = analytics_writer {
        if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
            warn!("analytics log did not drain before shutdown");
        }
    }

    info!(counters = ?metrics.counters(), "wgfleet-daemon stopped");
    Ok(())
}

async fn serve<S, A>(
    store: S,
    applier: A,
    servers: Arc<ServerManager>,
    telemetry: Arc<dyn TelemetrySink>,
    settings: &DaemonToml,
    args: &Args,
) -> Result<(), wgfleet_core::Error>
where
    S: PeerStore + 'static,
    A: InterfaceApplier + 'static,
{
    let peers = PeerManager::open(store, applier, settings.tunnel.peer_settings(), &servers.subnets()).await?;
    if peers.needs_reconcile() {
        warn!("restored peers are not on the interfaces yet, maintenance will retry");
    }

    let vpn = Arc::new(VpnManager::new(servers.clone(), Arc::new(peers), telemetry));
    vpn.restore_load_accounting();

    let health_interval = Duration::from_secs(args.health_interval.unwrap_or(settings.health.interval_secs).max(1));
    let health = tokio::spawn({
        let servers = servers.clone();
        async move { servers.run_health_loop(health_interval).await }
    });

    let maintenance_interval = Duration::from_secs(settings.maintenance.interval_secs);
    let maintenance = tokio::spawn({
        let vpn = vpn.clone();
        async move { run_maintenance_loop(&vpn, maintenance_interval).await }
    });

    info!(
        servers = vpn.list_servers().len(),
        peers = vpn.peers().active_count(),
        "wgfleet-daemon ready"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");

    health.abort();
    maintenance.abort();
    let _ = health.await;
    let _ = maintenance.await;
    Ok(())
}

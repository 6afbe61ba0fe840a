use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use wgfleet_core::applier::{ApplyError, InterfaceApplier};
use wgfleet_core::peer_manager::PeerManager;
use wgfleet_core::server_manager::{HealthProbe, ServerManager};
use wgfleet_core::store::{FileStore, KeySealer};
use wgfleet_core::telemetry::NoopTelemetry;
use wgfleet_core::vpn_manager::{ConnectRequest, VpnManager};
use wgfleet_daemon::config::{self, DaemonToml, StorageSection};
use wgfleet_daemon::netlink::plan;
use wgfleet_types::{DeviceClass, LiveStats, TunnelPeer};

// -- Mock applier that records calls --
// Global statics require serial execution for these tests.

static TEST_LOCK: Mutex<()> = Mutex::new(());
static APPLIED: Mutex<Vec<Vec<TunnelPeer>>> = Mutex::new(Vec::new());

struct MockApplier;

impl InterfaceApplier for MockApplier {
    async fn reconcile(&self, peers: &[TunnelPeer]) -> Result<(), ApplyError> {
        APPLIED.lock().unwrap().push(peers.to_vec());
        Ok(())
    }

    async fn query_live_stats(&self) -> Result<HashMap<String, LiveStats>, ApplyError> {
        Ok(HashMap::new())
    }
}

struct NoProbe;

impl HealthProbe for NoProbe {
    async fn probe(&self, _target: &str) -> bool {
        false
    }
}

/// Acquire the test lock and clear mock state. Hold the returned guard for
/// the duration of the test.
fn lock_and_clear() -> std::sync::MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    APPLIED.lock().unwrap().clear();
    guard
}

fn last_applied() -> Vec<TunnelPeer> {
    APPLIED.lock().unwrap().last().cloned().unwrap_or_default()
}

// -- Helpers --

const SECRET: &str = "1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100";
const SERVER_KEY: &str = "YmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmI=";
const PRIVATE_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

async fn write_config(dir: &Path) -> std::path::PathBuf {
    let contents = format!(
        r#"
key_secret = "{SECRET}"

[storage]
backend = "file"
path = "{store}"

[tunnel]
dns = ["9.9.9.9"]
allowed_ips = ["10.0.0.0/8"]
persistent_keepalive = 0

[[servers]]
id = "eu-west"
name = "Amsterdam"
location = "Europe"
endpoint = "ams.vpn.example.com:51820"
public_key = "{SERVER_KEY}"
subnet = "10.8.0.0/24"
capacity = 10

[[servers]]
id = "us-east"
name = "Newark"
location = "America"
endpoint = "ewr.vpn.example.com:51820"
public_key = "{SERVER_KEY}"
subnet = "10.9.0.0/24"
capacity = 10

[[interfaces]]
server_id = "eu-west"
name = "wg0"
private_key = "{PRIVATE_KEY}"
listen_port = 51820
address = "10.8.0.1/24"
"#,
        store = dir.join("peers").display(),
    );
    let path = dir.join("daemon.toml");
    tokio::fs::write(&path, contents).await.unwrap();
    path
}

async fn build(settings: &DaemonToml) -> VpnManager<FileStore, MockApplier, NoProbe> {
    let StorageSection::File { path } = &settings.storage else {
        panic!("expected file storage");
    };
    let sealer = KeySealer::new(settings.key_secret(None).unwrap());
    let store = FileStore::open(path.clone(), sealer).await.unwrap();

    let servers = Arc::new(ServerManager::new(NoProbe, Duration::from_millis(50), Arc::new(NoopTelemetry)));
    for server in settings.servers.iter().cloned() {
        servers.add_server(server).unwrap();
    }

    let peers = PeerManager::open(store, MockApplier, settings.tunnel.peer_settings(), &servers.subnets())
        .await
        .unwrap();
    let vpn = VpnManager::new(servers, Arc::new(peers), Arc::new(NoopTelemetry));
    vpn.restore_load_accounting();
    vpn
}

// -- Tests --

#[tokio::test]
async fn config_drives_rendered_profiles() {
    let _guard = lock_and_clear();
    let dir = tempfile::tempdir().unwrap();
    let settings = config::load(&write_config(dir.path()).await).await.unwrap();
    let vpn = build(&settings).await;

    let connection = vpn
        .connect(ConnectRequest {
            user_id: Uuid::new_v4(),
            server_id: "eu-west".parse().unwrap(),
            device_class: DeviceClass::Linux,
            device_name: Some("workstation".into()),
        })
        .await
        .unwrap();

    assert!(connection.config.starts_with("# workstation"));
    assert!(connection.config.contains("DNS = 9.9.9.9"));
    assert!(connection.config.contains("AllowedIPs = 10.0.0.0/8"));
    assert!(!connection.config.contains("PersistentKeepalive"));

    let applied = last_applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].persistent_keepalive, 0);
}

#[tokio::test]
async fn only_local_interfaces_carry_peers() {
    let _guard = lock_and_clear();
    let dir = tempfile::tempdir().unwrap();
    let settings = config::load(&write_config(dir.path()).await).await.unwrap();
    let vpn = build(&settings).await;
    let user = Uuid::new_v4();

    for server in ["eu-west", "us-east", "eu-west"] {
        vpn.connect(ConnectRequest {
            user_id: user,
            server_id: server.parse().unwrap(),
            device_class: DeviceClass::Generic,
            device_name: None,
        })
        .await
        .unwrap();
    }

    let desired = last_applied();
    assert_eq!(desired.len(), 3);

    let planned = plan(&settings.interfaces, &desired);
    assert_eq!(planned.len(), 1);
    assert_eq!(planned[0].0.name, "wg0");
    assert_eq!(planned[0].1.len(), 2);
    assert!(planned[0].1.iter().all(|p| p.server_id.as_str() == "eu-west"));
}

#[tokio::test]
async fn restart_from_config_restores_fleet() {
    let _guard = lock_and_clear();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path()).await;
    let user = Uuid::new_v4();

    {
        let settings = config::load(&path).await.unwrap();
        let vpn = build(&settings).await;
        vpn.connect(ConnectRequest {
            user_id: user,
            server_id: "us-east".parse().unwrap(),
            device_class: DeviceClass::Ios,
            device_name: None,
        })
        .await
        .unwrap();
    }

    let settings = config::load(&path).await.unwrap();
    let vpn = build(&settings).await;
    let servers = vpn.list_servers();
    let us_east = servers.iter().find(|s| s.id.as_str() == "us-east").unwrap();
    assert_eq!(us_east.load, 1);

    let status = vpn.get_status(user).await.unwrap();
    assert!(status.connected);
    assert_eq!(status.sessions[0].server_name.as_deref(), Some("Newark"));
}

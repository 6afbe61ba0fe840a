#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use uuid::Uuid;
use wgfleet_core::applier::{ApplyError, InterfaceApplier};
use wgfleet_core::peer_manager::{PeerManager, PeerSettings};
use wgfleet_core::server_manager::{HealthProbe, NewServer, ServerManager};
use wgfleet_core::store::{FileStore, KeySealer, PeerStore, Scan, StoreError};
use wgfleet_core::telemetry::MetricsRegistry;
use wgfleet_core::vpn_manager::VpnManager;
use wgfleet_core::{Peer, ServerEndpoint};
use wgfleet_types::{LiveStats, PeerKind, ServerId, ServerStatus, TunnelPeer};

pub const SERVER_KEY: &str = "YmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmI=";

// -- Fake tunnel engine --

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct FakeState {
    failing: bool,
    delay: Option<Duration>,
    hook: Option<Hook>,
    applied: Vec<Vec<TunnelPeer>>,
    stats: HashMap<String, LiveStats>,
}

/// Records every desired set it is handed. Clones share state, so a test can
/// keep a handle after moving one into a manager.
#[derive(Clone, Default)]
pub struct FakeApplier {
    state: Arc<Mutex<FakeState>>,
}

impl FakeApplier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    /// Run `hook` at the start of the next reconcile only.
    pub fn on_next_reconcile(&self, hook: impl FnOnce() + Send + 'static) {
        self.state().hook = Some(Box::new(hook));
    }

    pub fn set_stats(&self, stats: HashMap<String, LiveStats>) {
        self.state().stats = stats;
    }

    pub fn reconcile_count(&self) -> usize {
        self.state().applied.len()
    }

    pub fn last_applied(&self) -> Vec<TunnelPeer> {
        self.state().applied.last().cloned().unwrap_or_default()
    }
}

impl InterfaceApplier for FakeApplier {
    async fn reconcile(&self, peers: &[TunnelPeer]) -> Result<(), ApplyError> {
        let (hook, delay, failing) = {
            let mut state = self.state();
            (state.hook.take(), state.delay, state.failing)
        };
        if let Some(hook) = hook {
            hook();
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(ApplyError::Interface("injected failure".into()));
        }
        self.state().applied.push(peers.to_vec());
        Ok(())
    }

    async fn query_live_stats(&self) -> Result<HashMap<String, LiveStats>, ApplyError> {
        let state = self.state();
        if state.failing {
            return Err(ApplyError::Interface("injected failure".into()));
        }
        Ok(state.stats.clone())
    }
}

// -- Store wrapper with injectable delete failures --

/// A [`FileStore`] whose deletes can be switched to fail. Clones share the
/// switch.
#[derive(Clone)]
pub struct FlakyStore {
    inner: FileStore,
    fail_deletes: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(inner: FileStore) -> Self {
        Self {
            inner,
            fail_deletes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_failing_deletes(&self, failing: bool) {
        self.fail_deletes.store(failing, Ordering::SeqCst);
    }
}

impl PeerStore for FlakyStore {
    async fn save(&self, peer: &Peer) -> Result<(), StoreError> {
        self.inner.save(peer).await
    }

    async fn get(&self, kind: PeerKind, user_id: Uuid, peer_id: Uuid) -> Result<Peer, StoreError> {
        self.inner.get(kind, user_id, peer_id).await
    }

    async fn list_by_user(&self, kind: PeerKind, user_id: Uuid) -> Result<Vec<Peer>, StoreError> {
        self.inner.list_by_user(kind, user_id).await
    }

    async fn list_all(&self, kind: PeerKind) -> Result<Vec<Peer>, StoreError> {
        self.inner.list_all(kind).await
    }

    async fn scan(&self, kind: PeerKind) -> Result<Scan, StoreError> {
        self.inner.scan(kind).await
    }

    async fn delete(&self, kind: PeerKind, user_id: Uuid, peer_id: Uuid) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("injected delete failure")));
        }
        self.inner.delete(kind, user_id, peer_id).await
    }
}

/// Every target is healthy.
pub struct AlwaysUp;

impl HealthProbe for AlwaysUp {
    async fn probe(&self, _target: &str) -> bool {
        true
    }
}

// -- Helpers --

pub type TestPeers = PeerManager<FlakyStore, FakeApplier>;
pub type TestVpn = VpnManager<FlakyStore, FakeApplier, AlwaysUp>;

pub fn sealer() -> KeySealer {
    KeySealer::new([7u8; 32])
}

pub fn sid(id: &str) -> ServerId {
    id.parse().unwrap()
}

pub fn endpoint(id: &str, subnet: &str) -> ServerEndpoint {
    ServerEndpoint {
        id: sid(id),
        public_key: SERVER_KEY.into(),
        endpoint: format!("{id}.vpn.example.com:51820"),
        subnet: subnet.parse().unwrap(),
    }
}

pub fn new_server(id: &str, location: &str, subnet: &str, capacity: u32) -> NewServer {
    NewServer {
        id: sid(id),
        name: format!("{location} {id}"),
        location: location.into(),
        endpoint: format!("{id}.vpn.example.com:51820"),
        public_key: SERVER_KEY.into(),
        subnet: subnet.parse().unwrap(),
        capacity,
        health_check: None,
        status: ServerStatus::Online,
    }
}

pub fn subnets(entries: &[(&str, &str)]) -> BTreeMap<ServerId, Ipv4Network> {
    entries
        .iter()
        .map(|(id, subnet)| (sid(id), subnet.parse().unwrap()))
        .collect()
}

pub async fn open_peers(dir: &Path, applier: FakeApplier, subnets: &BTreeMap<ServerId, Ipv4Network>) -> TestPeers {
    open_peers_with(dir, applier, PeerSettings::default(), subnets).await
}

pub async fn open_peers_with(
    dir: &Path,
    applier: FakeApplier,
    settings: PeerSettings,
    subnets: &BTreeMap<ServerId, Ipv4Network>,
) -> TestPeers {
    let store = open_store(dir, sealer()).await;
    PeerManager::open(store, applier, settings, subnets).await.unwrap()
}

pub async fn open_store(dir: &Path, sealer: KeySealer) -> FlakyStore {
    FlakyStore::new(FileStore::open(dir, sealer).await.unwrap())
}

pub struct Harness {
    pub vpn: Arc<TestVpn>,
    pub servers: Arc<ServerManager<AlwaysUp>>,
    pub applier: FakeApplier,
    pub store: FlakyStore,
    pub metrics: Arc<MetricsRegistry>,
}

pub async fn harness(dir: &Path, servers: Vec<NewServer>) -> Harness {
    let applier = FakeApplier::new();
    let metrics = Arc::new(MetricsRegistry::new());

    let server_manager = Arc::new(ServerManager::new(AlwaysUp, Duration::from_millis(50), metrics.clone()));
    for server in servers {
        server_manager.add_server(server).unwrap();
    }

    let store = open_store(dir, sealer()).await;
    let peers = PeerManager::open(store.clone(), applier.clone(), PeerSettings::default(), &server_manager.subnets())
        .await
        .unwrap();
    let vpn = VpnManager::new(server_manager.clone(), Arc::new(peers), metrics.clone());
    vpn.restore_load_accounting();

    Harness {
        vpn: Arc::new(vpn),
        servers: server_manager,
        applier,
        store,
        metrics,
    }
}

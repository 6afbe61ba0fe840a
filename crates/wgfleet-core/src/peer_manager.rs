// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Peer lifecycle.
//!
//! Every mutation runs under one manager-wide async mutex: key minting,
//! address allocation, the store write and the interface reconcile of a
//! create or remove are never interleaved with another create or remove.
//! The active-peer index sits behind its own `RwLock` so reads do not wait
//! on a slow reconcile; it is only written while the mutation lock is held.
//!
//! A create that fails part way undoes every completed step before the
//! error is returned. A remove whose reconcile fails leaves the peer fully
//! in place.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use ipnetwork::Ipv4Network;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wgfleet_types::{DeviceClass, LiveStats, PeerKind, ServerId, TunnelPeer};

use crate::applier::InterfaceApplier;
use crate::error::{Error, ReconcileFailure, Resource};
use crate::keys::KeyProvider;
use crate::peer::{Peer, ServerEndpoint};
use crate::pool::AddressPool;
use crate::render::{ConfigRenderer, TunnelSettings};
use crate::store::{LockedPeer, PeerStore, StoreError};

const MAX_DEVICE_NAME: usize = 64;

#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub tunnel: TunnelSettings,
    /// Upper bound on every call into the tunnel engine.
    pub reconcile_timeout: Duration,
    /// Lifetime of dynamic peers when the caller does not pick one.
    pub dynamic_ttl: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            tunnel: TunnelSettings::default(),
            reconcile_timeout: Duration::from_secs(5),
            dynamic_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    user_id: Uuid,
    server_id: ServerId,
    kind: PeerKind,
    public_key: String,
    expires_at: Option<DateTime<Utc>>,
    /// The stored private key cannot be opened with the current secret.
    locked: bool,
    tunnel: TunnelPeer,
}

/// The fields of a stored peer that allocation state is rebuilt from.
#[derive(Debug, Clone)]
struct Holding {
    id: Uuid,
    user_id: Uuid,
    server_id: ServerId,
    kind: PeerKind,
    public_key: String,
    address: Ipv4Addr,
    expires_at: Option<DateTime<Utc>>,
    locked: bool,
}

impl From<&Peer> for Holding {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id,
            user_id: peer.user_id,
            server_id: peer.server_id.clone(),
            kind: peer.kind,
            public_key: peer.public_key.clone(),
            address: peer.address,
            expires_at: peer.expires_at,
            locked: false,
        }
    }
}

impl From<LockedPeer> for Holding {
    fn from(peer: LockedPeer) -> Self {
        Self {
            id: peer.id,
            user_id: peer.user_id,
            server_id: peer.server_id,
            kind: peer.kind,
            public_key: peer.public_key,
            address: peer.address,
            expires_at: peer.expires_at,
            locked: true,
        }
    }
}

/// Where a restored record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Adopted {
    Active,
    /// Key and address reserved, but the server is not registered so the
    /// peer is kept off the interfaces.
    Held,
}

/// How far a create got before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Reached {
    Allocated,
    Persisted,
}

pub struct PeerManager<S, A> {
    store: S,
    applier: A,
    pool: AddressPool,
    keys: KeyProvider,
    renderer: ConfigRenderer,
    mutation: Mutex<()>,
    index: RwLock<BTreeMap<Uuid, IndexEntry>>,
    held: StdMutex<BTreeMap<Uuid, Holding>>,
    pending_reconcile: AtomicBool,
    settings: PeerSettings,
}

fn normalize_device_name(name: &str, class: DeviceClass) -> Result<String, Error> {
    let name = match name.trim() {
        "" => class.as_str(),
        trimmed => trimmed,
    };
    if name.chars().count() > MAX_DEVICE_NAME {
        return Err(Error::Validation(format!(
            "device name is longer than {MAX_DEVICE_NAME} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(Error::Validation("device name contains a control character".into()));
    }
    Ok(name.to_string())
}

impl<S: PeerStore, A: InterfaceApplier> PeerManager<S, A> {
    /// Build the manager and rebuild allocation state from `store`.
    ///
    /// `subnets` maps every registered server to its tunnel subnet. Peers of
    /// unknown servers keep their key and address but stay off the
    /// interfaces. Peers whose key or address is already taken by an earlier
    /// record are logged and left out. Peers whose private key cannot be
    /// opened stay on the interfaces and keep their allocations, but cannot be
    /// rendered or removed until the right secret is configured.
    pub async fn open(
        store: S,
        applier: A,
        settings: PeerSettings,
        subnets: &BTreeMap<ServerId, Ipv4Network>,
    ) -> Result<Self, Error> {
        let manager = Self {
            store,
            applier,
            pool: AddressPool::new(),
            keys: KeyProvider::new(),
            renderer: ConfigRenderer::new(settings.tunnel.clone()),
            mutation: Mutex::new(()),
            index: RwLock::new(BTreeMap::new()),
            held: StdMutex::new(BTreeMap::new()),
            pending_reconcile: AtomicBool::new(false),
            settings,
        };
        manager.restore(subnets).await?;
        Ok(manager)
    }

    fn index_read(&self) -> RwLockReadGuard<'_, BTreeMap<Uuid, IndexEntry>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_write(&self) -> RwLockWriteGuard<'_, BTreeMap<Uuid, IndexEntry>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn held(&self) -> MutexGuard<'_, BTreeMap<Uuid, Holding>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &PeerSettings {
        &self.settings
    }

    /// Scan both namespaces and reserve every stored key and address before
    /// anything can be allocated. A record that cannot be parsed fails the
    /// open, since its address would otherwise be handed out again.
    async fn restore(&self, subnets: &BTreeMap<ServerId, Ipv4Network>) -> Result<(), Error> {
        let _guard = self.mutation.lock().await;

        let mut restored = 0usize;
        let mut held = 0usize;
        let mut locked = 0usize;
        let mut excluded = 0usize;
        for kind in [PeerKind::Static, PeerKind::Dynamic] {
            let scan = self.store.scan(kind).await?;
            for peer in &scan.locked {
                error!(
                    peer_id = %peer.id,
                    server_id = %peer.server_id,
                    %kind,
                    reason = %peer.reason,
                    "private key of stored peer cannot be opened, keeping its tunnel"
                );
            }
            locked += scan.locked.len();

            let records = scan
                .peers
                .iter()
                .map(Holding::from)
                .chain(scan.locked.into_iter().map(Holding::from));
            for record in records {
                match self.adopt(&record, subnets) {
                    Ok(Adopted::Active) => restored += 1,
                    Ok(Adopted::Held) => {
                        held += 1;
                        warn!(
                            peer_id = %record.id,
                            server_id = %record.server_id,
                            "server of stored peer is not registered, holding its address"
                        );
                    }
                    Err(reason) => {
                        excluded += 1;
                        error!(
                            peer_id = %record.id,
                            server_id = %record.server_id,
                            %kind,
                            %reason,
                            "excluding stored peer from active set"
                        );
                    }
                }
            }
        }
        info!(restored, held, locked, excluded, "rebuilt peer state from store");

        if let Err(failure) = self.push(self.desired(None)).await {
            warn!(error = %failure, "initial reconcile failed, marked for retry");
            self.pending_reconcile.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn adopt(&self, record: &Holding, subnets: &BTreeMap<ServerId, Ipv4Network>) -> Result<Adopted, String> {
        if self.index_read().contains_key(&record.id) || self.held().contains_key(&record.id) {
            return Err("peer id already restored".into());
        }
        if !self.keys.reserve(&record.public_key) {
            return Err("public key already in use".into());
        }

        let Some(subnet) = subnets.get(&record.server_id) else {
            if !self.pool.hold(&record.server_id, record.address) {
                self.keys.release(&record.public_key);
                return Err(format!("address {} already in use", record.address));
            }
            self.held().insert(record.id, record.clone());
            return Ok(Adopted::Held);
        };
        if let Err(e) = self.pool.reserve(&record.server_id, *subnet, record.address) {
            self.keys.release(&record.public_key);
            return Err(e.to_string());
        }
        let entry = self.entry_for(record);
        self.index_write().insert(record.id, entry);
        Ok(Adopted::Active)
    }

    fn entry_for(&self, record: &Holding) -> IndexEntry {
        IndexEntry {
            user_id: record.user_id,
            server_id: record.server_id.clone(),
            kind: record.kind,
            public_key: record.public_key.clone(),
            expires_at: record.expires_at,
            locked: record.locked,
            tunnel: TunnelPeer {
                server_id: record.server_id.clone(),
                public_key: record.public_key.clone(),
                allowed_ips: vec![format!("{}/32", record.address)],
                persistent_keepalive: self.renderer.settings().persistent_keepalive,
            },
        }
    }

    /// The full desired peer set, optionally without one peer.
    fn desired(&self, excluding: Option<Uuid>) -> Vec<TunnelPeer> {
        self.index_read()
            .iter()
            .filter(|(id, _)| Some(**id) != excluding)
            .map(|(_, entry)| entry.tunnel.clone())
            .collect()
    }

    async fn push(&self, peers: Vec<TunnelPeer>) -> Result<(), ReconcileFailure> {
        let timeout = self.settings.reconcile_timeout;
        match tokio::time::timeout(timeout, self.applier.reconcile(&peers)).await {
            Ok(Ok(())) => {
                debug!(peers = peers.len(), "reconciled interfaces");
                Ok(())
            }
            Ok(Err(e)) => Err(ReconcileFailure::Rejected(e)),
            Err(_) => Err(ReconcileFailure::Timeout(timeout)),
        }
    }

    #[tracing::instrument(skip(self, server), fields(server_id = %server.id))]
    pub async fn create_peer(
        &self,
        user_id: Uuid,
        server: &ServerEndpoint,
        device_class: DeviceClass,
        device_name: &str,
    ) -> Result<(Peer, String), Error> {
        self.create(user_id, server, device_class, device_name, PeerKind::Static, None)
            .await
    }

    /// Like [`create_peer`](Self::create_peer), in the dynamic namespace and
    /// expiring `ttl` from now.
    #[tracing::instrument(skip(self, server), fields(server_id = %server.id))]
    pub async fn create_dynamic_peer(
        &self,
        user_id: Uuid,
        server: &ServerEndpoint,
        device_class: DeviceClass,
        device_name: &str,
        ttl: Duration,
    ) -> Result<(Peer, String), Error> {
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .filter(|ttl| *ttl > TimeDelta::zero())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| Error::Validation(format!("invalid dynamic peer lifetime {ttl:?}")))?;

        self.create(user_id, server, device_class, device_name, PeerKind::Dynamic, Some(expires_at))
            .await
    }

    async fn create(
        &self,
        user_id: Uuid,
        server: &ServerEndpoint,
        device_class: DeviceClass,
        device_name: &str,
        kind: PeerKind,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(Peer, String), Error> {
        let device_name = normalize_device_name(device_name, device_class)?;

        let _guard = self.mutation.lock().await;

        let pair = self.keys.generate()?;
        let address = match self.pool.allocate(&server.id, server.subnet) {
            Ok(address) => address,
            Err(e) => {
                self.keys.release(&pair.public_key);
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let peer = Peer {
            id: Uuid::new_v4(),
            user_id,
            server_id: server.id.clone(),
            device_class,
            device_name,
            public_key: pair.public_key,
            private_key: pair.private_key,
            address,
            kind,
            created_at: now,
            updated_at: now,
            last_handshake: None,
            bytes_rx: 0,
            bytes_tx: 0,
            expires_at,
        };

        let config = match self.renderer.render(&peer, server) {
            Ok(config) => config,
            Err(e) => return Err(self.unwind(&peer, Reached::Allocated, e.into()).await),
        };

        if let Err(e) = self.store.save(&peer).await {
            return Err(self.unwind(&peer, Reached::Allocated, e.into()).await);
        }
        let entry = self.entry_for(&Holding::from(&peer));
        self.index_write().insert(peer.id, entry);

        if let Err(failure) = self.push(self.desired(None)).await {
            warn!(peer_id = %peer.id, error = %failure, "reconcile failed, rolling back new peer");
            // The engine may have taken part of the set before failing.
            self.pending_reconcile.store(true, Ordering::SeqCst);
            return Err(self.unwind(&peer, Reached::Persisted, failure.into()).await);
        }

        info!(
            peer_id = %peer.id,
            %user_id,
            %kind,
            address = %peer.address,
            "peer created"
        );
        Ok((peer, config))
    }

    /// Undo a partial create and hand back the error to return.
    async fn unwind(&self, peer: &Peer, reached: Reached, cause: Error) -> Error {
        if reached >= Reached::Persisted {
            self.index_write().remove(&peer.id);
            if let Err(e) = self.store.delete(peer.kind, peer.user_id, peer.id).await {
                // The record still exists, so its key and address stay reserved.
                error!(
                    peer_id = %peer.id,
                    error = %e,
                    cause = %cause,
                    "rollback could not delete peer record"
                );
                return Error::InconsistentState(format!(
                    "peer {} remains in the store after a failed create: {e}",
                    peer.id
                ));
            }
        }
        self.pool.release(&peer.server_id, peer.address);
        self.keys.release(&peer.public_key);
        debug!(peer_id = %peer.id, ?reached, "rolled back peer creation");
        cause
    }

    /// Remove a peer from the tunnel and then from metadata.
    ///
    /// If the interface cannot be reconciled the peer stays exactly as it was
    /// and `ReconciliationFailed` is returned.
    #[tracing::instrument(skip(self))]
    pub async fn remove_peer(&self, user_id: Uuid, peer_id: Uuid) -> Result<Peer, Error> {
        let _guard = self.mutation.lock().await;

        let peer = self.lookup(user_id, peer_id).await?;
        let indexed = self.index_read().contains_key(&peer_id);

        if let Err(failure) = self.push(self.desired(Some(peer_id))).await {
            warn!(error = %failure, "reconcile failed, peer kept");
            self.pending_reconcile.store(true, Ordering::SeqCst);
            return Err(failure.into());
        }

        if let Err(e) = self.store.delete(peer.kind, user_id, peer_id).await {
            error!(error = %e, "failed to delete peer record, restoring it on the interface");
            self.pending_reconcile.store(true, Ordering::SeqCst);
            if let Err(failure) = self.push(self.desired(None)).await {
                warn!(error = %failure, "could not restore interface state");
            }
            return Err(e.into());
        }

        let held = self.held().remove(&peer_id).is_some();
        if indexed || held {
            self.index_write().remove(&peer_id);
            self.pool.release(&peer.server_id, peer.address);
            self.keys.release(&peer.public_key);
        }

        info!(kind = %peer.kind, address = %peer.address, "peer removed");
        Ok(peer)
    }

    async fn lookup(&self, user_id: Uuid, peer_id: Uuid) -> Result<Peer, Error> {
        for kind in [PeerKind::Static, PeerKind::Dynamic] {
            match self.store.get(kind, user_id, peer_id).await {
                Ok(peer) => return Ok(peer),
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::NotFound(Resource::Peer(peer_id)))
    }

    pub async fn get_peer(&self, user_id: Uuid, peer_id: Uuid) -> Result<Peer, Error> {
        self.lookup(user_id, peer_id).await
    }

    /// All peers of a user, static first.
    pub async fn list_peers(&self, user_id: Uuid) -> Result<Vec<Peer>, Error> {
        let mut peers = self.store.list_by_user(PeerKind::Static, user_id).await?;
        peers.extend(self.store.list_by_user(PeerKind::Dynamic, user_id).await?);
        Ok(peers)
    }

    pub fn generate_config(&self, peer: &Peer, server: &ServerEndpoint) -> Result<String, Error> {
        if peer.server_id != server.id {
            return Err(Error::Validation(format!(
                "peer {} belongs to server {}, not {}",
                peer.id, peer.server_id, server.id
            )));
        }
        Ok(self.renderer.render(peer, server)?)
    }

    pub fn needs_reconcile(&self) -> bool {
        self.pending_reconcile.load(Ordering::SeqCst)
    }

    /// Push the desired set again if an earlier reconcile failed. Returns
    /// whether a retry was attempted and succeeded.
    pub async fn retry_pending_reconcile(&self) -> Result<bool, Error> {
        if !self.needs_reconcile() {
            return Ok(false);
        }
        let _guard = self.mutation.lock().await;
        self.push(self.desired(None)).await?;
        self.pending_reconcile.store(false, Ordering::SeqCst);
        info!("pending reconcile applied");
        Ok(true)
    }

    pub async fn live_stats(&self) -> Result<HashMap<String, LiveStats>, Error> {
        let timeout = self.settings.reconcile_timeout;
        match tokio::time::timeout(timeout, self.applier.query_live_stats()).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(e)) => Err(ReconcileFailure::Rejected(e).into()),
            Err(_) => Err(ReconcileFailure::Timeout(timeout).into()),
        }
    }

    /// Copy live counters into stored records that changed. Returns how many
    /// records were updated.
    pub async fn refresh_live_stats(&self) -> Result<usize, Error> {
        let stats = self.live_stats().await?;
        let _guard = self.mutation.lock().await;

        let tracked: Vec<(Uuid, Uuid, PeerKind, String)> = self
            .index_read()
            .iter()
            .filter(|(_, e)| !e.locked)
            .map(|(id, e)| (*id, e.user_id, e.kind, e.public_key.clone()))
            .collect();

        let mut updated = 0;
        for (peer_id, user_id, kind, public_key) in tracked {
            let Some(live) = stats.get(&public_key) else {
                continue;
            };
            let mut peer = match self.store.get(kind, user_id, peer_id).await {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(%peer_id, error = %e, "cannot load peer to record live stats");
                    continue;
                }
            };

            let last_handshake = live.last_handshake.or(peer.last_handshake);
            if peer.bytes_rx == live.bytes_rx
                && peer.bytes_tx == live.bytes_tx
                && peer.last_handshake == last_handshake
            {
                continue;
            }
            peer.bytes_rx = live.bytes_rx;
            peer.bytes_tx = live.bytes_tx;
            peer.last_handshake = last_handshake;
            peer.updated_at = Utc::now();

            match self.store.save(&peer).await {
                Ok(()) => updated += 1,
                Err(e) => warn!(%peer_id, error = %e, "failed to persist live stats"),
            }
        }
        debug!(updated, "live stats persisted");
        Ok(updated)
    }

    /// Stored peers whose key and address are reserved but whose server is
    /// not registered.
    pub fn held_count(&self) -> usize {
        self.held().len()
    }

    pub fn active_count(&self) -> usize {
        self.index_read().len()
    }

    pub fn active_counts_by_server(&self) -> BTreeMap<ServerId, u32> {
        let mut counts = BTreeMap::new();
        for entry in self.index_read().values() {
            *counts.entry(entry.server_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn active_count_for(&self, server_id: &ServerId) -> usize {
        self.index_read()
            .values()
            .filter(|e| &e.server_id == server_id)
            .count()
    }

    /// `(user_id, peer_id)` of every dynamic peer expired at `now`.
    pub fn expired_dynamic_peers(&self, now: DateTime<Utc>) -> Vec<(Uuid, Uuid)> {
        self.index_read()
            .iter()
            .filter(|(_, e)| e.kind == PeerKind::Dynamic && e.expires_at.is_some_and(|at| at <= now))
            .map(|(id, e)| (e.user_id, *id))
            .collect()
    }

    /// Addresses currently held on a server, ascending.
    pub fn allocated_addresses(&self, server_id: &ServerId) -> Vec<Ipv4Addr> {
        self.pool.allocated(server_id)
    }

    pub fn issued_key_count(&self) -> usize {
        self.keys.issued_count()
    }

    pub fn is_key_issued(&self, public_key: &str) -> bool {
        self.keys.is_issued(public_key)
    }
}

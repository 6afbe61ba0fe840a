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

//! Connection orchestration.
//!
//! A connect walks `Requested -> ServerValidated -> PeerCreated ->
//! LoadUpdated -> Completed`. If a step fails, the steps already taken are
//! compensated before the error is returned, so a failed connect never
//! leaves a tunnel without load accounting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wgfleet_types::{ConnectionStatus, DeviceClass, PeerView, ServerId, ServerStatus, ServerView, SessionInfo};

use crate::applier::InterfaceApplier;
use crate::error::{Error, ErrorKind};
use crate::peer_manager::PeerManager;
use crate::render::render_qr_png;
use crate::server_manager::{HealthProbe, ServerManager, TcpProbe};
use crate::store::PeerStore;
use crate::telemetry::{self, TelemetryEvent, TelemetrySink};

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub user_id: Uuid,
    pub server_id: ServerId,
    pub device_class: DeviceClass,
    pub device_name: Option<String>,
}

/// Result of a successful connect. Carries the only copy of the profile the
/// caller gets without asking again.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub peer: PeerView,
    pub config: String,
    /// PNG QR code of `config`, for phones.
    pub qr_png: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    Requested,
    ServerValidated,
    PeerCreated,
    LoadUpdated,
    Completed,
    /// Terminal failure state. Side effects of earlier stages are undone.
    Aborted,
}

impl ConnectStage {
    /// Move to `Aborted`, returning the stage the attempt had reached.
    fn abort(&mut self) -> ConnectStage {
        std::mem::replace(self, ConnectStage::Aborted)
    }
}

pub struct VpnManager<S, A, P = TcpProbe> {
    servers: Arc<ServerManager<P>>,
    peers: Arc<PeerManager<S, A>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl<S, A, P> VpnManager<S, A, P>
where
    S: PeerStore,
    A: InterfaceApplier,
    P: HealthProbe,
{
    pub fn new(
        servers: Arc<ServerManager<P>>,
        peers: Arc<PeerManager<S, A>>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self { servers, peers, telemetry }
    }

    pub fn servers(&self) -> &Arc<ServerManager<P>> {
        &self.servers
    }

    pub fn peers(&self) -> &Arc<PeerManager<S, A>> {
        &self.peers
    }

    fn record_error(&self, err: &Error) {
        self.telemetry
            .increment_counter(telemetry::ERRORS, err.kind().as_str(), 1);
    }

    fn publish_active(&self) {
        let active = i64::try_from(self.peers.active_count()).unwrap_or(i64::MAX);
        self.telemetry
            .set_gauge(telemetry::ACTIVE_CONNECTIONS, "", active);
    }

    /// Set every server's load from the peers actually restored. Call once
    /// after startup, before serving connects.
    pub fn restore_load_accounting(&self) {
        self.servers.sync_loads(&self.peers.active_counts_by_server());
        self.publish_active();
    }

    #[tracing::instrument(skip(self, req), fields(user_id = %req.user_id, server_id = %req.server_id))]
    pub async fn connect(&self, req: ConnectRequest) -> Result<Connection, Error> {
        self.establish(&req, None).await
    }

    /// Connect with a dynamic peer. `ttl` defaults to the configured lifetime.
    #[tracing::instrument(skip(self, req), fields(user_id = %req.user_id, server_id = %req.server_id))]
    pub async fn connect_dynamic(&self, req: ConnectRequest, ttl: Option<Duration>) -> Result<Connection, Error> {
        let ttl = ttl.unwrap_or(self.peers.settings().dynamic_ttl);
        self.establish(&req, Some(ttl)).await
    }

    /// Connect to whichever server [`ServerManager::select_optimal_server`] picks.
    #[tracing::instrument(skip(self))]
    pub async fn connect_optimal(
        &self,
        user_id: Uuid,
        preferred_location: Option<&str>,
        device_class: DeviceClass,
        device_name: Option<String>,
    ) -> Result<Connection, Error> {
        let server = self
            .servers
            .select_optimal_server(preferred_location)
            .inspect_err(|e| self.record_error(e))?;

        self.establish(
            &ConnectRequest {
                user_id,
                server_id: server.id,
                device_class,
                device_name,
            },
            None,
        )
        .await
    }

    async fn establish(&self, req: &ConnectRequest, ttl: Option<Duration>) -> Result<Connection, Error> {
        let mut stage = ConnectStage::Requested;
        match self.run_connect(req, ttl, &mut stage).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                let reached = stage.abort();
                warn!(?reached, ?stage, kind = %e.kind(), error = %e, "connect aborted");
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn run_connect(
        &self,
        req: &ConnectRequest,
        ttl: Option<Duration>,
        stage: &mut ConnectStage,
    ) -> Result<Connection, Error> {
        let server = self.servers.get_server(&req.server_id)?;
        if server.status != ServerStatus::Online {
            return Err(Error::ServerUnavailable {
                server_id: server.id,
                status: server.status,
            });
        }
        if server.load >= server.capacity {
            return Err(Error::CapacityExhausted(server.id));
        }
        *stage = ConnectStage::ServerValidated;

        let endpoint = server.endpoint();
        let device_name = req.device_name.as_deref().unwrap_or_default();
        let (peer, config) = match ttl {
            None => {
                self.peers
                    .create_peer(req.user_id, &endpoint, req.device_class, device_name)
                    .await?
            }
            Some(ttl) => {
                self.peers
                    .create_dynamic_peer(req.user_id, &endpoint, req.device_class, device_name, ttl)
                    .await?
            }
        };
        *stage = ConnectStage::PeerCreated;
        debug!(peer_id = %peer.id, ?stage, "connect progressed");

        if let Err(e) = self.servers.update_load(&server.id, 1) {
            warn!(peer_id = %peer.id, error = %e, "load update failed, rolling back peer");
            return Err(match self.peers.remove_peer(req.user_id, peer.id).await {
                Ok(_) => e,
                Err(rollback) => {
                    error!(
                        peer_id = %peer.id,
                        error = %rollback,
                        "could not roll back peer after failed load update"
                    );
                    self.telemetry
                        .increment_counter(telemetry::INCONSISTENCIES, "connect_rollback", 1);
                    Error::InconsistentState(format!(
                        "peer {} is live without load accounting ({e}); rollback failed: {rollback}",
                        peer.id
                    ))
                }
            });
        }
        *stage = ConnectStage::LoadUpdated;

        let qr_png = if peer.device_class.is_mobile() {
            match render_qr_png(&config) {
                Ok(png) => Some(png),
                Err(e) => {
                    warn!(peer_id = %peer.id, error = %e, "QR rendering failed, returning text config only");
                    None
                }
            }
        } else {
            None
        };

        self.telemetry.record_event(TelemetryEvent::new(
            Some(req.user_id),
            "vpn_connect",
            serde_json::json!({
                "server_id": server.id.as_str(),
                "peer_id": peer.id,
                "device_class": peer.device_class.as_str(),
                "kind": peer.kind.as_str(),
            }),
        ));
        self.telemetry
            .increment_counter(telemetry::CONNECTIONS_BY_DEVICE, peer.device_class.as_str(), 1);
        self.publish_active();

        *stage = ConnectStage::Completed;
        info!(peer_id = %peer.id, address = %peer.address, "connected");
        Ok(Connection {
            peer: peer.view(),
            config,
            qr_png,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self, user_id: Uuid, peer_id: Uuid) -> Result<PeerView, Error> {
        let peer = self
            .peers
            .remove_peer(user_id, peer_id)
            .await
            .inspect_err(|e| self.record_error(e))?;

        match self.servers.update_load(&peer.server_id, -1) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::InconsistentState => {
                error!(server_id = %peer.server_id, error = %e, "load accounting was already off");
            }
            Err(e) => {
                warn!(server_id = %peer.server_id, error = %e, "could not release server load");
                self.record_error(&e);
            }
        }

        self.telemetry.record_event(TelemetryEvent::new(
            Some(user_id),
            "vpn_disconnect",
            serde_json::json!({
                "server_id": peer.server_id.as_str(),
                "peer_id": peer.id,
                "kind": peer.kind.as_str(),
            }),
        ));
        self.publish_active();

        info!(server_id = %peer.server_id, "disconnected");
        Ok(peer.view())
    }

    pub async fn get_status(&self, user_id: Uuid) -> Result<ConnectionStatus, Error> {
        let peers = self.peers.list_peers(user_id).await?;

        let live = if peers.is_empty() {
            None
        } else {
            match self.peers.live_stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(%user_id, error = %e, "live stats unavailable");
                    None
                }
            }
        };

        let sessions: Vec<SessionInfo> = peers
            .iter()
            .map(|peer| SessionInfo {
                peer: peer.view(),
                server_name: self.servers.get_server(&peer.server_id).ok().map(|s| s.name),
                live: live.as_ref().and_then(|stats| stats.get(&peer.public_key).cloned()),
            })
            .collect();

        Ok(ConnectionStatus {
            connected: !sessions.is_empty(),
            sessions,
        })
    }

    pub async fn get_config(&self, user_id: Uuid, peer_id: Uuid) -> Result<String, Error> {
        let peer = self.peers.get_peer(user_id, peer_id).await?;
        let server = self.servers.get_server(&peer.server_id)?;
        self.peers.generate_config(&peer, &server.endpoint())
    }

    pub async fn get_qr(&self, user_id: Uuid, peer_id: Uuid) -> Result<Vec<u8>, Error> {
        let config = self.get_config(user_id, peer_id).await?;
        Ok(render_qr_png(&config)?)
    }

    pub fn list_servers(&self) -> Vec<ServerView> {
        self.servers.list_servers().iter().map(|s| s.view()).collect()
    }

    /// Remove a server that no active peer references.
    pub fn remove_server(&self, server_id: &ServerId) -> Result<ServerView, Error> {
        let peers = self.peers.active_count_for(server_id);
        if peers > 0 {
            return Err(Error::ServerInUse {
                server_id: server_id.clone(),
                peers,
            });
        }
        Ok(self.servers.remove_server(server_id)?.view())
    }

    /// Disconnect every dynamic peer whose lifetime ended by `now`. Returns
    /// how many were removed.
    pub async fn expire_dynamic_peers(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for (user_id, peer_id) in self.peers.expired_dynamic_peers(now) {
            match self.disconnect(user_id, peer_id).await {
                Ok(_) => expired += 1,
                Err(e) => warn!(%peer_id, error = %e, "could not expire dynamic peer"),
            }
        }
        if expired > 0 {
            info!(expired, "expired dynamic peers");
        }
        expired
    }
}

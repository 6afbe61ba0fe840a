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

//! Server fleet registry, load accounting and health checking.
//!
//! The registry lock is a `std::sync::RwLock` and is never held across an
//! await point. Health probes run on a snapshot of targets taken under the
//! read lock, so a hanging probe cannot stall selection or load updates.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use wgfleet_types::{ServerId, ServerStatus, ServerView};

use crate::error::{Error, Resource};
use crate::keys::decode_key;
use crate::peer::ServerEndpoint;
use crate::telemetry::{self, TelemetryEvent, TelemetrySink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub location: String,
    pub endpoint: String,
    pub public_key: String,
    pub subnet: Ipv4Network,
    pub capacity: u32,
    pub health_check: Option<String>,
    pub status: ServerStatus,
    pub load: u32,
    pub last_updated: DateTime<Utc>,
}

impl Server {
    pub fn view(&self) -> ServerView {
        ServerView {
            id: self.id.clone(),
            name: self.name.clone(),
            location: self.location.clone(),
            endpoint: self.endpoint.clone(),
            public_key: self.public_key.clone(),
            status: self.status,
            load: self.load,
            capacity: self.capacity,
            last_updated: self.last_updated,
        }
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            id: self.id.clone(),
            public_key: self.public_key.clone(),
            endpoint: self.endpoint.clone(),
            subnet: self.subnet,
        }
    }

    fn accepts_peers(&self) -> bool {
        self.status == ServerStatus::Online && self.load < self.capacity
    }
}

fn default_status() -> ServerStatus {
    ServerStatus::Online
}

/// Registration request for a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewServer {
    pub id: ServerId,
    pub name: String,
    pub location: String,
    pub endpoint: String,
    pub public_key: String,
    pub subnet: Ipv4Network,
    pub capacity: u32,
    #[serde(default)]
    pub health_check: Option<String>,
    #[serde(default = "default_status")]
    pub status: ServerStatus,
}

impl NewServer {
    fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::Validation(msg));

        if self.name.trim().is_empty() {
            return invalid(format!("server {} has an empty name", self.id));
        }
        if self.capacity == 0 {
            return invalid(format!("server {} must have a capacity above zero", self.id));
        }
        if self.subnet.prefix() > 30 {
            return invalid(format!("subnet {} of server {} has no room for peers", self.subnet, self.id));
        }
        if decode_key(&self.public_key).is_err() {
            return invalid(format!("server {} has an invalid public key", self.id));
        }
        let port_ok = self
            .endpoint
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p > 0));
        if !port_ok {
            return invalid(format!("endpoint {:?} of server {} is not host:port", self.endpoint, self.id));
        }
        if self.health_check.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return invalid(format!("server {} has an empty health check target", self.id));
        }
        Ok(())
    }
}

/// Reachability check for one `host:port` target.
pub trait HealthProbe: Send + Sync {
    fn probe(&self, target: &str) -> impl Future<Output = bool> + Send;
}

/// Healthy when a TCP connection to the target can be opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl HealthProbe for TcpProbe {
    async fn probe(&self, target: &str) -> bool {
        match TcpStream::connect(target).await {
            Ok(_) => true,
            Err(e) => {
                debug!(target, error = %e, "health probe failed");
                false
            }
        }
    }
}

pub struct ServerManager<P = TcpProbe> {
    servers: RwLock<BTreeMap<ServerId, Server>>,
    probe: P,
    probe_timeout: Duration,
    telemetry: Arc<dyn TelemetrySink>,
}

impl<P: HealthProbe> ServerManager<P> {
    pub fn new(probe: P, probe_timeout: Duration, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            servers: RwLock::new(BTreeMap::new()),
            probe,
            probe_timeout,
            telemetry,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ServerId, Server>> {
        self.servers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ServerId, Server>> {
        self.servers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_server(&self, id: &ServerId) -> Result<Server, Error> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(Resource::Server(id.clone())))
    }

    /// All servers ordered by id.
    pub fn list_servers(&self) -> Vec<Server> {
        self.read().values().cloned().collect()
    }

    pub fn subnets(&self) -> BTreeMap<ServerId, Ipv4Network> {
        self.read().iter().map(|(id, s)| (id.clone(), s.subnet)).collect()
    }

    #[tracing::instrument(skip(self, new), fields(server_id = %new.id))]
    pub fn add_server(&self, new: NewServer) -> Result<Server, Error> {
        new.validate()?;

        let server = Server {
            id: new.id,
            name: new.name.trim().to_string(),
            location: new.location.trim().to_string(),
            endpoint: new.endpoint,
            public_key: new.public_key,
            subnet: new.subnet,
            capacity: new.capacity,
            health_check: new.health_check,
            status: new.status,
            load: 0,
            last_updated: Utc::now(),
        };

        {
            let mut servers = self.write();
            if servers.contains_key(&server.id) {
                return Err(Error::DuplicateServer(server.id));
            }
            servers.insert(server.id.clone(), server.clone());
        }

        info!(
            name = %server.name,
            location = %server.location,
            subnet = %server.subnet,
            capacity = server.capacity,
            "server registered"
        );
        self.telemetry.set_gauge(telemetry::SERVER_LOAD, server.id.as_str(), 0);
        Ok(server)
    }

    /// Remove a server with no load. Peer references are checked by the caller.
    #[tracing::instrument(skip(self))]
    pub fn remove_server(&self, id: &ServerId) -> Result<Server, Error> {
        let removed = {
            let mut servers = self.write();
            let server = servers
                .get(id)
                .ok_or_else(|| Error::NotFound(Resource::Server(id.clone())))?;
            if server.load > 0 {
                return Err(Error::ServerInUse {
                    server_id: id.clone(),
                    peers: server.load as usize,
                });
            }
            servers.remove(id)
        };
        let removed = removed.ok_or_else(|| Error::NotFound(Resource::Server(id.clone())))?;
        info!("server removed");
        Ok(removed)
    }

    #[tracing::instrument(skip(self))]
    pub fn update_status(&self, id: &ServerId, status: ServerStatus) -> Result<(), Error> {
        let previous = {
            let mut servers = self.write();
            let server = servers
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(Resource::Server(id.clone())))?;
            let previous = server.status;
            if previous != status {
                server.status = status;
                server.last_updated = Utc::now();
            }
            previous
        };

        if previous != status {
            self.status_changed(id, previous, status);
        }
        Ok(())
    }

    fn status_changed(&self, id: &ServerId, from: ServerStatus, to: ServerStatus) {
        match to {
            ServerStatus::Offline => warn!(server_id = %id, %from, %to, "server status changed"),
            _ => info!(server_id = %id, %from, %to, "server status changed"),
        }
        self.telemetry.record_event(TelemetryEvent::new(
            None,
            "server_status_changed",
            serde_json::json!({ "server_id": id.as_str(), "from": from.as_str(), "to": to.as_str() }),
        ));
    }

    /// Apply `delta` to a server's load and return the new load.
    ///
    /// Growing past capacity is refused and leaves the load untouched. Shrinking
    /// below zero clamps to zero and reports `InconsistentState`, since it means
    /// a release happened without a matching acquire.
    #[tracing::instrument(skip(self))]
    pub fn update_load(&self, id: &ServerId, delta: i32) -> Result<u32, Error> {
        let (load, underflow) = {
            let mut servers = self.write();
            let server = servers
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(Resource::Server(id.clone())))?;

            let next = i64::from(server.load) + i64::from(delta);
            if delta > 0 && next > i64::from(server.capacity) {
                return Err(Error::CapacityExhausted(id.clone()));
            }
            let underflow = next < 0;
            server.load = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
            server.last_updated = Utc::now();
            (server.load, underflow)
        };

        self.telemetry
            .set_gauge(telemetry::SERVER_LOAD, id.as_str(), i64::from(load));

        if underflow {
            error!(server_id = %id, delta, "server load would go negative, clamped to zero");
            self.telemetry
                .increment_counter(telemetry::INCONSISTENCIES, "server_load", 1);
            return Err(Error::InconsistentState(format!(
                "load of server {id} would go negative (delta {delta})"
            )));
        }

        debug!(server_id = %id, load, "server load updated");
        Ok(load)
    }

    /// Overwrite loads from authoritative peer counts. Servers missing from
    /// `counts` get zero.
    pub fn sync_loads(&self, counts: &BTreeMap<ServerId, u32>) {
        let loads: Vec<(ServerId, u32)> = {
            let mut servers = self.write();
            servers
                .values_mut()
                .map(|server| {
                    let load = counts.get(&server.id).copied().unwrap_or(0);
                    if load > server.capacity {
                        warn!(
                            server_id = %server.id,
                            load,
                            capacity = server.capacity,
                            "restored load exceeds capacity"
                        );
                    }
                    if server.load != load {
                        server.load = load;
                        server.last_updated = Utc::now();
                    }
                    (server.id.clone(), load)
                })
                .collect()
        };

        for (id, load) in &loads {
            self.telemetry
                .set_gauge(telemetry::SERVER_LOAD, id.as_str(), i64::from(*load));
        }
        for (id, _) in counts {
            if !loads.iter().any(|(known, _)| known == id) {
                error!(server_id = %id, "peers reference a server that is not registered");
            }
        }
        info!(servers = loads.len(), "server loads synchronised");
    }

    /// Pick the online server with spare capacity and the lowest load.
    ///
    /// A preferred location narrows the candidates when it has any; otherwise
    /// the whole fleet is considered. Ties go to the lowest server id.
    #[tracing::instrument(skip(self))]
    pub fn select_optimal_server(&self, preferred_location: Option<&str>) -> Result<Server, Error> {
        let servers = self.read();
        let available: Vec<&Server> = servers.values().filter(|s| s.accepts_peers()).collect();

        let candidates = match preferred_location.map(str::trim).filter(|l| !l.is_empty()) {
            Some(location) => {
                let local: Vec<&Server> = available
                    .iter()
                    .copied()
                    .filter(|s| s.location.eq_ignore_ascii_case(location))
                    .collect();
                if local.is_empty() {
                    warn!(location, "no available server in preferred location, using whole fleet");
                    available
                } else {
                    local
                }
            }
            None => available,
        };

        let selected = candidates
            .into_iter()
            .min_by_key(|s| s.load)
            .cloned()
            .ok_or(Error::NoAvailableServer)?;
        debug!(server_id = %selected.id, load = selected.load, "selected server");
        Ok(selected)
    }

    /// Probe every eligible server once and apply status transitions.
    /// Returns the transitions that happened.
    pub async fn check_health(&self) -> Vec<(ServerId, ServerStatus)> {
        let targets: Vec<(ServerId, String)> = self
            .read()
            .values()
            .filter(|s| s.status != ServerStatus::Maintenance)
            .filter_map(|s| s.health_check.clone().map(|t| (s.id.clone(), t)))
            .collect();

        let results = join_all(targets.iter().map(|(id, target)| async move {
            let healthy = match tokio::time::timeout(self.probe_timeout, self.probe.probe(target)).await {
                Ok(healthy) => healthy,
                Err(_) => {
                    warn!(server_id = %id, target, timeout = ?self.probe_timeout, "health probe timed out");
                    false
                }
            };
            (id.clone(), healthy)
        }))
        .await;

        let mut transitions = Vec::new();
        {
            let mut servers = self.write();
            for (id, healthy) in results {
                let Some(server) = servers.get_mut(&id) else {
                    continue;
                };
                if server.status == ServerStatus::Maintenance {
                    continue;
                }
                let next = if healthy {
                    ServerStatus::Online
                } else {
                    ServerStatus::Offline
                };
                if server.status != next {
                    transitions.push((id, server.status, next));
                    server.status = next;
                    server.last_updated = Utc::now();
                }
            }
        }

        transitions
            .into_iter()
            .map(|(id, from, to)| {
                self.status_changed(&id, from, to);
                (id, to)
            })
            .collect()
    }

    pub async fn run_health_loop(&self, interval: Duration) {
        info!(?interval, probe_timeout = ?self.probe_timeout, "starting health loop");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let transitions = self.check_health().await;
            debug!(transitions = transitions.len(), "health check complete");
        }
    }
}

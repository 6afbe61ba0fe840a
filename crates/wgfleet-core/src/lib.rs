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

//! Peer lifecycle, server fleet, and connection orchestration for a
//! WireGuard VPN service.

pub mod applier;
pub mod error;
pub mod keys;
pub mod maintenance;
pub mod peer;
pub mod peer_manager;
pub mod pool;
pub mod render;
pub mod server_manager;
pub mod store;
pub mod telemetry;
pub mod vpn_manager;

pub use applier::{ApplyError, InterfaceApplier, handshake_is_recent};
pub use error::{Error, ErrorKind, ReconcileFailure, Resource};
pub use peer::{Peer, ServerEndpoint};
pub use peer_manager::{PeerManager, PeerSettings};
pub use render::{ConfigRenderer, TunnelSettings, render_qr_png};
pub use server_manager::{HealthProbe, NewServer, Server, ServerManager, TcpProbe};
pub use store::{FileStore, KeySealer, PeerStore, PgStore, StoreError};
pub use telemetry::{TelemetryEvent, TelemetrySink};
pub use vpn_manager::{ConnectRequest, ConnectStage, Connection, VpnManager};

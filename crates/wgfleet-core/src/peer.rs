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

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use uuid::Uuid;
use wgfleet_types::{DeviceClass, PeerKind, PeerView, ServerId};

use crate::keys::PrivateKey;

/// A provisioned tunnel endpoint. Only the core ever sees the private key.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub server_id: ServerId,
    pub device_class: DeviceClass,
    pub device_name: String,
    pub public_key: String,
    pub(crate) private_key: PrivateKey,
    pub address: Ipv4Addr,
    pub kind: PeerKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Peer {
    pub fn view(&self) -> PeerView {
        PeerView {
            id: self.id,
            user_id: self.user_id,
            server_id: self.server_id.clone(),
            device_class: self.device_class,
            device_name: self.device_name.clone(),
            public_key: self.public_key.clone(),
            address: self.address.to_string(),
            kind: self.kind,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_handshake: self.last_handshake,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub id: ServerId,
    pub public_key: String,
    /// `host:port` handed to clients.
    pub endpoint: String,
    /// Tunnel subnet; `.1` is the server itself.
    pub subnet: Ipv4Network,
}

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

//! Types exchanged with the tunnel engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ServerId;

/// One entry of the desired peer set pushed to a live interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelPeer {
    /// Server whose interface carries this peer.
    pub server_id: ServerId,
    /// Base64 WireGuard public key.
    pub public_key: String,
    /// CIDRs routed to this peer (its tunnel address as a /32).
    pub allowed_ips: Vec<String>,
    /// Keepalive interval in seconds, 0 disables it.
    #[serde(default)]
    pub persistent_keepalive: u16,
}

/// Live counters reported by the tunnel engine for one public key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStats {
    /// Whether a handshake completed recently enough to count as connected.
    pub connected: bool,
    /// Bytes received from the peer.
    pub bytes_rx: u64,
    /// Bytes sent to the peer.
    pub bytes_tx: u64,
    /// Time of the most recent handshake, if any.
    pub last_handshake: Option<DateTime<Utc>>,
}

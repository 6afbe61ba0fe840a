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

//! wgfleet-types: Shared type definitions for the wgfleet ecosystem.
//!
//! This crate contains the data models shared between the core managers,
//! the daemon, and whatever API layer sits in front of them. Nothing in here
//! carries private key material.

#![warn(missing_docs)]

pub mod tunnel;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use tunnel::{LiveStats, TunnelPeer};

/// Error returned when a string is not a valid [`ServerId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid server id {0:?}: expected 1-64 chars of [a-z0-9._-]")]
pub struct InvalidServerId(pub String);

/// Identifier of a VPN server, e.g. `eu-west-1`.
///
/// Ordering is lexicographic; server selection breaks load ties by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerId(String);

impl ServerId {
    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServerId {
    type Error = InvalidServerId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let valid = !value.is_empty()
            && value.len() <= 64
            && value
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b));
        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidServerId(value))
        }
    }
}

impl FromStr for ServerId {
    type Err = InvalidServerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<ServerId> for String {
    fn from(id: ServerId) -> Self {
        id.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operational status of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Accepting new peers.
    Online,
    /// Failed its last health probe.
    Offline,
    /// Taken out of rotation by an operator; not probed.
    Maintenance,
}

impl ServerStatus {
    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of device a peer was provisioned for. Only affects the rendered template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Android phones and tablets.
    Android,
    /// iPhone and iPad.
    Ios,
    /// Windows desktops.
    Windows,
    /// macOS desktops.
    Macos,
    /// Linux desktops and servers.
    Linux,
    /// Anything else.
    Generic,
}

impl DeviceClass {
    /// Parse a client-supplied device type, falling back to [`DeviceClass::Generic`].
    pub fn parse_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Self::Android,
            "ios" | "iphone" | "ipad" => Self::Ios,
            "windows" => Self::Windows,
            "mac" | "macos" => Self::Macos,
            "linux" => Self::Linux,
            _ => Self::Generic,
        }
    }

    /// Whether profiles for this class are provisioned by scanning a QR code.
    pub fn is_mobile(self) -> bool {
        matches!(self, Self::Android | Self::Ios)
    }

    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Windows => "windows",
            Self::Macos => "macos",
            Self::Linux => "linux",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage namespace of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    /// Explicitly provisioned, lives until removed.
    Static,
    /// Session-bound, removed by the expiry sweep once `expires_at` passes.
    Dynamic,
}

impl PeerKind {
    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A VPN server as shown to clients and operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerView {
    /// Unique identifier.
    pub id: ServerId,
    /// Human-readable name (e.g. "EU (Ireland)").
    pub name: String,
    /// Location or country used for placement preferences.
    pub location: String,
    /// Endpoint clients connect to (host:port).
    pub endpoint: String,
    /// WireGuard public key of the server.
    pub public_key: String,
    /// Current status.
    pub status: ServerStatus,
    /// Number of active peers.
    pub load: u32,
    /// Maximum number of peers.
    pub capacity: u32,
    /// Last time status or load changed.
    pub last_updated: DateTime<Utc>,
}

/// A peer as shown outside the core. Has no private key field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerView {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Server this peer tunnels through.
    pub server_id: ServerId,
    /// Device class the profile was rendered for.
    pub device_class: DeviceClass,
    /// Human-readable device name (e.g. "Dad's laptop").
    pub device_name: String,
    /// WireGuard public key.
    pub public_key: String,
    /// Assigned tunnel address.
    pub address: String,
    /// Static or dynamic.
    pub kind: PeerKind,
    /// When this peer was created.
    pub created_at: DateTime<Utc>,
    /// Last metadata update.
    pub updated_at: DateTime<Utc>,
    /// Most recent handshake seen by the tunnel engine.
    pub last_handshake: Option<DateTime<Utc>>,
    /// Expiry of a dynamic peer.
    pub expires_at: Option<DateTime<Utc>>,
}

/// One active session of a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// The peer backing this session.
    pub peer: PeerView,
    /// Name of the server, if it is still registered.
    pub server_name: Option<String>,
    /// Live counters, if the tunnel engine could be queried.
    pub live: Option<LiveStats>,
}

/// A user's VPN status. Connected means at least one active peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether the user has at least one active peer.
    pub connected: bool,
    /// All active sessions, static peers first.
    pub sessions: Vec<SessionInfo>,
}

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

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use wgfleet_core::keys::decode_key;
use wgfleet_core::peer_manager::PeerSettings;
use wgfleet_core::render::TunnelSettings;
use wgfleet_core::server_manager::NewServer;
use wgfleet_types::ServerId;

/// Environment variable that overrides `key_secret`.
pub const KEY_SECRET_ENV: &str = "WGFLEET_KEY_SECRET";

/// Longest Linux interface name.
const MAX_IFNAME: usize = 15;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate server id: {0}")]
    DuplicateServer(ServerId),

    #[error("duplicate interface name: {0}")]
    DuplicateInterface(String),

    #[error("interface {interface} refers to unknown server {server_id}")]
    UnknownServer { interface: String, server_id: ServerId },

    #[error("invalid interface {name}: {reason}")]
    InvalidInterface { name: String, reason: String },

    #[error("invalid key secret: {0}")]
    InvalidSecret(String),

    #[error("no key secret configured (set key_secret or {KEY_SECRET_ENV})")]
    MissingSecret,

    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Default, Deserialize)]
pub struct DaemonToml {
    /// 64 hex characters. Seals peer private keys at rest.
    #[serde(default)]
    pub key_secret: Option<String>,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub maintenance: MaintenanceSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub servers: Vec<NewServer>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceEntry>,
}

impl fmt::Debug for DaemonToml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonToml")
            .field("key_secret", &self.key_secret.as_ref().map(|_| "<redacted>"))
            .field("storage", &self.storage)
            .field("tunnel", &self.tunnel)
            .field("health", &self.health)
            .field("maintenance", &self.maintenance)
            .field("telemetry", &self.telemetry)
            .field("servers", &self.servers)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageSection {
    File {
        #[serde(default = "default_store_path")]
        path: PathBuf,
    },
    Postgres {
        database_url: String,
    },
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/wgfleet/peers")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self::File { path: default_store_path() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    #[serde(flatten)]
    pub settings: TunnelSettings,
    pub reconcile_timeout_secs: u64,
    pub dynamic_ttl_secs: u64,
}

impl Default for TunnelSection {
    fn default() -> Self {
        let defaults = PeerSettings::default();
        Self {
            settings: defaults.tunnel,
            reconcile_timeout_secs: defaults.reconcile_timeout.as_secs(),
            dynamic_ttl_secs: defaults.dynamic_ttl.as_secs(),
        }
    }
}

impl TunnelSection {
    pub fn peer_settings(&self) -> PeerSettings {
        PeerSettings {
            tunnel: self.settings.clone(),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            dynamic_ttl: Duration::from_secs(self.dynamic_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_timeout_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    pub interval_secs: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetrySection {
    /// JSON-lines event log. Disabled when absent.
    #[serde(default)]
    pub analytics_log: Option<PathBuf>,
}

/// A WireGuard interface hosted on this machine for one server.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct InterfaceEntry {
    pub server_id: ServerId,
    pub name: String,
    /// Base64 WireGuard private key of the server.
    pub private_key: String,
    pub listen_port: u16,
    /// The server's own tunnel address with the subnet prefix, e.g. `10.8.0.1/24`.
    pub address: Ipv4Network,
}

impl fmt::Debug for InterfaceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceEntry")
            .field("server_id", &self.server_id)
            .field("name", &self.name)
            .field("private_key", &"<redacted>")
            .field("listen_port", &self.listen_port)
            .field("address", &self.address)
            .finish()
    }
}

pub async fn load(path: &Path) -> Result<DaemonToml, ConfigError> {
    debug!(path = %path.display(), "loading config");

    let config = match tokio::fs::read_to_string(path).await {
        Ok(contents) => toml::from_str::<DaemonToml>(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            DaemonToml::default()
        }
        Err(e) => return Err(ConfigError::Read(e)),
    };

    config.validate()?;
    info!(
        path = %path.display(),
        server_count = config.servers.len(),
        interface_count = config.interfaces.len(),
        "loaded config"
    );
    for iface in &config.interfaces {
        debug!(interface = %iface.name, server_id = %iface.server_id, "registered interface");
    }
    Ok(config)
}

impl DaemonToml {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |value: u64, name: &str| {
            if value == 0 {
                Err(ConfigError::Invalid(format!("{name} must be above zero")))
            } else {
                Ok(())
            }
        };
        positive(self.tunnel.reconcile_timeout_secs, "tunnel.reconcile_timeout_secs")?;
        positive(self.tunnel.dynamic_ttl_secs, "tunnel.dynamic_ttl_secs")?;
        positive(self.health.interval_secs, "health.interval_secs")?;
        positive(self.health.probe_timeout_secs, "health.probe_timeout_secs")?;
        positive(self.maintenance.interval_secs, "maintenance.interval_secs")?;

        if let StorageSection::Postgres { database_url } = &self.storage {
            if database_url.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.database_url is empty".into()));
            }
        }

        if let Some(secret) = &self.key_secret {
            parse_hex_32(secret)?;
        }

        let mut server_ids = HashSet::new();
        for server in &self.servers {
            if !server_ids.insert(&server.id) {
                return Err(ConfigError::DuplicateServer(server.id.clone()));
            }
        }

        let mut names = HashSet::new();
        let mut hosted = HashSet::new();
        for iface in &self.interfaces {
            let invalid = |reason: &str| ConfigError::InvalidInterface {
                name: iface.name.clone(),
                reason: reason.to_string(),
            };

            if !names.insert(iface.name.as_str()) {
                return Err(ConfigError::DuplicateInterface(iface.name.clone()));
            }
            if iface.name.is_empty() || iface.name.len() > MAX_IFNAME {
                return Err(invalid("name must be 1 to 15 characters"));
            }
            let server = self
                .servers
                .iter()
                .find(|s| s.id == iface.server_id)
                .ok_or_else(|| ConfigError::UnknownServer {
                    interface: iface.name.clone(),
                    server_id: iface.server_id.clone(),
                })?;
            if !hosted.insert(&iface.server_id) {
                return Err(invalid("server already has an interface"));
            }
            if decode_key(&iface.private_key).is_err() {
                return Err(invalid("private key is not a base64 32-byte key"));
            }
            if iface.listen_port == 0 {
                return Err(invalid("listen_port must be above zero"));
            }
            if iface.address.prefix() != server.subnet.prefix() || !server.subnet.contains(iface.address.ip()) {
                return Err(invalid("address is outside the server subnet"));
            }
        }

        Ok(())
    }

    /// The sealing secret, preferring `env_override` over the file.
    pub fn key_secret(&self, env_override: Option<&str>) -> Result<[u8; 32], ConfigError> {
        match env_override.or(self.key_secret.as_deref()) {
            Some(secret) => parse_hex_32(secret),
            None => Err(ConfigError::MissingSecret),
        }
    }
}

pub fn parse_hex_32(s: &str) -> Result<[u8; 32], ConfigError> {
    let s = s.trim();
    if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidSecret("expected 64 hex characters".into()));
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|e| ConfigError::InvalidSecret(e.to_string()))?;
    }
    Ok(out)
}

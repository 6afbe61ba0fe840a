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

use std::collections::HashMap;
use std::net::IpAddr;

use thiserror::Error;
use wgfleet_core::applier::{ApplyError, InterfaceApplier};
use wgfleet_core::keys::KeyError;
use wgfleet_types::{LiveStats, TunnelPeer};

use crate::config::InterfaceEntry;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("invalid key: {0}")]
    Key(#[from] KeyError),

    #[error("IP address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("CIDR parse error: {0}")]
    CidrParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PlatformError> for ApplyError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Unsupported => Self::Unsupported,
            PlatformError::Key(e) => Self::InvalidKey(e.to_string()),
            PlatformError::Io(e) => Self::Io(e),
            other => Self::Interface(other.to_string()),
        }
    }
}

#[cfg(target_os = "linux")]
pub type CurrentApplier = linux::LinuxApplier;

#[cfg(not(target_os = "linux"))]
pub type CurrentApplier = StubApplier;

// -- Helper utilities --

pub fn parse_cidr(s: &str) -> Result<(IpAddr, u8), PlatformError> {
    let (addr_str, prefix_str) = s
        .split_once('/')
        .ok_or_else(|| PlatformError::CidrParse(s.to_string()))?;
    let addr: IpAddr = addr_str.parse()?;
    let prefix: u8 = prefix_str
        .parse()
        .ok()
        .filter(|p| *p <= if addr.is_ipv4() { 32 } else { 128 })
        .ok_or_else(|| PlatformError::CidrParse(s.to_string()))?;
    Ok((addr, prefix))
}

/// Split the desired set by local interface, in interface order. Peers of
/// servers this host does not carry are left out.
pub fn plan<'a>(
    interfaces: &'a [InterfaceEntry],
    peers: &'a [TunnelPeer],
) -> Vec<(&'a InterfaceEntry, Vec<&'a TunnelPeer>)> {
    interfaces
        .iter()
        .map(|iface| {
            let carried = peers.iter().filter(|p| p.server_id == iface.server_id).collect();
            (iface, carried)
        })
        .collect()
}

// -- Stub applier for non-Linux --

pub struct StubApplier;

impl StubApplier {
    pub fn new(_interfaces: Vec<InterfaceEntry>) -> Self {
        Self
    }
}

impl InterfaceApplier for StubApplier {
    async fn reconcile(&self, _peers: &[TunnelPeer]) -> Result<(), ApplyError> {
        Err(ApplyError::Unsupported)
    }

    async fn query_live_stats(&self) -> Result<HashMap<String, LiveStats>, ApplyError> {
        Err(ApplyError::Unsupported)
    }
}

// -- Linux implementation --

#[cfg(target_os = "linux")]
pub mod linux {
    use std::collections::{HashMap, HashSet};
    use std::net::IpAddr;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use chrono::{DateTime, Utc};
    use futures::TryStreamExt;
    use ipnetwork::Ipv4Network;
    use tracing::{debug, info};
    use wgfleet_core::applier::{ApplyError, InterfaceApplier, handshake_is_recent};
    use wgfleet_core::keys::decode_key;
    use wgfleet_types::{LiveStats, TunnelPeer};
    use wireguard_uapi::{DeviceInterface, RouteSocket, WgSocket, set};

    use super::{PlatformError, parse_cidr, plan};
    use crate::config::InterfaceEntry;

    /// Drives one WireGuard interface per locally hosted server.
    pub struct LinuxApplier {
        interfaces: Vec<InterfaceEntry>,
        /// Interfaces whose address and link state were set by this process.
        prepared: Mutex<HashSet<String>>,
    }

    impl LinuxApplier {
        pub fn new(interfaces: Vec<InterfaceEntry>) -> Self {
            Self {
                interfaces,
                prepared: Mutex::new(HashSet::new()),
            }
        }

        fn is_prepared(&self, name: &str) -> bool {
            self.prepared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(name)
        }

        fn mark_prepared(&self, name: &str) {
            self.prepared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string());
        }

        async fn apply(&self, iface: &InterfaceEntry, peers: &[&TunnelPeer]) -> Result<(), PlatformError> {
            let created = ensure_interface(&iface.name)?;
            apply_device_config(iface, peers)?;
            if created || !self.is_prepared(&iface.name) {
                assign_address(&iface.name, iface.address).await?;
                set_link_up(&iface.name).await?;
                self.mark_prepared(&iface.name);
            }
            info!(interface = %iface.name, server_id = %iface.server_id, peers = peers.len(), "applied peer set");
            Ok(())
        }
    }

    impl InterfaceApplier for LinuxApplier {
        async fn reconcile(&self, peers: &[TunnelPeer]) -> Result<(), ApplyError> {
            let carried: usize = plan(&self.interfaces, peers).iter().map(|(_, p)| p.len()).sum();
            if carried < peers.len() {
                debug!(
                    skipped = peers.len() - carried,
                    "peers of servers without a local interface were skipped"
                );
            }
            for (iface, peers) in plan(&self.interfaces, peers) {
                self.apply(iface, &peers).await?;
            }
            Ok(())
        }

        async fn query_live_stats(&self) -> Result<HashMap<String, LiveStats>, ApplyError> {
            let mut wg = WgSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
            let now = Utc::now();
            let mut stats = HashMap::new();

            for iface in &self.interfaces {
                let device = wg
                    .get_device(DeviceInterface::from_name(iface.name.as_str()))
                    .map_err(|e| PlatformError::Interface(format!("{}: {e}", iface.name)))?;
                for peer in device.peers {
                    let last_handshake = handshake_time(peer.last_handshake_time);
                    stats.insert(
                        BASE64.encode(peer.public_key),
                        LiveStats {
                            connected: handshake_is_recent(last_handshake, now),
                            bytes_rx: peer.rx_bytes,
                            bytes_tx: peer.tx_bytes,
                            last_handshake,
                        },
                    );
                }
            }
            Ok(stats)
        }
    }

    /// The kernel reports "never" as the epoch.
    fn handshake_time(since_epoch: Duration) -> Option<DateTime<Utc>> {
        if since_epoch.is_zero() {
            return None;
        }
        let secs = i64::try_from(since_epoch.as_secs()).ok()?;
        DateTime::from_timestamp(secs, since_epoch.subsec_nanos())
    }

    /// Create the interface if missing. Returns whether it was created.
    fn ensure_interface(name: &str) -> Result<bool, PlatformError> {
        let mut route = RouteSocket::connect()
            .map_err(|e| PlatformError::Interface(e.to_string()))?;
        let existing = route.list_device_names()
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        if existing.iter().any(|n| n == name) {
            debug!(interface = name, "interface already exists");
            return Ok(false);
        }

        info!(interface = name, "creating wireguard interface");
        route.add_device(name)
            .map_err(|e| PlatformError::Interface(e.to_string()))?;
        Ok(true)
    }

    struct PeerOwned {
        pub_key: [u8; 32],
        allowed_ips: Vec<(IpAddr, u8)>,
        persistent_keepalive: u16,
    }

    fn apply_device_config(iface: &InterfaceEntry, peers: &[&TunnelPeer]) -> Result<(), PlatformError> {
        let private_key = decode_key(&iface.private_key)?;

        let peer_data: Vec<PeerOwned> = peers
            .iter()
            .map(|p| {
                let pub_key = decode_key(&p.public_key)?;
                let allowed_ips: Vec<(IpAddr, u8)> = p
                    .allowed_ips
                    .iter()
                    .map(|ip| parse_cidr(ip))
                    .collect::<Result<_, _>>()?;
                Ok(PeerOwned {
                    pub_key,
                    allowed_ips,
                    persistent_keepalive: p.persistent_keepalive,
                })
            })
            .collect::<Result<_, PlatformError>>()?;

        let set_peers: Vec<set::Peer<'_>> = peer_data
            .iter()
            .map(|p| {
                let mut peer = set::Peer::from_public_key(&p.pub_key)
                    .flags(vec![set::WgPeerF::ReplaceAllowedIps]);

                let allowed: Vec<set::AllowedIp<'_>> = p
                    .allowed_ips
                    .iter()
                    .map(|(addr, cidr)| {
                        let mut aip = set::AllowedIp::from_ipaddr(addr);
                        aip.cidr_mask = Some(*cidr);
                        aip
                    })
                    .collect();

                if p.persistent_keepalive > 0 {
                    peer = peer.persistent_keepalive_interval(p.persistent_keepalive);
                }

                peer.allowed_ips(allowed)
            })
            .collect();

        let dev = set::Device::from_ifname(iface.name.as_str())
            .private_key(&private_key)
            .listen_port(iface.listen_port)
            .flags(vec![set::WgDeviceF::ReplacePeers])
            .peers(set_peers);

        let mut wg = WgSocket::connect()
            .map_err(|e| PlatformError::Interface(e.to_string()))?;
        wg.set_device(dev)
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        debug!(
            interface = %iface.name,
            listen_port = iface.listen_port,
            peer_count = peers.len(),
            "applied wireguard device config"
        );
        Ok(())
    }

    /// Resolve interface name to its index via rtnetlink.
    async fn get_link_index(
        handle: &rtnetlink::Handle,
        name: &str,
    ) -> Result<u32, PlatformError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?
            .ok_or_else(|| PlatformError::Interface(format!("interface {name} not found")))?;
        Ok(link.header.index)
    }

    async fn assign_address(name: &str, address: Ipv4Network) -> Result<(), PlatformError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let existing: Vec<_> = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        for addr_msg in existing {
            handle
                .address()
                .del(addr_msg)
                .execute()
                .await
                .map_err(|e| PlatformError::Interface(e.to_string()))?;
        }
        debug!(interface = name, "flushed existing addresses");

        handle
            .address()
            .add(index, IpAddr::V4(address.ip()), address.prefix())
            .execute()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        info!(interface = name, %address, "assigned address via netlink");
        Ok(())
    }

    async fn set_link_up(name: &str) -> Result<(), PlatformError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let msg = rtnetlink::LinkUnspec::new_with_index(index)
            .up()
            .build();
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        info!(interface = name, "set link up via netlink");
        Ok(())
    }

}

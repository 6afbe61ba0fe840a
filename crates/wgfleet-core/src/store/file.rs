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

use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;
use wgfleet_types::{DeviceClass, PeerKind, ServerId};

use super::{KeySealer, LockedPeer, PeerStore, Scan, StoreError};
use crate::keys::PrivateKey;
use crate::peer::Peer;

/// On-disk form of a peer. The private key only appears sealed.
#[derive(Debug, Serialize, Deserialize)]
struct PeerRecord {
    id: Uuid,
    user_id: Uuid,
    server_id: ServerId,
    device_class: DeviceClass,
    device_name: String,
    public_key: String,
    private_key_enc: String,
    private_key_nonce: String,
    address: Ipv4Addr,
    kind: PeerKind,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    last_handshake: Option<DateTime<Utc>>,
    #[serde(default)]
    bytes_rx: u64,
    #[serde(default)]
    bytes_tx: u64,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// JSON files under `<root>/<static|dynamic>/<user_id>/<peer_id>.json`.
impl PeerRecord {
    fn into_peer(self, private_key: PrivateKey) -> Peer {
        Peer {
            id: self.id,
            user_id: self.user_id,
            server_id: self.server_id,
            device_class: self.device_class,
            device_name: self.device_name,
            public_key: self.public_key,
            private_key,
            address: self.address,
            kind: self.kind,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_handshake: self.last_handshake,
            bytes_rx: self.bytes_rx,
            bytes_tx: self.bytes_tx,
            expires_at: self.expires_at,
        }
    }

    fn into_locked(self, reason: String) -> LockedPeer {
        LockedPeer {
            id: self.id,
            user_id: self.user_id,
            server_id: self.server_id,
            public_key: self.public_key,
            address: self.address,
            kind: self.kind,
            expires_at: self.expires_at,
            reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    sealer: KeySealer,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>, sealer: KeySealer) -> Result<Self, StoreError> {
        let root = root.into();
        for kind in [PeerKind::Static, PeerKind::Dynamic] {
            tokio::fs::create_dir_all(root.join(kind.as_str())).await?;
        }
        info!(root = %root.display(), "opened file peer store");
        Ok(Self { root, sealer })
    }

    fn user_dir(&self, kind: PeerKind, user_id: Uuid) -> PathBuf {
        self.root.join(kind.as_str()).join(user_id.to_string())
    }

    fn peer_path(&self, kind: PeerKind, user_id: Uuid, peer_id: Uuid) -> PathBuf {
        self.user_dir(kind, user_id).join(format!("{peer_id}.json"))
    }

    fn encode(&self, peer: &Peer) -> Result<PeerRecord, StoreError> {
        let sealed = self.sealer.seal(&peer.private_key)?;
        Ok(PeerRecord {
            id: peer.id,
            user_id: peer.user_id,
            server_id: peer.server_id.clone(),
            device_class: peer.device_class,
            device_name: peer.device_name.clone(),
            public_key: peer.public_key.clone(),
            private_key_enc: BASE64.encode(&sealed.ciphertext),
            private_key_nonce: BASE64.encode(&sealed.nonce),
            address: peer.address,
            kind: peer.kind,
            created_at: peer.created_at,
            updated_at: peer.updated_at,
            last_handshake: peer.last_handshake,
            bytes_rx: peer.bytes_rx,
            bytes_tx: peer.bytes_tx,
            expires_at: peer.expires_at,
        })
    }

    fn open_key(&self, record: &PeerRecord) -> Result<PrivateKey, StoreError> {
        let decode = |field: &str, value: &str| {
            BASE64
                .decode(value)
                .map_err(|e| StoreError::Corrupt(format!("{field}: {e}")))
        };
        let ciphertext = decode("private_key_enc", &record.private_key_enc)?;
        let nonce = decode("private_key_nonce", &record.private_key_nonce)?;
        self.sealer.open(&ciphertext, &nonce)
    }

    fn decode(&self, record: PeerRecord) -> Result<Peer, StoreError> {
        let private_key = self.open_key(&record)?;
        Ok(record.into_peer(private_key))
    }

    async fn read_record(path: &Path) -> Result<PeerRecord, StoreError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn read_peer(&self, path: &Path) -> Result<Peer, StoreError> {
        self.decode(Self::read_record(path).await?)
    }

    /// Paths of every `.json` record in `dir`.
    async fn record_paths(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Paths of every user directory in a namespace.
    async fn user_dirs(&self, kind: PeerKind) -> Result<Vec<PathBuf>, StoreError> {
        let namespace = self.root.join(kind.as_str());
        let mut users = match tokio::fs::read_dir(&namespace).await {
            Ok(users) => users,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = users.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Read every record in `dir`. Unreadable records are logged and skipped.
    async fn read_dir(&self, dir: &Path) -> Result<Vec<Peer>, StoreError> {
        let mut peers = Vec::new();
        for path in Self::record_paths(dir).await? {
            match self.read_peer(&path).await {
                Ok(peer) => peers.push(peer),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "skipping unreadable peer record");
                }
            }
        }
        peers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(peers)
    }
}

impl PeerStore for FileStore {
    #[tracing::instrument(skip(self, peer), fields(peer_id = %peer.id, kind = %peer.kind))]
    async fn save(&self, peer: &Peer) -> Result<(), StoreError> {
        let record = self.encode(peer)?;
        let json = serde_json::to_vec_pretty(&record)?;

        let dir = self.user_dir(peer.kind, peer.user_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.peer_path(peer.kind, peer.user_id, peer.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "saved peer record");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, kind: PeerKind, user_id: Uuid, peer_id: Uuid) -> Result<Peer, StoreError> {
        let path = self.peer_path(kind, user_id, peer_id);
        match self.read_peer(&path).await {
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound { peer_id })
            }
            other => other,
        }
    }

    #[tracing::instrument(skip(self))]
    async fn list_by_user(&self, kind: PeerKind, user_id: Uuid) -> Result<Vec<Peer>, StoreError> {
        self.read_dir(&self.user_dir(kind, user_id)).await
    }

    #[tracing::instrument(skip(self))]
    async fn list_all(&self, kind: PeerKind) -> Result<Vec<Peer>, StoreError> {
        let mut peers = Vec::new();
        for dir in self.user_dirs(kind).await? {
            peers.extend(self.read_dir(&dir).await?);
        }
        peers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(peers)
    }

    #[tracing::instrument(skip(self))]
    async fn scan(&self, kind: PeerKind) -> Result<Scan, StoreError> {
        let mut records = Vec::new();
        for dir in self.user_dirs(kind).await? {
            for path in Self::record_paths(&dir).await? {
                let record = Self::read_record(&path)
                    .await
                    .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut scan = Scan::default();
        for record in records {
            match self.open_key(&record) {
                Ok(private_key) => scan.peers.push(record.into_peer(private_key)),
                Err(e) => scan.locked.push(record.into_locked(e.to_string())),
            }
        }
        Ok(scan)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, kind: PeerKind, user_id: Uuid, peer_id: Uuid) -> Result<(), StoreError> {
        let path = self.peer_path(kind, user_id, peer_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "deleted peer record");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound { peer_id }),
            Err(e) => Err(e.into()),
        }
    }
}

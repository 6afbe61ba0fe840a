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

//! Durable peer metadata.
//!
//! Static and dynamic peers live in separate namespaces and are always
//! addressed by `(kind, user_id, peer_id)`. Private keys are sealed with
//! AES-256-GCM before they reach any backend.

mod file;
mod postgres;
mod seal;

use std::future::Future;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use wgfleet_types::{PeerKind, ServerId};

use crate::peer::Peer;

pub use file::FileStore;
pub use postgres::PgStore;
pub use seal::{KeySealer, SealedKey};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("peer {peer_id} not found")]
    NotFound { peer_id: Uuid },

    #[error("conflicting peer record: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("private key encryption/decryption failed")]
    Seal,

    #[error("corrupt peer record: {0}")]
    Corrupt(String),
}

/// A stored peer whose private key could not be opened. Everything needed
/// to keep its address, key and tunnel entry is still known.
#[derive(Debug, Clone)]
pub struct LockedPeer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub server_id: ServerId,
    pub public_key: String,
    pub address: Ipv4Addr,
    pub kind: PeerKind,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
}

/// Every record of one namespace, as seen by a restore scan.
#[derive(Debug, Default)]
pub struct Scan {
    pub peers: Vec<Peer>,
    pub locked: Vec<LockedPeer>,
}

pub trait PeerStore: Send + Sync {
    /// Insert or replace a peer record.
    fn save(&self, peer: &Peer) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(
        &self,
        kind: PeerKind,
        user_id: Uuid,
        peer_id: Uuid,
    ) -> impl Future<Output = Result<Peer, StoreError>> + Send;

    fn list_by_user(
        &self,
        kind: PeerKind,
        user_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Peer>, StoreError>> + Send;

    /// Every record of a namespace, used to rebuild allocation state at startup.
    fn list_all(&self, kind: PeerKind) -> impl Future<Output = Result<Vec<Peer>, StoreError>> + Send;

    /// Like `list_all`, but nothing is skipped: records whose private key
    /// cannot be opened come back as locked, and a record that cannot be
    /// parsed at all fails the scan.
    fn scan(&self, kind: PeerKind) -> impl Future<Output = Result<Scan, StoreError>> + Send;

    /// Remove a record. Deleting a missing record is `NotFound`.
    fn delete(
        &self,
        kind: PeerKind,
        user_id: Uuid,
        peer_id: Uuid,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

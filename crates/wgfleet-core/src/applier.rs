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
use std::future::Future;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use wgfleet_types::{LiveStats, TunnelPeer};

/// A handshake older than this no longer counts as connected.
pub const HANDSHAKE_WINDOW: TimeDelta = TimeDelta::seconds(180);

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The live tunnel engine.
///
/// `reconcile` is declarative: the slice is the complete desired peer set
/// across every server, and anything not in it must be removed.
pub trait InterfaceApplier: Send + Sync {
    fn reconcile(&self, peers: &[TunnelPeer]) -> impl Future<Output = Result<(), ApplyError>> + Send;

    /// Live counters keyed by base64 public key.
    fn query_live_stats(
        &self,
    ) -> impl Future<Output = Result<HashMap<String, LiveStats>, ApplyError>> + Send;
}

pub fn handshake_is_recent(last_handshake: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_handshake.is_some_and(|at| now.signed_duration_since(at) <= HANDSHAKE_WINDOW)
}

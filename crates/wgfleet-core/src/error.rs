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

use std::fmt;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use uuid::Uuid;
use wgfleet_types::{ServerId, ServerStatus};

use crate::applier::ApplyError;
use crate::keys::KeyError;
use crate::pool::PoolError;
use crate::render::RenderError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Peer(Uuid),
    Server(ServerId),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(id) => write!(f, "peer {id}"),
            Self::Server(id) => write!(f, "server {id}"),
        }
    }
}

/// Coarse error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Exhausted,
    Conflict,
    ReconciliationFailed,
    InconsistentState,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Exhausted => "exhausted",
            Self::Conflict => "conflict",
            Self::ReconciliationFailed => "reconciliation_failed",
            Self::InconsistentState => "inconsistent_state",
            Self::Validation => "validation",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileFailure {
    #[error("tunnel engine did not answer within {0:?}")]
    Timeout(Duration),

    #[error("tunnel engine rejected the peer set: {0}")]
    Rejected(#[source] ApplyError),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(Resource),

    #[error("no free addresses left in {subnet} on server {server_id}")]
    AddressesExhausted { server_id: ServerId, subnet: Ipv4Network },

    #[error("server {0} is at capacity")]
    CapacityExhausted(ServerId),

    #[error("no server is available")]
    NoAvailableServer,

    #[error("server {0} already exists")]
    DuplicateServer(ServerId),

    #[error("server {server_id} still has {peers} active peers")]
    ServerInUse { server_id: ServerId, peers: usize },

    #[error("server {server_id} is {status}")]
    ServerUnavailable { server_id: ServerId, status: ServerStatus },

    #[error("reconciliation failed: {0}")]
    ReconciliationFailed(#[from] ReconcileFailure),

    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("key error: {0}")]
    Keys(#[from] KeyError),

    #[error("render error: {0}")]
    Render(#[from] RenderError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Storage(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            Self::AddressesExhausted { .. } | Self::CapacityExhausted(_) | Self::NoAvailableServer => {
                ErrorKind::Exhausted
            }
            Self::DuplicateServer(_)
            | Self::ServerInUse { .. }
            | Self::ServerUnavailable { .. }
            | Self::Storage(StoreError::Conflict(_)) => ErrorKind::Conflict,
            Self::ReconciliationFailed(_) => ErrorKind::ReconciliationFailed,
            Self::InconsistentState(_) => ErrorKind::InconsistentState,
            Self::Validation(_) | Self::Render(RenderError::InvalidValue(_)) => ErrorKind::Validation,
            Self::Storage(_) | Self::Keys(_) | Self::Render(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Exhausted | ErrorKind::ReconciliationFailed)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { scope, subnet } => Self::AddressesExhausted { server_id: scope, subnet },
            other => Self::InconsistentState(other.to_string()),
        }
    }
}

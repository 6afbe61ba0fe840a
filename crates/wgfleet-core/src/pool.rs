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

//! Tunnel address allocation.
//!
//! Each server is its own scope and hands out addresses from its subnet. The
//! network address, the server's own address (`.1`) and the broadcast
//! address are never assigned to peers. Allocation always returns the lowest
//! free address so reuse stays at the bottom of the range after churn.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnetwork::Ipv4Network;
use tracing::{debug, warn};
use wgfleet_types::ServerId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no free addresses left in {subnet} for server {scope}")]
    Exhausted { scope: ServerId, subnet: Ipv4Network },

    #[error("address {addr} is already allocated on server {scope}")]
    AlreadyAllocated { scope: ServerId, addr: Ipv4Addr },

    #[error("address {addr} is not assignable in {subnet}")]
    NotAssignable { addr: Ipv4Addr, subnet: Ipv4Network },
}

#[derive(Debug, Default)]
pub struct AddressPool {
    scopes: Mutex<HashMap<ServerId, BTreeSet<Ipv4Addr>>>,
}

/// First and last host offset that may be handed to a peer, as raw u32s.
fn assignable_range(subnet: Ipv4Network) -> Option<(u32, u32)> {
    if subnet.prefix() > 30 {
        return None;
    }
    let network = u32::from(subnet.network()) as u64;
    let size = 1u64 << (32 - subnet.prefix());
    Some(((network + 2) as u32, (network + size - 2) as u32))
}

impl AddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServerId, BTreeSet<Ipv4Addr>>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocate(&self, scope: &ServerId, subnet: Ipv4Network) -> Result<Ipv4Addr, PoolError> {
        let exhausted = || PoolError::Exhausted { scope: scope.clone(), subnet };
        let (first, last) = assignable_range(subnet).ok_or_else(exhausted)?;

        let mut scopes = self.lock();
        let used = scopes.entry(scope.clone()).or_default();

        let mut candidate = first;
        for addr in used.range(Ipv4Addr::from(first)..=Ipv4Addr::from(last)) {
            if u32::from(*addr) != candidate {
                break;
            }
            candidate += 1;
        }

        if candidate > last {
            warn!(server_id = %scope, %subnet, "address pool exhausted");
            return Err(exhausted());
        }

        let addr = Ipv4Addr::from(candidate);
        used.insert(addr);
        debug!(server_id = %scope, %addr, "allocated address");
        Ok(addr)
    }

    /// Return an address to the pool. Releasing a free address is a no-op.
    pub fn release(&self, scope: &ServerId, addr: Ipv4Addr) {
        let mut scopes = self.lock();
        let Some(used) = scopes.get_mut(scope) else {
            return;
        };
        if used.remove(&addr) {
            debug!(server_id = %scope, %addr, "released address");
        }
        if used.is_empty() {
            scopes.remove(scope);
        }
    }

    /// Mark a specific address as taken, used when rebuilding from storage.
    pub fn reserve(
        &self,
        scope: &ServerId,
        subnet: Ipv4Network,
        addr: Ipv4Addr,
    ) -> Result<(), PoolError> {
        let in_range = assignable_range(subnet)
            .is_some_and(|(first, last)| (first..=last).contains(&u32::from(addr)));
        if !in_range {
            return Err(PoolError::NotAssignable { addr, subnet });
        }

        let mut scopes = self.lock();
        if !scopes.entry(scope.clone()).or_default().insert(addr) {
            return Err(PoolError::AlreadyAllocated { scope: scope.clone(), addr });
        }
        Ok(())
    }

    /// Mark `addr` as taken in a scope whose subnet is not known yet. Any
    /// later allocation in that scope skips it. Returns false if it was
    /// already taken.
    pub fn hold(&self, scope: &ServerId, addr: Ipv4Addr) -> bool {
        self.lock().entry(scope.clone()).or_default().insert(addr)
    }

    /// Allocated addresses of one scope, ascending.
    pub fn allocated(&self, scope: &ServerId) -> Vec<Ipv4Addr> {
        self.lock()
            .get(scope)
            .map(|used| used.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn total_allocated(&self) -> usize {
        self.lock().values().map(BTreeSet::len).sum()
    }
}

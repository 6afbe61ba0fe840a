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

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::applier::InterfaceApplier;
use crate::server_manager::HealthProbe;
use crate::store::PeerStore;
use crate::vpn_manager::VpnManager;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub reconciled: bool,
    pub stats_updated: usize,
}

/// One maintenance pass: expire dynamic peers, retry a reconcile that failed
/// earlier, then persist live counters. Failures are logged and the pass
/// continues.
/// One pass, treating `now` as the current time for dynamic peer expiry.
pub async fn run_maintenance_once<S, A, P>(vpn: &VpnManager<S, A, P>, now: DateTime<Utc>) -> MaintenanceReport
where
    S: PeerStore,
    A: InterfaceApplier,
    P: HealthProbe,
{
    let mut report = MaintenanceReport {
        expired: vpn.expire_dynamic_peers(now).await,
        ..Default::default()
    };

    match vpn.peers().retry_pending_reconcile().await {
        Ok(reconciled) => report.reconciled = reconciled,
        Err(e) => warn!(error = %e, "pending reconcile still failing"),
    }

    match vpn.peers().refresh_live_stats().await {
        Ok(updated) => report.stats_updated = updated,
        Err(e) => debug!(error = %e, "live stats unavailable"),
    }

    report
}

pub async fn run_maintenance_loop<S, A, P>(vpn: &VpnManager<S, A, P>, interval: Duration)
where
    S: PeerStore,
    A: InterfaceApplier,
    P: HealthProbe,
{
    info!(?interval, "starting maintenance loop");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let report = run_maintenance_once(vpn, Utc::now()).await;
        debug!(?report, "maintenance pass complete");
    }
}

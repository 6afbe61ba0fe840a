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

//! Fire-and-forget telemetry.
//!
//! Sinks never return errors. A sink that cannot record something logs it and
//! moves on; the operation that produced the event has already happened.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ACTIVE_CONNECTIONS: &str = "active_connections";
pub const SERVER_LOAD: &str = "server_load";
pub const CONNECTIONS_BY_DEVICE: &str = "connections_by_device";
pub const ERRORS: &str = "errors";
pub const INCONSISTENCIES: &str = "inconsistencies";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(user_id: Option<Uuid>, event_type: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            user_id,
            event_type: event_type.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record_event(&self, event: TelemetryEvent);
    fn increment_counter(&self, name: &str, label: &str, by: u64);
    fn set_gauge(&self, name: &str, label: &str, value: i64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record_event(&self, _event: TelemetryEvent) {}
    fn increment_counter(&self, _name: &str, _label: &str, _by: u64) {}
    fn set_gauge(&self, _name: &str, _label: &str, _value: i64) {}
}

/// In-process counters and gauges keyed by `(name, label)`.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<(String, String), u64>,
    gauges: DashMap<(String, String), i64>,
    events: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, label: &str) -> u64 {
        self.counters
            .get(&(name.to_string(), label.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, label: &str) -> Option<i64> {
        self.gauges.get(&(name.to_string(), label.to_string())).map(|v| *v)
    }

    pub fn events_recorded(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> BTreeMap<(String, String), u64> {
        self.counters.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    pub fn gauges(&self) -> BTreeMap<(String, String), i64> {
        self.gauges.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }
}

impl TelemetrySink for MetricsRegistry {
    fn record_event(&self, event: TelemetryEvent) {
        self.events.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "wgfleet::telemetry",
            user_id = ?event.user_id,
            event_type = %event.event_type,
            details = %event.details,
            "event"
        );
    }

    fn increment_counter(&self, name: &str, label: &str, by: u64) {
        *self
            .counters
            .entry((name.to_string(), label.to_string()))
            .or_insert(0) += by;
        debug!(target: "wgfleet::telemetry", name, label, by, "counter incremented");
    }

    fn set_gauge(&self, name: &str, label: &str, value: i64) {
        self.gauges.insert((name.to_string(), label.to_string()), value);
        debug!(target: "wgfleet::telemetry", name, label, value, "gauge set");
    }
}

/// Appends events as JSON lines from a background writer task.
#[derive(Debug, Clone)]
pub struct AnalyticsLog {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl AnalyticsLog {
    /// Open `path` for appending. The returned task finishes once every
    /// clone of the log has been dropped and the queue is drained.
    pub async fn open(path: &Path) -> std::io::Result<(Self, JoinHandle<()>)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        info!(path = %path.display(), "opened analytics log");

        let (tx, mut rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut line = match serde_json::to_vec(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize analytics event");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    warn!(error = %e, "failed to write analytics event");
                }
            }
            if let Err(e) = file.flush().await {
                warn!(error = %e, "failed to flush analytics log");
            }
        });

        Ok((Self { tx }, writer))
    }
}

impl TelemetrySink for AnalyticsLog {
    fn record_event(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }

    fn increment_counter(&self, _name: &str, _label: &str, _by: u64) {}

    fn set_gauge(&self, _name: &str, _label: &str, _value: i64) {}
}

/// Forwards everything to each inner sink in order.
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl Fanout {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for Fanout {
    fn record_event(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            sink.record_event(event.clone());
        }
    }

    fn increment_counter(&self, name: &str, label: &str, by: u64) {
        for sink in &self.sinks {
            sink.increment_counter(name, label, by);
        }
    }

    fn set_gauge(&self, name: &str, label: &str, value: i64) {
        for sink in &self.sinks {
            sink.set_gauge(name, label, value);
        }
    }
}

mod common;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;
use wgfleet_core::error::{Error, ErrorKind};
use wgfleet_core::maintenance::{MaintenanceReport, run_maintenance_once};
use wgfleet_core::telemetry::{ACTIVE_CONNECTIONS, CONNECTIONS_BY_DEVICE, ERRORS, INCONSISTENCIES};
use wgfleet_core::vpn_manager::ConnectRequest;
use wgfleet_types::{DeviceClass, LiveStats, PeerKind, ServerStatus};

use common::{harness, new_server, sid};

fn request(user_id: Uuid, server: &str, device_class: DeviceClass) -> ConnectRequest {
    ConnectRequest {
        user_id,
        server_id: sid(server),
        device_class,
        device_name: None,
    }
}

#[tokio::test]
async fn connect_and_disconnect_track_load() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    let connection = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap();
    assert_eq!(connection.peer.address, "10.8.0.2");
    assert_eq!(connection.peer.device_name, "linux");
    assert!(connection.config.contains("[Interface]"));
    assert_eq!(h.servers.get_server(&sid("eu-west")).unwrap().load, 1);
    assert_eq!(h.metrics.gauge(ACTIVE_CONNECTIONS, ""), Some(1));
    assert_eq!(h.metrics.counter(CONNECTIONS_BY_DEVICE, "linux"), 1);

    let removed = h.vpn.disconnect(user, connection.peer.id).await.unwrap();
    assert_eq!(removed.id, connection.peer.id);
    assert_eq!(h.servers.get_server(&sid("eu-west")).unwrap().load, 0);
    assert_eq!(h.metrics.gauge(ACTIVE_CONNECTIONS, ""), Some(0));
    assert!(h.applier.last_applied().is_empty());
}

#[tokio::test]
async fn qr_code_only_for_mobile_devices() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    let phone = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Android))
        .await
        .unwrap();
    let png = phone.qr_png.expect("mobile connect carries a QR code");
    assert!(png.starts_with(b"\x89PNG\r\n\x1a\n"));

    let laptop = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Windows))
        .await
        .unwrap();
    assert!(laptop.qr_png.is_none());

    // Anyone may still ask for one explicitly.
    let qr = h.vpn.get_qr(user, laptop.peer.id).await.unwrap();
    assert!(qr.starts_with(b"\x89PNG"));
}

#[tokio::test]
async fn get_config_matches_connect() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    let connection = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Ios))
        .await
        .unwrap();
    let config = h.vpn.get_config(user, connection.peer.id).await.unwrap();
    assert_eq!(config, connection.config);

    let err = h.vpn.get_config(Uuid::new_v4(), connection.peer.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn connect_refuses_unavailable_servers() {
    let dir = tempfile::tempdir().unwrap();
    let mut offline = new_server("us-east", "America", "10.9.0.0/24", 10);
    offline.status = ServerStatus::Offline;
    let h = harness(
        dir.path(),
        vec![new_server("eu-west", "Europe", "10.8.0.0/24", 1), offline],
    )
    .await;
    let user = Uuid::new_v4();

    let err = h
        .vpn
        .connect(request(user, "us-east", DeviceClass::Linux))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServerUnavailable { status: ServerStatus::Offline, .. }));

    let err = h
        .vpn
        .connect(request(user, "nowhere", DeviceClass::Linux))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    h.vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap();
    let err = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CapacityExhausted(_)));
    assert_eq!(h.metrics.counter(ERRORS, "exhausted"), 1);
    assert_eq!(h.metrics.counter(ERRORS, "not_found"), 1);
    assert_eq!(h.metrics.counter(ERRORS, "conflict"), 1);
}

#[tokio::test]
async fn optimal_server_is_least_loaded_online() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = new_server("c", "Europe", "10.10.0.0/24", 10);
    c.status = ServerStatus::Offline;
    let h = harness(
        dir.path(),
        vec![
            new_server("a", "Europe", "10.8.0.0/24", 10),
            new_server("b", "America", "10.9.0.0/24", 10),
            c,
        ],
    )
    .await;
    h.servers.update_load(&sid("a"), 3).unwrap();
    h.servers.update_load(&sid("b"), 1).unwrap();

    let user = Uuid::new_v4();
    let connection = h
        .vpn
        .connect_optimal(user, None, DeviceClass::Linux, None)
        .await
        .unwrap();
    assert_eq!(connection.peer.server_id, sid("b"));

    let connection = h
        .vpn
        .connect_optimal(user, Some("europe"), DeviceClass::Linux, Some("work".into()))
        .await
        .unwrap();
    assert_eq!(connection.peer.server_id, sid("a"));
    assert_eq!(connection.peer.device_name, "work");
}

#[tokio::test]
async fn no_available_server() {
    let dir = tempfile::tempdir().unwrap();
    let mut down = new_server("a", "Europe", "10.8.0.0/24", 10);
    down.status = ServerStatus::Maintenance;
    let h = harness(dir.path(), vec![down]).await;

    let err = h
        .vpn
        .connect_optimal(Uuid::new_v4(), None, DeviceClass::Linux, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoAvailableServer));
    assert!(err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_never_exceed_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let vpn = h.vpn.clone();
            tokio::spawn(async move {
                vpn.connect(request(Uuid::new_v4(), "eu-west", DeviceClass::Linux))
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) => assert!(matches!(e, Error::CapacityExhausted(_)), "unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(h.servers.get_server(&sid("eu-west")).unwrap().load, 10);
    assert_eq!(h.vpn.peers().active_count_for(&sid("eu-west")), 10);
    assert_eq!(h.vpn.peers().allocated_addresses(&sid("eu-west")).len(), 10);
}

#[tokio::test]
async fn load_matches_connections_under_random_churn() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 5)]).await;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<(Uuid, Uuid)> = Vec::new();

    for _ in 0..120 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let user = Uuid::new_v4();
            match h.vpn.connect(request(user, "eu-west", DeviceClass::Linux)).await {
                Ok(connection) => live.push((user, connection.peer.id)),
                Err(e) => {
                    assert!(matches!(e, Error::CapacityExhausted(_)));
                    assert_eq!(live.len(), 5);
                }
            }
        } else {
            let (user, peer) = live.swap_remove(rng.gen_range(0..live.len()));
            h.vpn.disconnect(user, peer).await.unwrap();
        }

        let server = h.servers.get_server(&sid("eu-west")).unwrap();
        assert!(server.load <= server.capacity);
        assert_eq!(server.load as usize, live.len());
        assert_eq!(h.vpn.peers().active_count(), live.len());
    }
}

#[tokio::test]
async fn server_removed_mid_connect_rolls_back_peer() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    let servers = h.servers.clone();
    h.applier.on_next_reconcile(move || {
        servers.remove_server(&sid("eu-west")).unwrap();
    });

    let err = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(h.vpn.peers().list_peers(user).await.unwrap().is_empty());
    assert!(h.vpn.peers().allocated_addresses(&sid("eu-west")).is_empty());
    assert_eq!(h.vpn.peers().issued_key_count(), 0);
    assert!(h.applier.last_applied().is_empty());
}

#[tokio::test]
async fn failed_connect_rollback_is_reported_as_inconsistent() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    let servers = h.servers.clone();
    let store = h.store.clone();
    h.applier.on_next_reconcile(move || {
        servers.remove_server(&sid("eu-west")).unwrap();
        store.set_failing_deletes(true);
    });

    let err = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InconsistentState(_)));
    assert_eq!(h.metrics.counter(INCONSISTENCIES, "connect_rollback"), 1);
    assert_eq!(h.metrics.counter(ERRORS, "inconsistent_state"), 1);

    // The peer could not be removed, so it stays visible and keeps its slot.
    let stored = h.vpn.peers().list_peers(user).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(h.vpn.peers().active_count(), 1);
    assert_eq!(h.vpn.peers().allocated_addresses(&sid("eu-west")), vec![stored[0].address]);
    assert!(h.vpn.peers().needs_reconcile());
}

#[tokio::test]
async fn failed_reconcile_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    h.applier.set_failing(true);
    let err = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Macos))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReconciliationFailed);
    assert_eq!(h.servers.get_server(&sid("eu-west")).unwrap().load, 0);
    assert!(h.vpn.get_status(user).await.unwrap().sessions.is_empty());
    assert_eq!(h.metrics.counter(ERRORS, "reconciliation_failed"), 1);
}

#[tokio::test]
async fn remove_server_requires_no_peers() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    let connection = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap();
    let err = h.vpn.remove_server(&sid("eu-west")).unwrap_err();
    assert!(matches!(err, Error::ServerInUse { peers: 1, .. }));

    h.vpn.disconnect(user, connection.peer.id).await.unwrap();
    let removed = h.vpn.remove_server(&sid("eu-west")).unwrap();
    assert_eq!(removed.id, sid("eu-west"));
    assert!(h.vpn.list_servers().is_empty());
}

#[tokio::test]
async fn status_reports_live_stats() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    let idle = h.vpn.get_status(user).await.unwrap();
    assert!(!idle.connected);
    assert!(idle.sessions.is_empty());

    let connection = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap();
    h.applier.set_stats(HashMap::from([(
        connection.peer.public_key.clone(),
        LiveStats {
            connected: true,
            bytes_rx: 10,
            bytes_tx: 20,
            last_handshake: Some(Utc::now()),
        },
    )]));

    let status = h.vpn.get_status(user).await.unwrap();
    assert!(status.connected);
    assert_eq!(status.sessions.len(), 1);
    let session = &status.sessions[0];
    assert_eq!(session.server_name.as_deref(), Some("Europe eu-west"));
    assert_eq!(session.live.as_ref().map(|l| l.bytes_tx), Some(20));

    // An unreachable engine degrades to metadata only.
    h.applier.set_failing(true);
    let status = h.vpn.get_status(user).await.unwrap();
    assert_eq!(status.sessions.len(), 1);
    assert!(status.sessions[0].live.is_none());
}

#[tokio::test]
async fn dynamic_peers_are_expired() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    let fixed = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap();
    let temp = h
        .vpn
        .connect_dynamic(request(user, "eu-west", DeviceClass::Android), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(temp.peer.kind, PeerKind::Dynamic);
    assert_eq!(h.servers.get_server(&sid("eu-west")).unwrap().load, 2);

    assert_eq!(h.vpn.expire_dynamic_peers(Utc::now()).await, 0);
    assert_eq!(h.vpn.expire_dynamic_peers(Utc::now() + TimeDelta::seconds(61)).await, 1);

    assert_eq!(h.servers.get_server(&sid("eu-west")).unwrap().load, 1);
    let status = h.vpn.get_status(user).await.unwrap();
    assert_eq!(status.sessions.len(), 1);
    assert_eq!(status.sessions[0].peer.id, fixed.peer.id);
}

#[tokio::test]
async fn restart_restores_server_loads() {
    let dir = tempfile::tempdir().unwrap();
    let servers = || {
        vec![
            new_server("eu-west", "Europe", "10.8.0.0/24", 10),
            new_server("us-east", "America", "10.9.0.0/24", 10),
        ]
    };

    {
        let h = harness(dir.path(), servers()).await;
        for server in ["eu-west", "eu-west", "us-east"] {
            h.vpn
                .connect(request(Uuid::new_v4(), server, DeviceClass::Linux))
                .await
                .unwrap();
        }
    }

    let h = harness(dir.path(), servers()).await;
    assert_eq!(h.servers.get_server(&sid("eu-west")).unwrap().load, 2);
    assert_eq!(h.servers.get_server(&sid("us-east")).unwrap().load, 1);
    assert_eq!(h.metrics.gauge(ACTIVE_CONNECTIONS, ""), Some(3));
    assert_eq!(h.applier.last_applied().len(), 3);
}

#[tokio::test]
async fn disconnect_unknown_peer_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let err = h
        .vpn
        .disconnect(Uuid::new_v4(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.metrics.counter(ERRORS, "not_found"), 1);
}

#[tokio::test]
async fn maintenance_pass_expires_retries_and_refreshes() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![new_server("eu-west", "Europe", "10.8.0.0/24", 10)]).await;
    let user = Uuid::new_v4();

    let fixed = h
        .vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap();
    h.vpn
        .connect_dynamic(request(user, "eu-west", DeviceClass::Ios), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(h.servers.get_server(&sid("eu-west")).unwrap().load, 2);

    h.applier.set_failing(true);
    h.vpn
        .connect(request(user, "eu-west", DeviceClass::Linux))
        .await
        .unwrap_err();
    h.applier.set_failing(false);
    assert!(h.vpn.peers().needs_reconcile());

    h.applier.set_stats(HashMap::from([(
        fixed.peer.public_key.clone(),
        LiveStats {
            connected: true,
            bytes_rx: 512,
            bytes_tx: 2048,
            last_handshake: Some(Utc::now()),
        },
    )]));

    let later = Utc::now() + TimeDelta::seconds(61);
    let report = run_maintenance_once(&h.vpn, later).await;
    assert_eq!(
        report,
        MaintenanceReport {
            expired: 1,
            reconciled: true,
            stats_updated: 1,
        }
    );
    assert_eq!(h.servers.get_server(&sid("eu-west")).unwrap().load, 1);
    assert!(!h.vpn.peers().needs_reconcile());
    assert_eq!(h.applier.last_applied().len(), 1);

    let stored = h.vpn.peers().get_peer(user, fixed.peer.id).await.unwrap();
    assert_eq!(stored.bytes_rx, 512);
    assert_eq!(stored.bytes_tx, 2048);

    // Nothing left to do on the next pass.
    assert_eq!(run_maintenance_once(&h.vpn, later).await, MaintenanceReport::default());
}

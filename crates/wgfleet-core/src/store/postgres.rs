use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use ipnetwork::{IpNetwork, Ipv4Network};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use uuid::Uuid;
use wgfleet_types::{DeviceClass, PeerKind, ServerId};

use super::{KeySealer, LockedPeer, PeerStore, Scan, StoreError};
use crate::keys::PrivateKey;
use crate::peer::Peer;

#[derive(Debug, sqlx::FromRow)]
struct PeerRow {
    id: Uuid,
    namespace: String,
    user_id: Uuid,
    server_id: String,
    device_class: String,
    device_name: String,
    public_key: String,
    private_key_enc: Vec<u8>,
    private_key_nonce: Vec<u8>,
    address: IpNetwork,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_handshake: Option<DateTime<Utc>>,
    bytes_rx: i64,
    bytes_tx: i64,
    expires_at: Option<DateTime<Utc>>,
}

/// Peer store backed by the `peers` table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    sealer: KeySealer,
}

impl PgStore {
    pub fn new(pool: PgPool, sealer: KeySealer) -> Self {
        Self { pool, sealer }
    }

    pub async fn connect(database_url: &str, sealer: KeySealer) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, sealer))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    /// Namespace, server and address of a row, the fields allocation state
    /// is rebuilt from.
    fn identity(row: &PeerRow) -> Result<(PeerKind, ServerId, Ipv4Addr), StoreError> {
        let kind = match row.namespace.as_str() {
            "static" => PeerKind::Static,
            "dynamic" => PeerKind::Dynamic,
            other => return Err(StoreError::Corrupt(format!("unknown namespace {other:?}"))),
        };
        let server_id: ServerId = row
            .server_id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("peer {}: {e}", row.id)))?;
        let address = match row.address.ip() {
            IpAddr::V4(addr) => addr,
            IpAddr::V6(addr) => {
                return Err(StoreError::Corrupt(format!("non-IPv4 tunnel address {addr}")));
            }
        };
        Ok((kind, server_id, address))
    }

    fn decode_row(&self, row: PeerRow) -> Result<Peer, StoreError> {
        let (kind, server_id, address) = Self::identity(&row)?;
        let private_key = self.sealer.open(&row.private_key_enc, &row.private_key_nonce)?;
        Ok(Self::assemble(row, kind, server_id, address, private_key))
    }

    fn assemble(
        row: PeerRow,
        kind: PeerKind,
        server_id: ServerId,
        address: Ipv4Addr,
        private_key: PrivateKey,
    ) -> Peer {
        let counter = |v: i64| u64::try_from(v).unwrap_or_default();

        Peer {
            id: row.id,
            user_id: row.user_id,
            server_id,
            device_class: DeviceClass::parse_lossy(&row.device_class),
            device_name: row.device_name,
            public_key: row.public_key,
            private_key,
            address,
            kind,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_handshake: row.last_handshake,
            bytes_rx: counter(row.bytes_rx),
            bytes_tx: counter(row.bytes_tx),
            expires_at: row.expires_at,
        }
    }

    fn decode_rows(&self, rows: Vec<PeerRow>) -> Vec<Peer> {
        rows.into_iter()
            .filter_map(|row| {
                let id = row.id;
                self.decode_row(row)
                    .inspect_err(|e| tracing::error!(peer_id = %id, error = %e, "skipping unreadable peer row"))
                    .ok()
            })
            .collect()
    }
}

impl PeerStore for PgStore {
    #[tracing::instrument(skip(self, peer), fields(peer_id = %peer.id, kind = %peer.kind))]
    async fn save(&self, peer: &Peer) -> Result<(), StoreError> {
        let sealed = self.sealer.seal(&peer.private_key)?;
        let counter = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO peers (id, namespace, user_id, server_id, device_class, device_name,
                                public_key, private_key_enc, private_key_nonce, address,
                                created_at, updated_at, last_handshake, bytes_rx, bytes_tx, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             ON CONFLICT (id) DO UPDATE SET
                device_name = EXCLUDED.device_name,
                updated_at = EXCLUDED.updated_at,
                last_handshake = EXCLUDED.last_handshake,
                bytes_rx = EXCLUDED.bytes_rx,
                bytes_tx = EXCLUDED.bytes_tx,
                expires_at = EXCLUDED.expires_at",
        )
        .bind(peer.id)
        .bind(peer.kind.as_str())
        .bind(peer.user_id)
        .bind(peer.server_id.as_str())
        .bind(peer.device_class.as_str())
        .bind(&peer.device_name)
        .bind(&peer.public_key)
        .bind(&sealed.ciphertext)
        .bind(&sealed.nonce)
        .bind(IpNetwork::V4(Ipv4Network::from(peer.address)))
        .bind(peer.created_at)
        .bind(peer.updated_at)
        .bind(peer.last_handshake)
        .bind(counter(peer.bytes_rx))
        .bind(counter(peer.bytes_tx))
        .bind(peer.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.constraint() == Some("peers_public_key_key") => {
                StoreError::Conflict(format!("public key {} already stored", peer.public_key))
            }
            sqlx::Error::Database(db_err)
                if db_err.constraint() == Some("peers_server_id_address_key") =>
            {
                StoreError::Conflict(format!("address {} already stored on {}", peer.address, peer.server_id))
            }
            _ => StoreError::Database(e),
        })?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, kind: PeerKind, user_id: Uuid, peer_id: Uuid) -> Result<Peer, StoreError> {
        let row = sqlx::query_as::<_, PeerRow>(
            "SELECT * FROM peers WHERE namespace = $1 AND user_id = $2 AND id = $3",
        )
        .bind(kind.as_str())
        .bind(user_id)
        .bind(peer_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound { peer_id })?;

        self.decode_row(row)
    }

    #[tracing::instrument(skip(self))]
    async fn list_by_user(&self, kind: PeerKind, user_id: Uuid) -> Result<Vec<Peer>, StoreError> {
        let rows = sqlx::query_as::<_, PeerRow>(
            "SELECT * FROM peers WHERE namespace = $1 AND user_id = $2 ORDER BY created_at, id",
        )
        .bind(kind.as_str())
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.decode_rows(rows))
    }

    #[tracing::instrument(skip(self))]
    async fn list_all(&self, kind: PeerKind) -> Result<Vec<Peer>, StoreError> {
        let rows = sqlx::query_as::<_, PeerRow>(
            "SELECT * FROM peers WHERE namespace = $1 ORDER BY created_at, id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(self.decode_rows(rows))
    }

    #[tracing::instrument(skip(self))]
    async fn scan(&self, kind: PeerKind) -> Result<Scan, StoreError> {
        let rows = sqlx::query_as::<_, PeerRow>(
            "SELECT * FROM peers WHERE namespace = $1 ORDER BY created_at, id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut scan = Scan::default();
        for row in rows {
            let (kind, server_id, address) = Self::identity(&row)?;
            match self.sealer.open(&row.private_key_enc, &row.private_key_nonce) {
                Ok(private_key) => {
                    scan.peers.push(Self::assemble(row, kind, server_id, address, private_key));
                }
                Err(e) => scan.locked.push(LockedPeer {
                    id: row.id,
                    user_id: row.user_id,
                    server_id,
                    public_key: row.public_key,
                    address,
                    kind,
                    expires_at: row.expires_at,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(scan)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, kind: PeerKind, user_id: Uuid, peer_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM peers WHERE namespace = $1 AND user_id = $2 AND id = $3")
            .bind(kind.as_str())
            .bind(user_id)
            .bind(peer_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { peer_id });
        }
        Ok(())
    }
}

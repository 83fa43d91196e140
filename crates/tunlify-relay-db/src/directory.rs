//! Tunnel Directory access
//!
//! The relay core only needs a narrow slice of the tunnel records: lookup by
//! public key or by connection token, and the connected/disconnected
//! write-through. `create`/`delete` exist for the management tooling.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    SqlErr,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::tunnel::{self, TunnelStatus};
use crate::entities::Tunnel;
use crate::token::generate_connection_token;

/// A durable tunnel record
pub type TunnelRecord = tunnel::Model;

/// Directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Subdomain '{subdomain}' is already taken in {region}")]
    SubdomainTaken { subdomain: String, region: String },

    #[error("Tunnel not found: {0}")]
    NotFound(Uuid),
}

/// Fields needed to create a tunnel; the token is generated by the directory
#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub owner_id: Uuid,
    pub owner_email: Option<String>,
    pub subdomain: String,
    pub region: String,
}

/// Persistent store of tunnel records
#[async_trait]
pub trait TunnelDirectory: Send + Sync {
    async fn get_by_key(
        &self,
        subdomain: &str,
        region: &str,
    ) -> Result<Option<TunnelRecord>, DirectoryError>;

    async fn get_by_token(&self, token: &str) -> Result<Option<TunnelRecord>, DirectoryError>;

    /// Flip the record to active/connected and stamp `last_connected_at`
    async fn mark_connected(&self, id: Uuid) -> Result<(), DirectoryError>;

    /// Flip the record to inactive/disconnected
    async fn mark_disconnected(&self, id: Uuid) -> Result<(), DirectoryError>;

    async fn create(&self, tunnel: NewTunnel) -> Result<TunnelRecord, DirectoryError>;

    /// Returns true if a record was removed
    async fn delete(&self, id: Uuid) -> Result<bool, DirectoryError>;
}

fn new_record(tunnel: NewTunnel) -> TunnelRecord {
    TunnelRecord {
        id: Uuid::new_v4(),
        owner_id: tunnel.owner_id,
        owner_email: tunnel.owner_email,
        subdomain: tunnel.subdomain,
        region: tunnel.region,
        connection_token: generate_connection_token(),
        status: TunnelStatus::Inactive,
        client_connected: false,
        created_at: Utc::now(),
        last_connected_at: None,
    }
}

/// Directory backed by the relay database
#[derive(Clone)]
pub struct DatabaseTunnelDirectory {
    db: DatabaseConnection,
}

impl DatabaseTunnelDirectory {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn find(&self, id: Uuid) -> Result<TunnelRecord, DirectoryError> {
        Tunnel::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(DirectoryError::NotFound(id))
    }
}

#[async_trait]
impl TunnelDirectory for DatabaseTunnelDirectory {
    async fn get_by_key(
        &self,
        subdomain: &str,
        region: &str,
    ) -> Result<Option<TunnelRecord>, DirectoryError> {
        Ok(Tunnel::find()
            .filter(tunnel::Column::Subdomain.eq(subdomain))
            .filter(tunnel::Column::Region.eq(region))
            .one(&self.db)
            .await?)
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<TunnelRecord>, DirectoryError> {
        Ok(Tunnel::find()
            .filter(tunnel::Column::ConnectionToken.eq(token))
            .one(&self.db)
            .await?)
    }

    async fn mark_connected(&self, id: Uuid) -> Result<(), DirectoryError> {
        let record = self.find(id).await?;

        let mut active: tunnel::ActiveModel = record.into();
        active.client_connected = Set(true);
        active.status = Set(TunnelStatus::Active);
        active.last_connected_at = Set(Some(Utc::now()));
        active.update(&self.db).await?;

        debug!("Tunnel {} marked connected", id);
        Ok(())
    }

    async fn mark_disconnected(&self, id: Uuid) -> Result<(), DirectoryError> {
        let record = self.find(id).await?;

        let mut active: tunnel::ActiveModel = record.into();
        active.client_connected = Set(false);
        active.status = Set(TunnelStatus::Inactive);
        active.update(&self.db).await?;

        debug!("Tunnel {} marked disconnected", id);
        Ok(())
    }

    async fn create(&self, new_tunnel: NewTunnel) -> Result<TunnelRecord, DirectoryError> {
        if self
            .get_by_key(&new_tunnel.subdomain, &new_tunnel.region)
            .await?
            .is_some()
        {
            return Err(DirectoryError::SubdomainTaken {
                subdomain: new_tunnel.subdomain,
                region: new_tunnel.region,
            });
        }

        let subdomain = new_tunnel.subdomain.clone();
        let region = new_tunnel.region.clone();
        let record = new_record(new_tunnel);
        let active = tunnel::ActiveModel {
            id: Set(record.id),
            owner_id: Set(record.owner_id),
            owner_email: Set(record.owner_email),
            subdomain: Set(record.subdomain),
            region: Set(record.region),
            connection_token: Set(record.connection_token),
            status: Set(record.status),
            client_connected: Set(record.client_connected),
            created_at: Set(record.created_at),
            last_connected_at: Set(record.last_connected_at),
        };

        // The unique index still guards against a concurrent create
        let inserted = active.insert(&self.db).await.map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                DirectoryError::SubdomainTaken { subdomain, region }
            }
            _ => DirectoryError::Database(e),
        })?;

        info!("Tunnel created: {}.{}", inserted.subdomain, inserted.region);
        Ok(inserted)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DirectoryError> {
        let result = Tunnel::delete_by_id(id).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }
}

/// In-process directory, for tests and database-less relays
#[derive(Default)]
pub struct MemoryTunnelDirectory {
    records: RwLock<HashMap<Uuid, TunnelRecord>>,
    writes: AtomicUsize,
}

impl MemoryTunnelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a record by id
    pub async fn get(&self, id: Uuid) -> Option<TunnelRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// Number of mutating calls that changed a record
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn update<F>(&self, id: Uuid, apply: F) -> Result<(), DirectoryError>
    where
        F: FnOnce(&mut TunnelRecord),
    {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(DirectoryError::NotFound(id))?;
        apply(record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TunnelDirectory for MemoryTunnelDirectory {
    async fn get_by_key(
        &self,
        subdomain: &str,
        region: &str,
    ) -> Result<Option<TunnelRecord>, DirectoryError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.subdomain == subdomain && r.region == region)
            .cloned())
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<TunnelRecord>, DirectoryError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.connection_token == token)
            .cloned())
    }

    async fn mark_connected(&self, id: Uuid) -> Result<(), DirectoryError> {
        self.update(id, |record| {
            record.client_connected = true;
            record.status = TunnelStatus::Active;
            record.last_connected_at = Some(Utc::now());
        })
        .await
    }

    async fn mark_disconnected(&self, id: Uuid) -> Result<(), DirectoryError> {
        self.update(id, |record| {
            record.client_connected = false;
            record.status = TunnelStatus::Inactive;
        })
        .await
    }

    async fn create(&self, tunnel: NewTunnel) -> Result<TunnelRecord, DirectoryError> {
        let mut records = self.records.write().await;

        if records
            .values()
            .any(|r| r.subdomain == tunnel.subdomain && r.region == tunnel.region)
        {
            return Err(DirectoryError::SubdomainTaken {
                subdomain: tunnel.subdomain,
                region: tunnel.region,
            });
        }

        let record = new_record(tunnel);
        records.insert(record.id, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DirectoryError> {
        let removed = self.records.write().await.remove(&id).is_some();
        if removed {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }
}

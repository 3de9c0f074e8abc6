use std::path::Path;

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::change_bus::{ChangeBus, ChangeEvent};

mod applications;
mod deployments;
mod jobs;
mod operations;
mod tenancy;
mod types;

#[cfg(test)]
mod tests;

pub use applications::ServingRoute;
pub use deployments::InvalidTransition;
pub use jobs::{NewJob, QueueStats};
pub use tenancy::{EffectivePermissions, GLOBAL_ADMIN_ROLE_ID};
pub use types::*;

#[derive(Debug, Clone)]
pub struct DbClient {
    pool: Pool<Sqlite>,
    bus: ChangeBus,
}

impl DbClient {
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn connect(database_url: &str, bus: ChangeBus) -> Result<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(database_url)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(connect_options)
            .await?;

        Ok(Self { pool, bus })
    }

    /// Opens the database, creating the parent directory, and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, connection, or migrations fail.
    pub async fn initialize(database_path: &str) -> Result<Self> {
        Self::initialize_with_bus(database_path, ChangeBus::new()).await
    }

    /// # Errors
    ///
    /// Returns an error if the directory, connection, or migrations fail.
    pub async fn initialize_with_bus(database_path: &str, bus: ChangeBus) -> Result<Self> {
        if let Some(parent_dir) = Path::new(database_path).parent() {
            std::fs::create_dir_all(parent_dir)?;
        }

        let db = Self::connect(database_path, bus).await?;
        db.run_migrations().await?;
        db.ensure_wal_mode().await?;

        Ok(db)
    }

    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if WAL cannot be enabled.
    pub async fn ensure_wal_mode(&self) -> Result<()> {
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode=WAL;")
            .fetch_one(&self.pool)
            .await?;

        if journal_mode.to_uppercase() != "WAL" {
            bail!("SQLite WAL mode is not enabled");
        }

        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> Pool<Sqlite> {
        self.pool.clone()
    }

    #[must_use]
    pub fn change_bus(&self) -> &ChangeBus {
        &self.bus
    }

    fn notify(&self, table: &str, action: &str, application_id: &str, data: serde_json::Value) {
        self.bus.emit(&ChangeEvent {
            table: table.to_string(),
            action: action.to_string(),
            application_id: application_id.to_string(),
            data,
        });
    }
}

#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fixed-width UTC timestamp so `TEXT` comparisons order chronologically.
#[must_use]
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now() -> String {
    timestamp(Utc::now())
}

pub(crate) async fn insert_audit(
    connection: &mut SqliteConnection,
    audit: &NewAuditLog,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_logs (id, actor_user_id, organization_id, resource, action, target_id, payload_snapshot, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(new_id())
    .bind(&audit.actor_user_id)
    .bind(&audit.organization_id)
    .bind(&audit.resource)
    .bind(&audit.action)
    .bind(audit.target_id.as_deref())
    .bind(audit.payload_snapshot.to_string())
    .bind(now())
    .execute(connection)
    .await?;

    Ok(())
}

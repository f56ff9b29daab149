use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::ProjectDirs;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use parley_core::{AccountStatus, SessionStatus};

use crate::error::{DbError, Result};
use crate::models::Tenant;
use crate::schema::SCHEMA;

pub struct ParleyDb {
    pub(crate) pool: Pool<Sqlite>,
}

impl ParleyDb {
    pub async fn new() -> Result<Self> {
        let db_path = Self::default_path()?;
        Self::new_with_path(&db_path).await
    }

    pub async fn new_with_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        tracing::info!("Database initialized at: {}", path.display());

        Ok(Self { pool })
    }

    /// Private in-memory database. One pooled connection that never expires,
    /// otherwise every new connection would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("io", "parley", "parley").ok_or(DbError::NoDataDir)?;
        Ok(dirs.data_dir().join("parley.db"))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn create_tenant(&self, id: &str, name: &str) -> Result<Tenant> {
        let now = now_millis();

        sqlx::query(
            "INSERT INTO tenants (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_tenant(id).await
    }

    pub async fn get_tenant(&self, id: &str) -> Result<Tenant> {
        self.find_tenant(id)
            .await?
            .ok_or_else(|| DbError::TenantNotFound(id.to_string()))
    }

    pub async fn find_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        Ok(sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(sqlx::query_as::<_, Tenant>("SELECT * FROM tenants ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Missing tenants are ignored; session events may outlive their tenant.
    pub async fn set_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE tenants SET session_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_account_status(&self, id: &str, status: AccountStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE tenants SET account_status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(now_millis())
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::TenantNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn tenant_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>> {
        Ok(sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE api_key = ?")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Stores `candidate` unless the tenant already has a key, and returns the
    /// key that is in effect afterwards.
    pub async fn set_api_key_if_absent(&self, id: &str, candidate: &str) -> Result<String> {
        sqlx::query(
            "UPDATE tenants SET api_key = ?, updated_at = ? WHERE id = ? AND api_key IS NULL",
        )
        .bind(candidate)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_tenant(id)
            .await?
            .api_key
            .ok_or_else(|| DbError::TenantNotFound(id.to_string()))
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

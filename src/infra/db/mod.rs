//! Postgres-backed durable tier.

mod util;

pub use util::{escape_like, map_kv_error};

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    FromRow,
    postgres::{PgPool, PgPoolOptions},
    query, query_as, query_scalar,
};

use crate::cache::{KvEntry, KvError, KvStore, clamp_ttl};

#[derive(Debug, FromRow)]
struct KvRow {
    value: Value,
    ttl_ms: Option<i64>,
}

/// `cache_kv` table accessed through a shared pool.
///
/// Rows past `expires_at` are invisible to reads; [`PostgresKv::purge_expired`]
/// reclaims them.
#[derive(Clone)]
pub struct PostgresKv {
    pool: Arc<PgPool>,
}

impl PostgresKv {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }

    /// Delete expired rows. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> Result<u64, KvError> {
        let result = query("DELETE FROM cache_kv WHERE expires_at <= now()")
            .execute(self.pool())
            .await
            .map_err(map_kv_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KvStore for PostgresKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        let row = query_as::<_, KvRow>(
            r#"
            SELECT value,
                   (EXTRACT(EPOCH FROM (expires_at - now())) * 1000)::BIGINT AS ttl_ms
            FROM cache_kv
            WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(map_kv_error)?;

        Ok(row.map(|row| KvEntry {
            value: row.value,
            ttl: row
                .ttl_ms
                .and_then(|ms| u64::try_from(ms).ok())
                .map(Duration::from_millis),
        }))
    }

    async fn put(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), KvError> {
        query(
            r#"
            INSERT INTO cache_kv (key, value, expires_at, updated_at)
            VALUES ($1, $2, now() + make_interval(secs => $3), now())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at,
                updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(clamp_ttl(ttl).as_secs_f64())
        .execute(self.pool())
        .await
        .map_err(map_kv_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        query("DELETE FROM cache_kv WHERE key = $1")
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(map_kv_error)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let pattern = format!("{}%", escape_like(prefix));
        query_scalar::<_, String>(
            r#"
            SELECT key
            FROM cache_kv
            WHERE key LIKE $1 ESCAPE '\' AND expires_at > now()
            ORDER BY key
            "#,
        )
        .bind(pattern)
        .fetch_all(self.pool())
        .await
        .map_err(map_kv_error)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

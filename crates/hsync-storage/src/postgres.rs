//! PostgreSQL-backed listing store. Each listing is one JSONB document keyed by
//! `identity_key`; single-row statements give per-key atomicity.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hsync_core::{ListingRecord, ListingStatus, WritePayload};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::store::{ListingStore, StatusCounts, StoreError};

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("listing store migrations applied");
        Ok(())
    }

    fn expect_one_row(affected: u64, identity_key: &str) -> Result<(), StoreError> {
        if affected == 0 {
            return Err(StoreError::MissingKey(identity_key.to_string()));
        }
        Ok(())
    }
}

/// Postgres has no unsigned integers; `bigint` holds every `u32` exactly.
fn absence_param(count: u32) -> i64 {
    i64::from(count)
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn get(&self, identity_key: &str) -> Result<Option<ListingRecord>, StoreError> {
        let row = sqlx::query("SELECT document FROM listings WHERE identity_key = $1")
            .bind(identity_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            row.try_get::<Json<ListingRecord>, _>("document")
                .map(|doc| doc.0)
                .map_err(StoreError::from)
        })
        .transpose()
    }

    async fn get_many(&self, identity_keys: &[String]) -> Result<Vec<ListingRecord>, StoreError> {
        if identity_keys.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT document FROM listings WHERE identity_key = ANY($1) ORDER BY identity_key",
        )
        .bind(identity_keys)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                row.try_get::<Json<ListingRecord>, _>("document")
                    .map(|doc| doc.0)
                    .map_err(StoreError::from)
            })
            .collect()
    }

    async fn upsert(&self, record: &ListingRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listings (identity_key, status, document, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (identity_key) DO UPDATE
            SET status = EXCLUDED.status,
                document = EXCLUDED.document,
                updated_at = now()
            "#,
        )
        .bind(record.identity_key())
        .bind(record.status.as_str())
        .bind(Json(record))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn patch(&self, identity_key: &str, payload: &WritePayload) -> Result<(), StoreError> {
        let result = match payload {
            WritePayload::Document(record) => return self.upsert(record).await,
            WritePayload::Seen {
                last_seen_at,
                engagement,
                aliases,
            } => {
                let last_seen = serde_json::to_value(last_seen_at)?;
                let engagement = serde_json::to_value(engagement)?;
                let aliases = serde_json::to_value(aliases)?;
                sqlx::query(
                    r#"
                    UPDATE listings
                    SET document = document || jsonb_build_object(
                            'last_seen_at', $2::jsonb,
                            'absence_count', 0,
                            'engagement', $3::jsonb,
                            'aliases', $4::jsonb),
                        updated_at = now()
                    WHERE identity_key = $1
                    "#,
                )
                .bind(identity_key)
                .bind(Json(last_seen))
                .bind(Json(engagement))
                .bind(Json(aliases))
                .execute(&self.pool)
                .await?
            }
            WritePayload::Absent { absence_count } => {
                sqlx::query(
                    r#"
                    UPDATE listings
                    SET document = document || jsonb_build_object('absence_count', $2::bigint),
                        updated_at = now()
                    WHERE identity_key = $1
                    "#,
                )
                .bind(identity_key)
                .bind(absence_param(*absence_count))
                .execute(&self.pool)
                .await?
            }
            WritePayload::Stale { absence_count } => {
                sqlx::query(
                    r#"
                    UPDATE listings
                    SET status = $3,
                        document = document || jsonb_build_object('absence_count', $2::bigint, 'status', $3::text),
                        updated_at = now()
                    WHERE identity_key = $1
                    "#,
                )
                .bind(identity_key)
                .bind(absence_param(*absence_count))
                .bind(ListingStatus::Stale.as_str())
                .execute(&self.pool)
                .await?
            }
        };
        Self::expect_one_row(result.rows_affected(), identity_key)
    }

    async fn list_active_keys(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT identity_key FROM listings WHERE status = $1 ORDER BY identity_key",
        )
        .bind(ListingStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("identity_key").map_err(StoreError::from))
            .collect()
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM listings GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "active" => counts.active = n.max(0) as usize,
                "stale" => counts.stale = n.max(0) as usize,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        let expires_at = Utc::now() + ttl;
        let result = sqlx::query(
            r#"
            INSERT INTO run_leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE run_leases.expires_at <= now() OR run_leases.holder = EXCLUDED.holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM run_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absence_counts_bind_without_truncation() {
        assert_eq!(absence_param(3), 3);
        assert_eq!(absence_param(u32::MAX), 4_294_967_295);
        assert!(absence_param(u32::MAX) > i64::from(i32::MAX));
    }
}

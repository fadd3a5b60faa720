//! Postgres-backed dead-letter store.
//!
//! Tests are skipped unless `DATABASE_URL` is set.

use anyhow::Context as _;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use stratum_cdc::Lsn;

use crate::dead_letter::{DeadLetter, DeadLetterStore};
use crate::{ActivityError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dead_letters (
    lsn BIGINT PRIMARY KEY,
    message TEXT NOT NULL,
    code TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    resolved BOOLEAN NOT NULL DEFAULT FALSE
);
"#;

#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connect postgres")?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("apply dead letter schema")?;
        Ok(Self { pool })
    }
}

#[derive(Debug, FromRow)]
struct PgDeadLetter {
    lsn: i64,
    message: String,
    code: Option<String>,
    retry_count: i32,
    resolved: bool,
}

impl PgDeadLetter {
    fn into_dead_letter(self) -> DeadLetter {
        DeadLetter {
            lsn: Lsn(self.lsn as u64),
            message: self.message,
            code: self.code,
            retry_count: self.retry_count as u32,
            resolved: self.resolved,
        }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn record(
        &self,
        lsn: Lsn,
        message: &str,
        code: Option<&str>,
        attempts: u32,
    ) -> Result<DeadLetter> {
        let row = sqlx::query_as::<_, PgDeadLetter>(
            "INSERT INTO dead_letters (lsn, message, code, retry_count, resolved) \
             VALUES ($1, $2, $3, $4, FALSE) \
             ON CONFLICT (lsn) DO UPDATE SET \
                 message = EXCLUDED.message, \
                 code = EXCLUDED.code, \
                 retry_count = dead_letters.retry_count + EXCLUDED.retry_count \
             RETURNING lsn, message, code, retry_count, resolved",
        )
        .bind(lsn.get() as i64)
        .bind(message)
        .bind(code)
        .bind(attempts as i32)
        .fetch_one(&self.pool)
        .await
        .context("record dead letter")?;
        Ok(row.into_dead_letter())
    }

    async fn get(&self, lsn: Lsn) -> Result<Option<DeadLetter>> {
        let row = sqlx::query_as::<_, PgDeadLetter>(
            "SELECT lsn, message, code, retry_count, resolved \
             FROM dead_letters WHERE lsn = $1",
        )
        .bind(lsn.get() as i64)
        .fetch_optional(&self.pool)
        .await
        .context("get dead letter")?;
        Ok(row.map(PgDeadLetter::into_dead_letter))
    }

    async fn list_unresolved(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, PgDeadLetter>(
            "SELECT lsn, message, code, retry_count, resolved \
             FROM dead_letters WHERE NOT resolved ORDER BY lsn",
        )
        .fetch_all(&self.pool)
        .await
        .context("list unresolved dead letters")?;
        Ok(rows.into_iter().map(PgDeadLetter::into_dead_letter).collect())
    }

    async fn list_all(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, PgDeadLetter>(
            "SELECT lsn, message, code, retry_count, resolved \
             FROM dead_letters ORDER BY lsn",
        )
        .fetch_all(&self.pool)
        .await
        .context("list dead letters")?;
        Ok(rows.into_iter().map(PgDeadLetter::into_dead_letter).collect())
    }

    async fn resolve(&self, lsn: Lsn) -> Result<()> {
        let updated = sqlx::query("UPDATE dead_letters SET resolved = TRUE WHERE lsn = $1")
            .bind(lsn.get() as i64)
            .execute(&self.pool)
            .await
            .context("resolve dead letter")?;
        if updated.rows_affected() == 0 {
            return Err(ActivityError::NotFound(lsn));
        }
        Ok(())
    }
}

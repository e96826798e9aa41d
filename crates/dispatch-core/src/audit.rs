//! Persisted record of every analysis attempt (§3 AuditRecord, §6 "Audit store").
//!
//! Grounded on `querymt::session::store::{SessionStore, SqliteSessionStore}`: an
//! async trait over CRUD-ish operations, and a `sqlx::SqlitePool`-backed implementation
//! that runs `CREATE TABLE IF NOT EXISTS` migrations on construction with indices
//! matching §6 `(content_hash)`, `(created_at)`, `(status)`, `(kind, mode)`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::model::{AuditRecord, TaskStatus};

/// Write-once-at-creation, update-once-per-field audit trail (§3, §7 "StorageError ...
/// does not abort dispatch unless initial record write fails").
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn create(&self, record: &AuditRecord) -> Result<(), DispatchError>;

    async fn finish(
        &self,
        analysis_id: Uuid,
        status: TaskStatus,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
        error: Option<&str>,
    ) -> Result<(), DispatchError>;

    async fn get(&self, analysis_id: Uuid) -> Result<Option<AuditRecord>, DispatchError>;

    async fn by_content_hash(&self, content_hash: &str) -> Result<Vec<AuditRecord>, DispatchError>;
}

/// An `AuditStore` that keeps no record of anything — used when `api_keys`/storage is
/// unconfigured in tests or minimal deployments. Writes after the initial record are
/// "logged; does not abort" per §7, so this degenerate impl is always a legal choice.
#[derive(Debug, Default)]
pub struct NullAuditStore;

#[async_trait]
impl AuditStore for NullAuditStore {
    async fn create(&self, _record: &AuditRecord) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn finish(
        &self,
        _analysis_id: Uuid,
        _status: TaskStatus,
        _input_tokens: u64,
        _output_tokens: u64,
        _cost_usd: f64,
        _error: Option<&str>,
    ) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn get(&self, _analysis_id: Uuid) -> Result<Option<AuditRecord>, DispatchError> {
        Ok(None)
    }

    async fn by_content_hash(&self, _content_hash: &str) -> Result<Vec<AuditRecord>, DispatchError> {
        Ok(Vec::new())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteAuditStore;

#[cfg(feature = "sqlite")]
mod sqlite_store {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::{Row, SqlitePool};

    /// SQLite-backed audit trail, one row per analysis attempt.
    pub struct SqliteAuditStore {
        pool: SqlitePool,
    }

    impl SqliteAuditStore {
        pub async fn new(database_url: &str) -> Result<Self, DispatchError> {
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await?;
            Self::migrate(&pool).await?;
            Ok(Self { pool })
        }

        async fn migrate(pool: &SqlitePool) -> Result<(), DispatchError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS audit_records (
                    analysis_id TEXT PRIMARY KEY NOT NULL,
                    kind TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    model TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    content_size INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    cost_usd REAL NOT NULL DEFAULT 0,
                    error TEXT
                );",
            )
            .execute(pool)
            .await?;

            for (name, column) in [
                ("idx_audit_content_hash", "content_hash"),
                ("idx_audit_created_at", "started_at"),
                ("idx_audit_status", "status"),
            ] {
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS {name} ON audit_records({column});"
                ))
                .execute(pool)
                .await?;
            }
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_audit_kind_mode ON audit_records(kind, mode);",
            )
            .execute(pool)
            .await?;

            Ok(())
        }

        fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<AuditRecord, DispatchError> {
            use std::str::FromStr;
            let kind: String = row.try_get("kind")?;
            let mode: String = row.try_get("mode")?;
            let status: String = row.try_get("status")?;
            let started_at: i64 = row.try_get("started_at")?;
            let completed_at: Option<i64> = row.try_get("completed_at")?;
            Ok(AuditRecord {
                analysis_id: Uuid::parse_str(&row.try_get::<String, _>("analysis_id")?)
                    .map_err(|e| DispatchError::StorageError(e.to_string()))?,
                kind: crate::model::LogKind::from_str(&kind)?,
                mode: crate::model::Mode::from_str(&mode)?,
                provider: row.try_get("provider")?,
                model: row.try_get("model")?,
                content_hash: row.try_get("content_hash")?,
                content_size: row.try_get::<i64, _>("content_size")? as u64,
                status: status_from_str(&status),
                started_at: chrono::DateTime::from_timestamp(started_at, 0).unwrap_or_default(),
                completed_at: completed_at.and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
                input_tokens: row.try_get::<i64, _>("input_tokens")? as u64,
                output_tokens: row.try_get::<i64, _>("output_tokens")? as u64,
                cost_usd: row.try_get("cost_usd")?,
                error: row.try_get("error")?,
            })
        }
    }

    fn status_to_str(status: TaskStatus) -> &'static str {
        match status {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn status_from_str(s: &str) -> TaskStatus {
        match s {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }

    #[async_trait]
    impl AuditStore for SqliteAuditStore {
        async fn create(&self, record: &AuditRecord) -> Result<(), DispatchError> {
            sqlx::query(
                "INSERT INTO audit_records
                 (analysis_id, kind, mode, provider, model, content_hash, content_size, status, started_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.analysis_id.to_string())
            .bind(format!("{:?}", record.kind).to_lowercase())
            .bind(format!("{:?}", record.mode).to_lowercase())
            .bind(&record.provider)
            .bind(&record.model)
            .bind(&record.content_hash)
            .bind(record.content_size as i64)
            .bind(status_to_str(record.status))
            .bind(record.started_at.timestamp())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn finish(
            &self,
            analysis_id: Uuid,
            status: TaskStatus,
            input_tokens: u64,
            output_tokens: u64,
            cost_usd: f64,
            error: Option<&str>,
        ) -> Result<(), DispatchError> {
            sqlx::query(
                "UPDATE audit_records
                 SET status = ?, completed_at = ?, input_tokens = ?, output_tokens = ?, cost_usd = ?, error = ?
                 WHERE analysis_id = ?",
            )
            .bind(status_to_str(status))
            .bind(chrono::Utc::now().timestamp())
            .bind(input_tokens as i64)
            .bind(output_tokens as i64)
            .bind(cost_usd)
            .bind(error)
            .bind(analysis_id.to_string())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get(&self, analysis_id: Uuid) -> Result<Option<AuditRecord>, DispatchError> {
            let row = sqlx::query("SELECT * FROM audit_records WHERE analysis_id = ?")
                .bind(analysis_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::row_to_record).transpose()
        }

        async fn by_content_hash(&self, content_hash: &str) -> Result<Vec<AuditRecord>, DispatchError> {
            let rows = sqlx::query("SELECT * FROM audit_records WHERE content_hash = ? ORDER BY started_at DESC")
                .bind(content_hash)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(Self::row_to_record).collect()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::LogKind;
        use crate::model::Mode;

        fn sample_record() -> AuditRecord {
            AuditRecord {
                analysis_id: Uuid::new_v4(),
                kind: LogKind::Anr,
                mode: Mode::Quick,
                provider: "anthropic".to_string(),
                model: "claude-3-5-haiku".to_string(),
                content_hash: "abc123".to_string(),
                content_size: 42,
                status: TaskStatus::Pending,
                started_at: chrono::Utc::now(),
                completed_at: None,
                input_tokens: 0,
                output_tokens: 0,
                cost_usd: 0.0,
                error: None,
            }
        }

        #[tokio::test]
        async fn create_then_finish_round_trips() {
            let store = SqliteAuditStore::new("sqlite::memory:").await.unwrap();
            let record = sample_record();
            store.create(&record).await.unwrap();
            store
                .finish(record.analysis_id, TaskStatus::Completed, 100, 40, 0.5, None)
                .await
                .unwrap();
            let fetched = store.get(record.analysis_id).await.unwrap().unwrap();
            assert_eq!(fetched.status, TaskStatus::Completed);
            assert_eq!(fetched.input_tokens, 100);
        }

        #[tokio::test]
        async fn by_content_hash_finds_matching_rows() {
            let store = SqliteAuditStore::new("sqlite::memory:").await.unwrap();
            let record = sample_record();
            store.create(&record).await.unwrap();
            let found = store.by_content_hash("abc123").await.unwrap();
            assert_eq!(found.len(), 1);
        }
    }
}

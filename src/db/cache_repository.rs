use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::error;

use crate::errors::AppError;
use crate::models::Message;

/// Write-through mirror of thread messages plus the current-thread pointer,
/// used for crash recovery and startup resume.
#[derive(Clone)]
pub struct CacheRepository {
    pool: SqlitePool,
}

impl CacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores a snapshot of a thread's messages. The overwrite is skipped
    /// when the stored snapshot carries a newer timestamp, so a concurrent
    /// writer cannot be clobbered by a stale one.
    pub async fn save_snapshot(
        &self,
        thread_id: &str,
        messages: &[Message],
        saved_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_string(messages)
            .map_err(|e| AppError::Unexpected(format!("Failed to encode snapshot: {e}")))?;

        sqlx::query(
            "INSERT INTO thread_cache (thread_id, messages, saved_at)
             VALUES ($1, $2, $3)
             ON CONFLICT(thread_id) DO UPDATE
             SET messages = excluded.messages, saved_at = excluded.saved_at
             WHERE excluded.saved_at >= thread_cache.saved_at",
        )
        .bind(thread_id)
        .bind(&payload)
        .bind(saved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to cache snapshot for thread {thread_id}: {e}");
            AppError::cache(format!("Failed to cache snapshot for thread {thread_id}"), e)
        })?;
        Ok(())
    }

    pub async fn load_snapshot(&self, thread_id: &str) -> Result<Option<Vec<Message>>, AppError> {
        let row = sqlx::query("SELECT messages FROM thread_cache WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to load cached thread {thread_id}: {e}");
                AppError::cache(format!("Failed to load cached thread {thread_id}"), e)
            })?;

        match row {
            None => Ok(None),
            Some(row) => {
                let payload: String = row
                    .try_get("messages")
                    .map_err(|e| AppError::cache("Failed to read cached messages", e))?;
                let messages = serde_json::from_str(&payload)
                    .map_err(|e| AppError::Unexpected(format!("Corrupt cached snapshot: {e}")))?;
                Ok(Some(messages))
            }
        }
    }

    pub async fn delete_snapshot(&self, thread_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM thread_cache WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::cache(format!("Failed to delete cached thread {thread_id}"), e))?;
        Ok(())
    }

    /// Records the thread to resume on next startup (the original kept this
    /// in a URL query parameter).
    pub async fn set_current_thread(&self, thread_id: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO current_thread (slot, thread_id) VALUES (0, $1)
             ON CONFLICT(slot) DO UPDATE SET thread_id = excluded.thread_id",
        )
        .bind(thread_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to set current thread pointer: {e}");
            AppError::cache("Failed to set current thread pointer", e)
        })?;
        Ok(())
    }

    pub async fn current_thread(&self) -> Result<Option<String>, AppError> {
        let row = sqlx::query("SELECT thread_id FROM current_thread WHERE slot = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::cache("Failed to read current thread pointer", e))?;

        row.map(|r| {
            r.try_get("thread_id")
                .map_err(|e| AppError::cache("Failed to read thread_id", e))
        })
        .transpose()
    }

    pub async fn clear_current_thread(&self) -> Result<(), AppError> {
        sqlx::query("DELETE FROM current_thread WHERE slot = 0")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::cache("Failed to clear current thread pointer", e))?;
        Ok(())
    }
}

use sqlx::{Row, SqlitePool};
use tracing::error;

use crate::errors::AppError;
use crate::models::BackupRecord;

/// Unsaved-message backup records: the local fallback for messages that
/// exhausted their persistence retries. Keyed by thread id (or the
/// `pending` sentinel) and removed once the messages are confirmed stored.
#[derive(Clone)]
pub struct BackupRepository {
    pool: SqlitePool,
}

impl BackupRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, record: &BackupRecord) -> Result<(), AppError> {
        let payload = serde_json::to_string(&record.entries)
            .map_err(|e| AppError::Unexpected(format!("Failed to encode backup: {e}")))?;

        sqlx::query(
            "INSERT INTO unsaved_backups (thread_key, messages, saved_at)
             VALUES ($1, $2, $3)
             ON CONFLICT(thread_key) DO UPDATE
             SET messages = excluded.messages, saved_at = excluded.saved_at",
        )
        .bind(&record.thread_key)
        .bind(&payload)
        .bind(record.saved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save backup for {}: {e}", record.thread_key);
            AppError::cache(format!("Failed to save backup for {}", record.thread_key), e)
        })?;
        Ok(())
    }

    pub async fn find(&self, thread_key: &str) -> Result<Option<BackupRecord>, AppError> {
        let row = sqlx::query(
            "SELECT thread_key, messages, saved_at FROM unsaved_backups WHERE thread_key = $1",
        )
        .bind(thread_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::cache(format!("Failed to find backup for {thread_key}"), e))?;

        row.map(Self::from_row).transpose()
    }

    pub async fn list_all(&self) -> Result<Vec<BackupRecord>, AppError> {
        let rows = sqlx::query(
            "SELECT thread_key, messages, saved_at FROM unsaved_backups ORDER BY saved_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list backups: {e}");
            AppError::cache("Failed to list backups", e)
        })?;

        rows.into_iter().map(Self::from_row).collect()
    }

    pub async fn delete(&self, thread_key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM unsaved_backups WHERE thread_key = $1")
            .bind(thread_key)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::cache(format!("Failed to delete backup for {thread_key}"), e))?;
        Ok(())
    }

    fn from_row(row: sqlx::sqlite::SqliteRow) -> Result<BackupRecord, AppError> {
        let payload: String = row
            .try_get("messages")
            .map_err(|e| AppError::cache("Failed to read backup messages", e))?;
        let entries = serde_json::from_str(&payload)
            .map_err(|e| AppError::Unexpected(format!("Corrupt backup record: {e}")))?;
        Ok(BackupRecord {
            thread_key: row
                .try_get("thread_key")
                .map_err(|e| AppError::cache("Failed to read thread_key", e))?,
            entries,
            saved_at: row
                .try_get("saved_at")
                .map_err(|e| AppError::cache("Failed to read saved_at", e))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::models::{BackupEntry, Message};

    fn record(key: &str, content: &str) -> BackupRecord {
        BackupRecord {
            thread_key: key.to_string(),
            entries: vec![BackupEntry {
                message: Message::new_user(content),
                durable_id: None,
                idempotency_key: Uuid::new_v4().to_string(),
            }],
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_list_delete_round_trip() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let repo = BackupRepository::new(pool);

        repo.save(&record("T1", "lost message")).await.unwrap();
        repo.save(&record("pending", "other")).await.unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 2);

        let found = repo.find("T1").await.unwrap().unwrap();
        assert_eq!(found.entries[0].message.content, "lost message");

        repo.delete("T1").await.unwrap();
        assert!(repo.find("T1").await.unwrap().is_none());
        // Deleting an already-removed record is a no-op.
        repo.delete("T1").await.unwrap();
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn save_replaces_existing_record_for_same_key() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let repo = BackupRepository::new(pool);

        repo.save(&record("T1", "first")).await.unwrap();
        repo.save(&record("T1", "second")).await.unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].entries[0].message.content, "second");
    }
}

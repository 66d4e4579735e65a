//! Best-effort persistence with bounded retry and a local backup fallback.
//! Callers never block UI progress on a failed write: the message lands in a
//! backup record and the periodic sweep replays it later.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::BackendClient;
use crate::db::backup_repository::BackupRepository;
use crate::errors::AppError;
use crate::events::{UiEvent, UiSender};
use crate::models::{
    BackupEntry, BackupRecord, Message, NewMessageBody, UpdateMessageBody, PENDING_THREAD_KEY,
};

pub const PERSIST_ATTEMPTS: u32 = 3;
pub const RETRY_BACKOFF_UNIT: Duration = Duration::from_secs(1);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of a persistence attempt: the durable id the backend assigned, or
/// a note that the message went to a local backup record instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persisted {
    Stored { durable_id: String },
    Backup,
}

#[derive(Clone)]
pub struct PersistenceLayer {
    api: BackendClient,
    backups: BackupRepository,
    attempts: u32,
    backoff_unit: Duration,
}

impl PersistenceLayer {
    pub fn new(api: BackendClient, backups: BackupRepository) -> Self {
        Self::with_policy(api, backups, PERSIST_ATTEMPTS, RETRY_BACKOFF_UNIT)
    }

    pub fn with_policy(
        api: BackendClient,
        backups: BackupRepository,
        attempts: u32,
        backoff_unit: Duration,
    ) -> Self {
        Self { api, backups, attempts, backoff_unit }
    }

    /// Writes one message: POST for new messages, PUT keyed by `durable_id`
    /// for updates. Up to `attempts` tries with linear backoff; exhaustion
    /// demotes the message to a backup record under the thread's key. The
    /// idempotency key is minted once per logical write and reused across
    /// retries and replays, so the backend can deduplicate.
    pub async fn persist_message(
        &self,
        thread_id: &str,
        message: &Message,
        durable_id: Option<&str>,
    ) -> Result<Persisted, AppError> {
        let idempotency_key = Uuid::new_v4().to_string();

        match self
            .try_write(thread_id, message, durable_id, &idempotency_key)
            .await
        {
            Ok(id) => Ok(Persisted::Stored { durable_id: id }),
            Err(e) => {
                warn!("Persistence exhausted for message in thread {thread_id}: {e}");
                self.backup(thread_id, message, durable_id, idempotency_key)
                    .await?;
                Ok(Persisted::Backup)
            }
        }
    }

    /// Backs a message up under the pending sentinel when no thread exists
    /// yet (creation exhausted its retries). The sweep skips the sentinel;
    /// the next send with a real thread adopts it via [`Self::adopt_pending`].
    pub async fn backup_pending(&self, message: &Message) -> Result<(), AppError> {
        self.backup(PENDING_THREAD_KEY, message, None, Uuid::new_v4().to_string())
            .await
    }

    async fn try_write(
        &self,
        thread_id: &str,
        message: &Message,
        durable_id: Option<&str>,
        idempotency_key: &str,
    ) -> Result<String, AppError> {
        let mut last_err: Option<AppError> = None;

        for attempt in 1..=self.attempts {
            let result = match durable_id {
                Some(id) => self
                    .api
                    .put_message(
                        thread_id,
                        &UpdateMessageBody {
                            message_id: id.to_string(),
                            content: message.content.clone(),
                            idempotency_key: idempotency_key.to_string(),
                        },
                    )
                    .await
                    .map(|_| id.to_string()),
                None => self
                    .api
                    .post_message(
                        thread_id,
                        &NewMessageBody {
                            role: message.role,
                            content: message.content.clone(),
                            model: message.model.clone(),
                            idempotency_key: idempotency_key.to_string(),
                        },
                    )
                    .await,
            };

            match result {
                Ok(id) => return Ok(id),
                Err(e) => {
                    warn!("Persist attempt {attempt}/{} failed: {e}", self.attempts);
                    last_err = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff_unit * attempt).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AppError::PersistFailed {
                attempts: self.attempts,
                message: "no attempts were made".to_string(),
            }
        }))
    }

    async fn backup(
        &self,
        thread_key: &str,
        message: &Message,
        durable_id: Option<&str>,
        idempotency_key: String,
    ) -> Result<(), AppError> {
        let mut entries = self
            .backups
            .find(thread_key)
            .await?
            .map(|r| r.entries)
            .unwrap_or_default();
        entries.push(BackupEntry {
            message: message.clone(),
            durable_id: durable_id.map(str::to_string),
            idempotency_key,
        });

        self.backups
            .save(&BackupRecord {
                thread_key: thread_key.to_string(),
                entries,
                saved_at: Utc::now(),
            })
            .await?;
        info!("Saved backup record for {thread_key}");
        Ok(())
    }

    /// Re-keys a backup saved before the thread existed to the real thread
    /// id, merging with any record already stored under it.
    pub async fn adopt_pending(&self, thread_id: &str) -> Result<(), AppError> {
        let Some(pending) = self.backups.find(PENDING_THREAD_KEY).await? else {
            return Ok(());
        };

        let mut entries = self
            .backups
            .find(thread_id)
            .await?
            .map(|r| r.entries)
            .unwrap_or_default();
        entries.extend(pending.entries);

        self.backups
            .save(&BackupRecord {
                thread_key: thread_id.to_string(),
                entries,
                saved_at: Utc::now(),
            })
            .await?;
        self.backups.delete(PENDING_THREAD_KEY).await
    }

    /// One sweep pass: replays every backup record, deleting those whose
    /// entries all persisted. Partial success leaves the record for the next
    /// sweep; idempotency keys make the re-replay safe. Returns the keys of
    /// fully recovered records.
    pub async fn replay_backups(&self) -> Result<Vec<String>, AppError> {
        let records = self.backups.list_all().await?;
        let mut recovered = Vec::new();

        for record in records {
            if record.thread_key == PENDING_THREAD_KEY {
                // No thread to write to yet; adopted once one exists.
                debug!("Skipping pending backup record");
                continue;
            }

            let mut all_ok = true;
            for entry in &record.entries {
                let result = match &entry.durable_id {
                    Some(id) => self
                        .api
                        .put_message(
                            &record.thread_key,
                            &UpdateMessageBody {
                                message_id: id.clone(),
                                content: entry.message.content.clone(),
                                idempotency_key: entry.idempotency_key.clone(),
                            },
                        )
                        .await
                        .map(|_| ()),
                    None => self
                        .api
                        .post_message(
                            &record.thread_key,
                            &NewMessageBody {
                                role: entry.message.role,
                                content: entry.message.content.clone(),
                                model: entry.message.model.clone(),
                                idempotency_key: entry.idempotency_key.clone(),
                            },
                        )
                        .await
                        .map(|_| ()),
                };

                if let Err(e) = result {
                    warn!("Backup replay failed for {}: {e}", record.thread_key);
                    all_ok = false;
                }
            }

            if all_ok {
                self.backups.delete(&record.thread_key).await?;
                info!("Recovered backup record for {}", record.thread_key);
                recovered.push(record.thread_key);
            }
        }

        Ok(recovered)
    }

    /// Background sweep task. The first pass runs immediately so messages
    /// stranded by a previous run are recovered on startup.
    pub fn spawn_sweeper(self, interval: Duration, events: UiSender) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.replay_backups().await {
                    Ok(recovered) => {
                        for thread_key in recovered {
                            let _ = events.send(UiEvent::BackupRecovered { thread_key });
                        }
                    }
                    Err(e) => warn!("Backup sweep failed: {e}"),
                }
            }
        })
    }
}

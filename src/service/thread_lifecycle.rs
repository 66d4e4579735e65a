//! Thread lifecycle state machine: `NoThread → Pending → Active`, with
//! bounded creation retries and silent recreation when the server-side
//! thread has vanished.

use std::time::Duration;

use tracing::{info, warn};

use crate::api::BackendClient;
use crate::db::cache_repository::CacheRepository;
use crate::errors::AppError;

pub const CREATE_ATTEMPTS: u32 = 3;
const CREATE_BACKOFFS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadState {
    NoThread,
    Pending,
    Active(String),
}

pub struct ThreadLifecycle {
    api: BackendClient,
    cache: CacheRepository,
    state: ThreadState,
    /// Delays between creation attempts; attempt count is one more than the
    /// number of delays.
    backoffs: Vec<Duration>,
}

impl ThreadLifecycle {
    pub fn new(api: BackendClient, cache: CacheRepository) -> Self {
        Self::with_backoffs(api, cache, CREATE_BACKOFFS.to_vec())
    }

    pub fn with_backoffs(
        api: BackendClient,
        cache: CacheRepository,
        backoffs: Vec<Duration>,
    ) -> Self {
        Self { api, cache, state: ThreadState::NoThread, backoffs }
    }

    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn thread_id(&self) -> Option<&str> {
        match &self.state {
            ThreadState::Active(id) => Some(id),
            _ => None,
        }
    }

    /// Adopts an already-known thread id (resume path); no server call.
    pub fn activate(&mut self, thread_id: &str) {
        self.state = ThreadState::Active(thread_id.to_string());
    }

    pub fn reset(&mut self) {
        self.state = ThreadState::NoThread;
    }

    /// Returns the active thread id, creating one if needed. An active
    /// thread is re-verified against the backend first: a 404 means it was
    /// deleted server-side and triggers silent recreation; any other verify
    /// failure is treated as transient and the known id is used as-is.
    pub async fn ensure_thread(&mut self) -> Result<String, AppError> {
        if let ThreadState::Active(id) = &self.state {
            let id = id.clone();
            match self.api.fetch_messages(&id).await {
                Ok(_) => return Ok(id),
                Err(e) if e.is_not_found() => {
                    info!("Thread {id} no longer exists server-side; recreating");
                    self.state = ThreadState::NoThread;
                }
                Err(e) => {
                    warn!("Thread verification failed, proceeding with {id}: {e}");
                    return Ok(id);
                }
            }
        }
        self.create().await
    }

    async fn create(&mut self) -> Result<String, AppError> {
        self.state = ThreadState::Pending;
        let attempts = self.backoffs.len() as u32 + 1;

        for attempt in 0..attempts {
            match self.api.create_thread().await {
                Ok(id) => {
                    self.state = ThreadState::Active(id.clone());
                    if let Err(e) = self.cache.set_current_thread(&id).await {
                        warn!("Failed to record current thread pointer: {e}");
                    }
                    info!("Thread {id} active");
                    return Ok(id);
                }
                Err(e) => {
                    warn!(
                        "Thread creation attempt {}/{attempts} failed: {e}",
                        attempt + 1
                    );
                    if let Some(delay) = self.backoffs.get(attempt as usize) {
                        tokio::time::sleep(*delay).await;
                    }
                }
            }
        }

        self.state = ThreadState::NoThread;
        Err(AppError::ThreadCreateFailed { attempts })
    }
}

use thiserror::Error;

/// Top-level application error. Every variant carries a human-readable
/// message suitable for a one-line notice; raw errors never reach the UI
/// as panics.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Thread lifecycle errors ──────────────────────────────────────────────
    #[error("Unable to reach service: thread creation failed after {attempts} attempts")]
    ThreadCreateFailed { attempts: u32 },

    #[error("Thread '{id}' not found")]
    ThreadNotFound { id: String },

    // ── Streaming errors ─────────────────────────────────────────────────────
    #[error("A response is already streaming; wait for it to finish")]
    SendInProgress,

    #[error("The model stopped responding (no completion within {seconds}s)")]
    StreamTimeout { seconds: u64 },

    #[error("Stream transport error: {message}")]
    StreamTransport { message: String },

    // ── Plan / quota errors ──────────────────────────────────────────────────
    #[error("Plan limit reached: {message}")]
    PlanLimitExceeded { message: String },

    #[error("Model '{model_id}' is not available on the '{plan}' plan")]
    ModelNotInPlan { model_id: String, plan: String },

    // ── Persistence errors ───────────────────────────────────────────────────
    #[error("Failed to persist message after {attempts} attempts: {message}")]
    PersistFailed { attempts: u32, message: String },

    #[error("Local storage error: {message}")]
    Cache {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn cache(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::Cache { message: message.into(), source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::ThreadNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::EmptyField { .. } | AppError::FieldTooLong { .. })
    }

    /// Quota errors route to a distinct "upgrade" notice instead of the
    /// generic failure path.
    pub fn is_plan_limit(&self) -> bool {
        matches!(self, AppError::PlanLimitExceeded { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::StreamTimeout { .. })
    }
}

use crate::registry::PlanTier;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the hosted chat backend.
    pub api_base_url: String,
    /// Optional bearer token for the backend.
    pub api_key: Option<String>,
    /// Path of the local SQLite database (message cache + backups).
    pub db_path: String,
    /// Plan tier governing the available model list.
    pub plan: PlanTier,
    /// Model selected at startup; must be available on the plan.
    pub default_model: String,
}

impl Config {
    pub fn from_env() -> Self {
        let plan = std::env::var("POLYCHAT_PLAN")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();

        Self {
            api_base_url: std::env::var("POLYCHAT_API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            api_key: std::env::var("POLYCHAT_API_KEY").ok(),
            db_path: std::env::var("POLYCHAT_DB_PATH")
                .unwrap_or_else(|_| "polychat.db".to_string()),
            plan,
            default_model: std::env::var("POLYCHAT_MODEL")
                .unwrap_or_else(|_| "meta-llama/llama-3.1-8b-instruct".to_string()),
        }
    }
}

pub mod backup_repository;
pub mod cache_repository;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::errors::AppError;

/// Opens (creating if needed) the local SQLite database and applies
/// migrations. `path` may be a plain file path or a full `sqlite:` URL
/// (tests use `sqlite::memory:`).
pub async fn connect(path: &str) -> Result<SqlitePool, AppError> {
    let url = if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{path}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .map_err(|e| AppError::cache(format!("Failed to open local storage at {url}"), e))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            AppError::cache("Failed to run local storage migrations", sqlx::Error::Migrate(Box::new(e)))
        })?;

    info!("Local storage ready at {url}");
    Ok(pool)
}

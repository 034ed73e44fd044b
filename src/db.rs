use crate::constants::DB_PRAGMAS;
use crate::types::{ParleyError, Result};
use sqlx::sqlite::SqlitePool;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ParleyError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = SqlitePool::connect(&url)
        .await
        .map_err(ParleyError::Database)?;

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(ParleyError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    tracing::info!("Database initialized at {}", path_str);
    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        sqlx::query(pragma)
            .execute(pool)
            .await
            .map_err(ParleyError::Database)?;
    }
    Ok(())
}

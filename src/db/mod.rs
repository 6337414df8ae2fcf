pub mod models;
pub mod queries;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;

pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    // Parse the URL into connect options and enable file creation
    let connect_opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    // Ensure the parent directory exists before sqlx tries to open the file
    if let Some(filename) = connect_opts.clone().get_filename().to_str() {
        if filename != ":memory:" {
            if let Some(parent) = std::path::Path::new(filename).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(connect_opts)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    tracing::info!("Database initialized at {}", database_url);
    Ok(pool)
}

/// Fixed-width RFC 3339 so stored timestamps order lexicographically.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_database_gets_its_directory_created() {
        let dir = std::env::temp_dir().join(format!("netmap-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("netmap.db");

        let pool = init_pool(&format!("sqlite://{}", path.display()), 1).await.unwrap();
        assert!(path.exists());
        assert!(sqlx::query("SELECT COUNT(*) FROM devices").fetch_one(&pool).await.is_ok());

        pool.close().await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn timestamps_round_trip_at_millisecond_width() {
        let at = Utc::now();
        let text = timestamp(at);
        assert_eq!(text.len(), "2026-01-01T00:00:00.000Z".len());
        assert_eq!(timestamp(parse_timestamp(&text).unwrap()), text);
    }
}

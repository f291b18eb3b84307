//! SQLite plumbing for index files.
//!
//! An index file is written once into a fresh temporary path and renamed
//! into place, then only ever opened read-only. Rollback journaling keeps
//! the file self-contained so the rename moves everything.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Bumped whenever the table layout or blob encoding changes.
pub const FORMAT_VERSION: u32 = 1;

/// Create a new database file at `path` with the index schema.
pub async fn create(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// Open an existing index file without write access.
pub async fn open_read_only(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .read_only(true)
        .create_if_missing(false);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            position INTEGER PRIMARY KEY,
            source_path TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            sequence_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            vector BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

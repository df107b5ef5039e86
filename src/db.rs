//! SQLite bootstrap and schema migrations.
//!
//! The schema evolves by additive `ALTER TABLE` only; `migrate` is safe to
//! run against any prior version of the file.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::Result;

/// Open (creating if missing) the database at `path` and bring the schema up
/// to date.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests.
pub async fn connect_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(sqlx::Error::from)?
        .foreign_keys(true);
    // A single connection that never expires: every handle must see the same
    // in-memory db for the lifetime of the test.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id            TEXT PRIMARY KEY,
            balance_micro INTEGER NOT NULL DEFAULT 0,
            auth_hash     TEXT,
            updated_at    TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT PRIMARY KEY,
            submitter       TEXT NOT NULL,
            language        TEXT NOT NULL,
            code            TEXT NOT NULL,
            limits          TEXT NOT NULL,
            state           TEXT NOT NULL,
            assigned_worker TEXT,
            stdout          TEXT,
            stderr          TEXT,
            exit_code       INTEGER,
            created_at      TEXT NOT NULL,
            completed_at    TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id           TEXT PRIMARY KEY,
            owner        TEXT NOT NULL,
            capabilities TEXT NOT NULL,
            status       TEXT NOT NULL,
            last_seen    TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ledger_entries (
            seq        INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            job_id     TEXT,
            amount_micro INTEGER NOT NULL,
            kind       TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ledger_job ON ledger_entries(job_id)")
        .execute(pool)
        .await?;

    // Additive migrations for databases created before these columns existed.
    if !has_column(pool, "jobs", "requeues").await? {
        sqlx::query("ALTER TABLE jobs ADD COLUMN requeues INTEGER NOT NULL DEFAULT 0")
            .execute(pool)
            .await?;
    }

    Ok(())
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .any(|r| r.get::<String, _>("name") == column))
}

use anyhow::Result;
use libsql::Connection;

use crate::monitoring::types::now_unix;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Bring the pipeline schema up to date.
///
/// Safe to run from every process at startup.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Checks, responses and in-flight markers").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Check status snapshot and change log").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    // another process may have raced us through the same migration
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now_unix(), description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: dispatch side
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS checks (
            check_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            protocol TEXT NOT NULL,
            sub_verb TEXT NOT NULL,
            frequency_secs INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            owner_id TEXT NOT NULL,
            regions TEXT NOT NULL DEFAULT '[]',
            start_sched_unix INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS responses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            check_id TEXT NOT NULL,
            success INTEGER NOT NULL,
            processed_unix INTEGER NOT NULL,
            received_unix INTEGER NOT NULL,
            region TEXT NOT NULL,
            subregion TEXT NOT NULL,
            payload TEXT NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS checks_inflight (
            request_id TEXT PRIMARY KEY,
            check_id TEXT NOT NULL,
            queued_unix INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_checks_enabled ON checks(enabled)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_responses_received ON responses(received_unix)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_inflight_queued ON checks_inflight(queued_unix)", ()).await?;

    Ok(())
}

/// Migration v2: status detection
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS checks_status (
            check_id TEXT PRIMARY KEY,
            current_status TEXT NOT NULL,
            current_since INTEGER NOT NULL,
            previous_status TEXT,
            previous_since INTEGER,
            previous_duration_secs INTEGER,
            request_id TEXT NOT NULL,
            outcome_id INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS checks_status_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            check_id TEXT NOT NULL,
            current_status TEXT NOT NULL,
            current_since INTEGER NOT NULL,
            previous_status TEXT,
            previous_since INTEGER,
            previous_duration_secs INTEGER,
            request_id TEXT NOT NULL,
            outcome_id INTEGER NOT NULL,
            recorded_unix INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_status_changes_outcome ON checks_status_changes(outcome_id)",
        (),
    )
    .await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_status_changes_check ON checks_status_changes(check_id, outcome_id)",
        (),
    )
    .await?;

    Ok(())
}

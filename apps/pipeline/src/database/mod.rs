/// Database abstraction layer
///
/// Everything the pipeline persists goes through the `Database` trait,
/// backed by a pooled libSQL database.
pub mod migrations;
pub mod models;
pub mod repository;

pub use models::{CheckStatus, InFlightMarker, OutcomeRecord, Status, StatusChange};
pub use repository::{Database, DatabaseImpl};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use libsql::{Connection, Row, params};
use uuid::Uuid;

use super::models::{CheckStatus, InFlightMarker, OutcomeRecord, Status, StatusChange};
use crate::monitoring::types::{CheckDefinition, RegionTarget, now_unix};
use crate::pool::LibsqlPool;

/// Persistence used by the pipeline components
#[async_trait]
pub trait Database: Send + Sync {
    /// Get all enabled checks
    async fn enabled_checks(&self) -> Result<Vec<CheckDefinition>>;

    /// Insert or replace a check definition
    async fn save_check(&self, check: &CheckDefinition) -> Result<()>;

    async fn insert_inflight(&self, marker: &InFlightMarker) -> Result<()>;

    /// Delete the markers of the given requests, returns how many existed
    async fn delete_inflight(&self, request_ids: &[Uuid]) -> Result<u64>;

    /// Count markers queued before `before_unix`
    async fn stale_inflight(&self, before_unix: i64) -> Result<u64>;

    /// Store a batch of outcomes in one transaction
    async fn insert_outcomes(&self, outcomes: &[OutcomeRecord]) -> Result<()>;

    async fn earliest_outcome(&self) -> Result<Option<OutcomeRecord>>;

    /// Outcomes ordered by id, starting after (or at, when `inclusive`) `id`
    async fn outcomes_after(&self, id: i64, inclusive: bool, limit: usize) -> Result<Vec<OutcomeRecord>>;

    async fn latest_status_change(&self) -> Result<Option<StatusChange>>;

    /// Change log of one check, oldest first
    async fn status_history(&self, check_id: &str) -> Result<Vec<StatusChange>>;

    /// Append to the change log in one transaction
    async fn append_status_changes(&self, changes: &[CheckStatus]) -> Result<()>;

    /// Upsert snapshot rows keyed by check id in one transaction
    async fn upsert_current_statuses(&self, statuses: &[CheckStatus]) -> Result<()>;

    /// Latest change-log entry per check whose outcome is at or before `outcome_id`
    async fn status_changes_up_to(&self, outcome_id: i64) -> Result<Vec<CheckStatus>>;

    async fn current_statuses(&self) -> Result<Vec<CheckStatus>>;

    /// Delete at most `limit` outcomes received before `before_unix`, oldest first
    async fn purge_outcomes_before(&self, before_unix: i64, limit: usize) -> Result<u64>;
}

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

const OUTCOME_COLUMNS: &str =
    "id, request_id, check_id, success, processed_unix, received_unix, region, subregion, payload";

const STATUS_COLUMNS: &str = "check_id, current_status, current_since, previous_status, previous_since, \
                              previous_duration_secs, request_id, outcome_id";

impl DatabaseImpl {
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<crate::pool::LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    async fn query_statuses(conn: &Connection, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<CheckStatus>> {
        let mut rows = conn.query(sql, params).await?;
        let mut statuses = Vec::new();
        while let Some(row) = rows.next().await? {
            statuses.push(status_from_row(&row, 0)?);
        }
        Ok(statuses)
    }
}

fn outcome_from_row(row: &Row) -> Result<OutcomeRecord> {
    let request_id: String = row.get(1)?;
    Ok(OutcomeRecord {
        id: Some(row.get(0)?),
        request_id: Uuid::parse_str(&request_id)?,
        check_id: row.get(2)?,
        success: row.get::<i64>(3)? != 0,
        processed_unix: row.get(4)?,
        received_unix: row.get(5)?,
        region: row.get(6)?,
        subregion: row.get(7)?,
        payload: row.get(8)?,
    })
}

fn status_from_row(row: &Row, offset: i32) -> Result<CheckStatus> {
    let current: String = row.get(offset + 1)?;
    let previous: Option<String> = row.get(offset + 3)?;
    let request_id: String = row.get(offset + 6)?;
    Ok(CheckStatus {
        check_id: row.get(offset)?,
        current: current.parse()?,
        current_since: row.get(offset + 2)?,
        previous: previous.map(|status| status.parse::<Status>()).transpose()?,
        previous_since: row.get(offset + 4)?,
        previous_duration_secs: row.get(offset + 5)?,
        request_id: Uuid::parse_str(&request_id)?,
        outcome_id: row.get(offset + 7)?,
    })
}

fn check_from_row(row: &Row) -> Result<CheckDefinition> {
    let protocol: String = row.get(4)?;
    let regions: String = row.get(9)?;
    Ok(CheckDefinition {
        check_id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: u16::try_from(row.get::<i64>(3)?).context("port out of range")?,
        protocol: protocol.parse().map_err(anyhow::Error::msg)?,
        sub_verb: row.get(5)?,
        frequency_secs: row.get::<i64>(6)?.max(0) as u64,
        enabled: row.get::<i64>(7)? != 0,
        owner_id: row.get(8)?,
        regions: serde_json::from_str::<Vec<RegionTarget>>(&regions)?,
        start_sched_unix: row.get(10)?,
    })
}

fn status_params(status: &CheckStatus) -> impl libsql::params::IntoParams {
    params![
        status.check_id.clone(),
        status.current.as_str(),
        status.current_since,
        status.previous.map(|s| s.as_str().to_string()),
        status.previous_since,
        status.previous_duration_secs,
        status.request_id.to_string(),
        status.outcome_id
    ]
}

#[async_trait]
impl Database for DatabaseImpl {
    async fn enabled_checks(&self) -> Result<Vec<CheckDefinition>> {
        let conn = self.get_conn().await?;
        let mut stmt = conn
            .prepare(
                "SELECT check_id, name, host, port, protocol, sub_verb, frequency_secs, enabled, owner_id, regions, \
                 start_sched_unix FROM checks WHERE enabled = 1 ORDER BY check_id",
            )
            .await?;

        let mut rows = stmt.query(()).await?;
        let mut checks = Vec::new();
        while let Some(row) = rows.next().await? {
            checks.push(check_from_row(&row)?);
        }
        Ok(checks)
    }

    async fn save_check(&self, check: &CheckDefinition) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO checks (check_id, name, host, port, protocol, sub_verb, frequency_secs, enabled, owner_id, \
             regions, start_sched_unix) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(check_id) DO UPDATE SET name = excluded.name, host = excluded.host, port = excluded.port,
             protocol = excluded.protocol, sub_verb = excluded.sub_verb, frequency_secs = excluded.frequency_secs,
             enabled = excluded.enabled, owner_id = excluded.owner_id, regions = excluded.regions,
             start_sched_unix = excluded.start_sched_unix",
            params![
                check.check_id.clone(),
                check.name.clone(),
                check.host.clone(),
                check.port as i64,
                check.protocol.to_string(),
                check.sub_verb.clone(),
                check.frequency_secs as i64,
                if check.enabled { 1 } else { 0 },
                check.owner_id.clone(),
                serde_json::to_string(&check.regions)?,
                check.start_sched_unix
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert_inflight(&self, marker: &InFlightMarker) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO checks_inflight (request_id, check_id, queued_unix) VALUES (?, ?, ?)",
            params![marker.request_id.to_string(), marker.check_id.clone(), marker.queued_unix],
        )
        .await?;
        Ok(())
    }

    async fn delete_inflight(&self, request_ids: &[Uuid]) -> Result<u64> {
        if request_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        let mut deleted = 0;
        for request_id in request_ids {
            deleted += tx
                .execute("DELETE FROM checks_inflight WHERE request_id = ?", params![request_id.to_string()])
                .await?;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn stale_inflight(&self, before_unix: i64) -> Result<u64> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM checks_inflight WHERE queued_unix < ?", params![before_unix])
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn insert_outcomes(&self, outcomes: &[OutcomeRecord]) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        for outcome in outcomes {
            tx.execute(
                "INSERT INTO responses (request_id, check_id, success, processed_unix, received_unix, region, \
                 subregion, payload) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    outcome.request_id.to_string(),
                    outcome.check_id.clone(),
                    if outcome.success { 1 } else { 0 },
                    outcome.processed_unix,
                    outcome.received_unix,
                    outcome.region.clone(),
                    outcome.subregion.clone(),
                    outcome.payload.clone()
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn earliest_outcome(&self) -> Result<Option<OutcomeRecord>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {OUTCOME_COLUMNS} FROM responses ORDER BY id ASC LIMIT 1"), ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(outcome_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn outcomes_after(&self, id: i64, inclusive: bool, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let conn = self.get_conn().await?;
        let op = if inclusive { ">=" } else { ">" };
        let mut rows = conn
            .query(
                &format!("SELECT {OUTCOME_COLUMNS} FROM responses WHERE id {op} ? ORDER BY id ASC LIMIT ?"),
                params![id, limit as i64],
            )
            .await?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows.next().await? {
            outcomes.push(outcome_from_row(&row)?);
        }
        Ok(outcomes)
    }

    async fn latest_status_change(&self) -> Result<Option<StatusChange>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT id, recorded_unix, {STATUS_COLUMNS} FROM checks_status_changes ORDER BY outcome_id DESC, \
                     id DESC LIMIT 1"
                ),
                (),
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(StatusChange {
                id: row.get(0)?,
                recorded_unix: row.get(1)?,
                status: status_from_row(&row, 2)?,
            })),
            None => Ok(None),
        }
    }

    async fn status_history(&self, check_id: &str) -> Result<Vec<StatusChange>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT id, recorded_unix, {STATUS_COLUMNS} FROM checks_status_changes WHERE check_id = ? ORDER BY \
                     id"
                ),
                params![check_id],
            )
            .await?;
        let mut history = Vec::new();
        while let Some(row) = rows.next().await? {
            history.push(StatusChange { id: row.get(0)?, recorded_unix: row.get(1)?, status: status_from_row(&row, 2)? });
        }
        Ok(history)
    }

    async fn append_status_changes(&self, changes: &[CheckStatus]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        let recorded = now_unix();
        for change in changes {
            tx.execute(
                &format!(
                    "INSERT INTO checks_status_changes ({STATUS_COLUMNS}, recorded_unix) VALUES (?, ?, ?, ?, ?, ?, ?, \
                     ?, {recorded})"
                ),
                status_params(change),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_current_statuses(&self, statuses: &[CheckStatus]) -> Result<()> {
        if statuses.is_empty() {
            return Ok(());
        }
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        for status in statuses {
            tx.execute(
                &format!(
                    "INSERT INTO checks_status ({STATUS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(check_id) DO UPDATE SET current_status = excluded.current_status,
                     current_since = excluded.current_since, previous_status = excluded.previous_status,
                     previous_since = excluded.previous_since,
                     previous_duration_secs = excluded.previous_duration_secs,
                     request_id = excluded.request_id, outcome_id = excluded.outcome_id"
                ),
                status_params(status),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn status_changes_up_to(&self, outcome_id: i64) -> Result<Vec<CheckStatus>> {
        let conn = self.get_conn().await?;
        let columns = STATUS_COLUMNS.split(", ").map(|c| format!("c.{}", c.trim())).collect::<Vec<_>>().join(", ");
        Self::query_statuses(
            &conn,
            &format!(
                "SELECT {columns} FROM checks_status_changes c
                 JOIN (SELECT check_id, MAX(id) AS last_id FROM checks_status_changes
                       WHERE outcome_id <= ? GROUP BY check_id) latest ON c.id = latest.last_id
                 ORDER BY c.check_id"
            ),
            params![outcome_id],
        )
        .await
    }

    async fn current_statuses(&self) -> Result<Vec<CheckStatus>> {
        let conn = self.get_conn().await?;
        Self::query_statuses(&conn, &format!("SELECT {STATUS_COLUMNS} FROM checks_status ORDER BY check_id"), ())
            .await
    }

    async fn purge_outcomes_before(&self, before_unix: i64, limit: usize) -> Result<u64> {
        let conn = self.get_conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM responses WHERE id IN (SELECT id FROM responses WHERE received_unix < ? ORDER BY id \
                 LIMIT ?)",
                params![before_unix, limit as i64],
            )
            .await?;
        Ok(deleted)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::DatabaseImpl;
    use crate::monitoring::types::{CheckDefinition, Protocol, RegionTarget};

    /// A migrated database in a temporary directory, removed on drop
    pub(crate) async fn test_database() -> (Arc<DatabaseImpl>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.db");
        let pool = crate::pool::open_pool(&path.to_string_lossy(), 4).await.unwrap();
        (Arc::new(DatabaseImpl::new_from_pool(pool)), dir)
    }

    /// Make every statement touching `table` fail
    pub(crate) async fn drop_table(db: &DatabaseImpl, table: &str) {
        let conn = db.get_conn().await.unwrap();
        conn.execute(&format!("DROP TABLE {table}"), ()).await.unwrap();
    }

    pub(crate) fn check(id: &str, frequency_secs: u64, regions: &[(&str, &str)]) -> CheckDefinition {
        CheckDefinition {
            check_id: id.to_string(),
            name: format!("check {id}"),
            host: "http://127.0.0.1:9".into(),
            port: 9,
            protocol: Protocol::Http,
            sub_verb: "GET".into(),
            frequency_secs,
            enabled: true,
            owner_id: "owner".into(),
            regions: regions.iter().map(|(r, s)| RegionTarget::new(*r, *s)).collect(),
            start_sched_unix: 1_700_000_000,
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::monitoring::types::OutcomeEnvelope;

/// Status of a check as tracked by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// First outcome seen, nothing to compare against yet
    Init,
    Ok,
    Nok,
}

impl Status {
    pub fn from_success(success: bool) -> Self {
        if success { Status::Ok } else { Status::Nok }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Init => "INIT",
            Status::Ok => "OK",
            Status::Nok => "NOK",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "INIT" => Ok(Status::Init),
            "OK" => Ok(Status::Ok),
            "NOK" => Ok(Status::Nok),
            other => Err(anyhow::anyhow!("unknown status `{other}`")),
        }
    }
}

/// A job that was dispatched and whose outcome has not been stored yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightMarker {
    pub request_id: Uuid,
    pub check_id: String,
    pub queued_unix: i64,
}

/// Row of the `responses` table.
///
/// `id` is assigned on insert and orders outcomes by arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub id: Option<i64>,
    pub request_id: Uuid,
    pub check_id: String,
    pub success: bool,
    pub processed_unix: i64,
    /// When the collector received the outcome
    pub received_unix: i64,
    pub region: String,
    pub subregion: String,
    /// The full outcome envelope as JSON
    pub payload: String,
}

impl OutcomeRecord {
    pub fn from_envelope(outcome: &OutcomeEnvelope, received_unix: i64) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: None,
            request_id: outcome.job.request_id,
            check_id: outcome.job.check.id.clone(),
            success: outcome.success,
            processed_unix: outcome.processed_unix,
            received_unix,
            region: outcome.region.clone(),
            subregion: outcome.subregion.clone(),
            payload: serde_json::to_string(outcome)?,
        })
    }
}

/// Current status projection of one check, also the shape of a change-log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub check_id: String,
    pub current: Status,
    pub current_since: i64,
    pub previous: Option<Status>,
    pub previous_since: Option<i64>,
    pub previous_duration_secs: Option<i64>,
    /// Request whose outcome last updated this row
    pub request_id: Uuid,
    /// `responses.id` of that outcome
    pub outcome_id: i64,
}

/// Row of the append-only `checks_status_changes` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub id: i64,
    pub status: CheckStatus,
    pub recorded_unix: i64,
}

use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Conditions that stop a pipeline process.
///
/// Components return these to the supervisor in `main`, which decides to exit.
#[derive(Debug, Error)]
pub enum Error {
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
    #[error("storage: {0:#}")]
    Storage(#[source] anyhow::Error),
    #[error("malformed envelope ({reason}): {payload}")]
    MalformedEnvelope { reason: String, payload: String },
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("only {ready} of {total} workers were ready after {timeout:?}")]
    WorkersNotReady { ready: usize, total: usize, timeout: Duration },
    #[error("check `{0}` is already scheduled")]
    DuplicateCheck(String),
    #[error("no status change or stored outcome to resume from")]
    NothingToMonitor,
    #[error("configuration: {0}")]
    Config(String),
    #[error("{name} task failed: {reason}")]
    Task { name: &'static str, reason: String },
}

impl Error {
    pub fn storage(error: impl Into<anyhow::Error>) -> Self {
        Error::Storage(error.into())
    }

    pub fn task(name: &'static str, error: tokio::task::JoinError) -> Self {
        Error::Task { name, reason: error.to_string() }
    }

    pub fn malformed(reason: impl ToString, body: &[u8]) -> Self {
        Error::MalformedEnvelope {
            reason: reason.to_string(),
            payload: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

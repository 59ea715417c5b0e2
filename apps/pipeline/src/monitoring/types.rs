use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Protocol family of a check, used to pick the probe that executes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Net,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "HTTP"),
            Protocol::Net => write!(f, "NET"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HTTP" => Ok(Protocol::Http),
            "NET" => Ok(Protocol::Net),
            other => Err(format!("unknown protocol `{other}`")),
        }
    }
}

/// A (region, sub-region) pair a check may be dispatched to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionTarget {
    pub region: String,
    pub subregion: String,
}

impl RegionTarget {
    pub fn new(region: impl Into<String>, subregion: impl Into<String>) -> Self {
        Self { region: region.into(), subregion: subregion.into() }
    }

    /// Routing key on the topic exchange, `<region>.<subregion>`
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.region, self.subregion)
    }
}

impl fmt::Display for RegionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.subregion)
    }
}

/// Check definition as stored in the `checks` collection.
///
/// Created and edited outside the pipeline; the core only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDefinition {
    pub check_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub sub_verb: String,
    pub frequency_secs: u64,
    pub enabled: bool,
    pub owner_id: String,
    pub regions: Vec<RegionTarget>,
    /// Anchor of the schedule; every fire happens at `start_sched_unix + k * frequency_secs`
    pub start_sched_unix: i64,
}

impl CheckDefinition {
    /// An enabled check must have a positive frequency.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.frequency_secs > 0
    }

    pub fn snapshot(&self) -> CheckSnapshot {
        CheckSnapshot {
            id: self.check_id.clone(),
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol,
            sub_verb: self.sub_verb.clone(),
            frequency: self.frequency_secs,
            regions: self.regions.clone(),
            owner: self.owner_id.clone(),
        }
    }
}

/// Copy of a check definition frozen at dispatch time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSnapshot {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub sub_verb: String,
    pub frequency: u64,
    pub regions: Vec<RegionTarget>,
    pub owner: String,
}

/// One scheduled instance of a check, as published on the job queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub check: CheckSnapshot,
    pub request_id: Uuid,
    pub scheduled_unix: i64,
    pub queued_unix: i64,
    #[serde(default)]
    pub attempts: u32,
}

impl JobEnvelope {
    pub fn new(check: CheckSnapshot, request_id: Uuid, scheduled_unix: i64, queued_unix: i64) -> Self {
        Self { check, request_id, scheduled_unix, queued_unix, attempts: 0 }
    }
}

/// One hop of a followed redirect chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectHop {
    pub url: String,
    pub status: String,
    pub status_code: u16,
}

/// What a probe observed for one attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub success: bool,
    pub message: String,
    pub error_original: Option<String>,
    pub error_friendly: Option<String>,
    pub error_internal: Option<String>,
    pub redirect_history: Vec<RedirectHop>,
    pub content_length: Option<u64>,
}

impl ProbeReport {
    /// Mark the attempt as successful
    pub fn success(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), ..Self::default() }
    }

    /// Mark the attempt as failed. The friendly text doubles as the message.
    pub fn failure(
        original: impl Into<String>,
        friendly: impl Into<String>,
        internal: impl Into<String>,
    ) -> Self {
        let friendly = friendly.into();
        Self {
            success: false,
            message: friendly.clone(),
            error_original: Some(original.into()),
            error_friendly: Some(friendly),
            error_internal: Some(internal.into()),
            ..Self::default()
        }
    }

    pub fn with_redirects(mut self, history: Vec<RedirectHop>) -> Self {
        self.redirect_history = history;
        self
    }

    pub fn with_content_length(mut self, length: Option<u64>) -> Self {
        self.content_length = length;
        self
    }
}

/// A job plus what happened when a worker executed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeEnvelope {
    #[serde(flatten)]
    pub job: JobEnvelope,
    pub success: bool,
    /// Microseconds spent across all attempts
    pub time_spent: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_friendly: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_internal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_fatal: Option<String>,
    pub message: String,
    pub redirects: u32,
    #[serde(default)]
    pub redirect_history: Vec<RedirectHop>,
    pub region: String,
    pub subregion: String,
    pub worker_hostname: String,
    #[serde(default)]
    pub content_length: Option<u64>,
    pub received_by_worker_unix: i64,
    pub processed_unix: i64,
    pub queued_return_unix: i64,
}

impl OutcomeEnvelope {
    /// Start an outcome for a job that was just picked up by a worker
    pub fn received(job: JobEnvelope, target: &RegionTarget, worker_hostname: &str) -> Self {
        Self {
            job,
            success: false,
            time_spent: 0,
            error_original: None,
            error_friendly: None,
            error_internal: None,
            error_fatal: None,
            message: String::new(),
            redirects: 0,
            redirect_history: Vec::new(),
            region: target.region.clone(),
            subregion: target.subregion.clone(),
            worker_hostname: worker_hostname.to_string(),
            content_length: None,
            received_by_worker_unix: now_unix(),
            processed_unix: 0,
            queued_return_unix: 0,
        }
    }

    /// Copy the last probe report into the outcome
    pub fn apply_report(&mut self, report: ProbeReport) {
        self.success = report.success;
        self.message = report.message;
        self.error_original = report.error_original;
        self.error_friendly = report.error_friendly;
        self.error_internal = report.error_internal;
        self.redirects = report.redirect_history.len() as u32;
        self.redirect_history = report.redirect_history;
        self.content_length = report.content_length;
    }

    /// Record a hard probe error that was not retried
    pub fn apply_fatal(&mut self, error: String) {
        self.success = false;
        self.message = error.clone();
        self.error_fatal = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> CheckDefinition {
        CheckDefinition {
            check_id: "chk-1".into(),
            name: "example".into(),
            host: "https://example.com".into(),
            port: 443,
            protocol: Protocol::Http,
            sub_verb: "GET".into(),
            frequency_secs: 60,
            enabled: true,
            owner_id: "owner-1".into(),
            regions: vec![RegionTarget::new("eu", "a")],
            start_sched_unix: 1_700_000_000,
        }
    }

    #[test]
    fn test_zero_frequency_is_not_schedulable() {
        let mut def = definition();
        assert!(def.is_schedulable());
        def.frequency_secs = 0;
        assert!(!def.is_schedulable());
        def.frequency_secs = 60;
        def.enabled = false;
        assert!(!def.is_schedulable());
    }

    #[test]
    fn test_outcome_wire_format_uses_camel_case() {
        let job = JobEnvelope::new(definition().snapshot(), Uuid::now_v7(), 10, 11);
        let mut outcome = OutcomeEnvelope::received(job, &RegionTarget::new("eu", "a"), "host-1");
        outcome.apply_report(ProbeReport::failure("boom", "Request failed", "internal boom"));

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["scheduledUnix"], 10);
        assert_eq!(value["check"]["subVerb"], "GET");
        assert_eq!(value["check"]["protocol"], "HTTP");
        assert_eq!(value["errorFriendly"], "Request failed");
        assert_eq!(value["workerHostname"], "host-1");
        assert!(value.get("errorFatal").is_none());
    }

    #[test]
    fn test_apply_report_counts_redirects() {
        let job = JobEnvelope::new(definition().snapshot(), Uuid::now_v7(), 0, 0);
        let mut outcome = OutcomeEnvelope::received(job, &RegionTarget::new("eu", "a"), "h");
        let hops = vec![
            RedirectHop { url: "http://a".into(), status: "301 Moved Permanently".into(), status_code: 301 },
            RedirectHop { url: "https://a".into(), status: "200 OK".into(), status_code: 200 },
        ];
        outcome.apply_report(ProbeReport::success("200 OK").with_redirects(hops));
        assert!(outcome.success);
        assert_eq!(outcome.redirects, 2);
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("http".parse::<Protocol>(), Ok(Protocol::Http));
        assert_eq!("NET".parse::<Protocol>(), Ok(Protocol::Net));
        assert!("icmp".parse::<Protocol>().is_err());
        assert_eq!(RegionTarget::new("eu", "a").routing_key(), "eu.a");
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, header, redirect};
use thiserror::Error;
use tokio::time::timeout;
use url::Url;

use super::types::{JobEnvelope, ProbeReport, Protocol, RedirectHop};

const MAX_REDIRECTS: usize = 10;

/// A probe could not even be attempted. Not retried.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unsupported sub-verb `{sub_verb}` for {protocol} checks")]
    UnsupportedSubVerb { protocol: Protocol, sub_verb: String },
    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Executes one attempt of a job against its target
#[async_trait]
pub trait Probe: Send + Sync {
    async fn execute(&self, job: &JobEnvelope) -> Result<ProbeReport, ProbeError>;
}

/// One probe per protocol, picked once per job
#[derive(Clone)]
pub struct ProbeSet {
    http: Arc<dyn Probe>,
    net: Arc<dyn Probe>,
}

impl ProbeSet {
    pub fn new(probe_timeout: Duration) -> Result<Self, ProbeError> {
        Ok(Self { http: Arc::new(HttpProbe::new(probe_timeout)?), net: Arc::new(TcpProbe::new(probe_timeout)) })
    }

    pub fn with_probes(http: Arc<dyn Probe>, net: Arc<dyn Probe>) -> Self {
        Self { http, net }
    }

    pub fn select(&self, protocol: Protocol) -> Arc<dyn Probe> {
        match protocol {
            Protocol::Http => self.http.clone(),
            Protocol::Net => self.net.clone(),
        }
    }
}

/// HTTP checker. Redirects are followed by hand so each hop can be recorded.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(probe_timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder().timeout(probe_timeout).redirect(redirect::Policy::none()).build()?;
        Ok(Self { client })
    }

    fn target_url(job: &JobEnvelope) -> Result<Url, ProbeError> {
        let host = job.check.host.trim();
        let raw = if host.contains("://") {
            host.to_string()
        } else {
            let scheme = if job.check.port == 443 { "https" } else { "http" };
            format!("{scheme}://{host}:{}", job.check.port)
        };
        Url::parse(&raw).map_err(|e| ProbeError::InvalidTarget { target: raw.clone(), reason: e.to_string() })
    }

    async fn fetch(&self, method: Method, mut url: Url) -> ProbeReport {
        let mut history = Vec::new();

        loop {
            let response = match self.client.request(method.clone(), url.clone()).send().await {
                Ok(response) => response,
                Err(e) => {
                    let friendly =
                        if e.is_timeout() { "HTTP request timed out" } else { "Error while performing HTTP request" };
                    return ProbeReport::failure(e.to_string(), friendly, format!("Error while performing http call: {e}"))
                        .with_redirects(history);
                }
            };

            let status = response.status();
            let location = response.headers().get(header::LOCATION).and_then(|value| value.to_str().ok());
            if status.is_redirection() {
                if let Some(next) = location.and_then(|location| url.join(location).ok()) {
                    history.push(hop(&url, status));
                    if history.len() > MAX_REDIRECTS {
                        let text = format!("Stopped after {MAX_REDIRECTS} redirects");
                        return ProbeReport::failure(text.clone(), "Too many redirects", text).with_redirects(history);
                    }
                    url = next;
                    continue;
                }
            }

            let report = if status.is_success() {
                ProbeReport::success(status_text(status))
            } else {
                let text = format!("Status code not 2xx but {}", status_text(status));
                ProbeReport::failure(text.clone(), text.clone(), text)
            };
            return report.with_redirects(history).with_content_length(response.content_length());
        }
    }
}

fn status_text(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_u16()),
        None => status.as_u16().to_string(),
    }
}

fn hop(url: &Url, status: StatusCode) -> RedirectHop {
    RedirectHop { url: url.to_string(), status: status_text(status), status_code: status.as_u16() }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn execute(&self, job: &JobEnvelope) -> Result<ProbeReport, ProbeError> {
        let url = Self::target_url(job)?;
        let report = match job.check.sub_verb.to_ascii_uppercase().as_str() {
            "GET" => self.fetch(Method::GET, url).await,
            "HEAD" => self.fetch(Method::HEAD, url).await,
            "ROBOTSTXT" => {
                let robots = url.join("/robots.txt").map_err(|e| ProbeError::InvalidTarget {
                    target: url.to_string(),
                    reason: e.to_string(),
                })?;
                self.fetch(Method::GET, robots).await
            }
            _ => {
                return Err(ProbeError::UnsupportedSubVerb {
                    protocol: Protocol::Http,
                    sub_verb: job.check.sub_verb.clone(),
                });
            }
        };
        Ok(report)
    }
}

/// TCP port checker for `NET` checks
pub struct TcpProbe {
    timeout_duration: Duration,
}

impl TcpProbe {
    pub fn new(timeout_duration: Duration) -> Self {
        Self { timeout_duration }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn execute(&self, job: &JobEnvelope) -> Result<ProbeReport, ProbeError> {
        let target = format!("{}:{}", job.check.host.trim(), job.check.port);
        let report = match timeout(self.timeout_duration, tokio::net::TcpStream::connect(&target)).await {
            Ok(Ok(_)) => ProbeReport::success(format!("Connected to {target}")),
            Ok(Err(e)) => ProbeReport::failure(
                e.to_string(),
                "TCP connection failed",
                format!("TCP connection to {target} failed: {e}"),
            ),
            Err(_) => ProbeReport::failure(
                "connection timed out",
                "TCP connection timeout",
                format!("TCP connection to {target} timed out after {:?}", self.timeout_duration),
            ),
        };
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::{CheckSnapshot, RegionTarget};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn job(protocol: Protocol, host: &str, port: u16, sub_verb: &str) -> JobEnvelope {
        let check = CheckSnapshot {
            id: "chk".into(),
            host: host.into(),
            port,
            protocol,
            sub_verb: sub_verb.into(),
            frequency: 60,
            regions: vec![RegionTarget::new("eu", "a")],
            owner: "owner".into(),
        };
        JobEnvelope::new(check, Uuid::now_v7(), 0, 0)
    }

    /// Serve canned responses keyed by request path, one per connection
    async fn serve(routes: Vec<(&'static str, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                let mut buf = vec![0u8; 4096];
                let read = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let response = routes
                    .iter()
                    .find(|(route, _)| *route == path)
                    .map(|(_, response)| response.clone())
                    .unwrap_or_else(|| "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n".to_string());
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn ok(body: &str) -> String {
        format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}", body.len())
    }

    fn moved(to: &str) -> String {
        format!("HTTP/1.1 301 Moved Permanently\r\nlocation: {to}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
    }

    #[tokio::test]
    async fn test_http_get_success() {
        let base = serve(vec![("/", ok("hello"))]).await;
        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let report = probe.execute(&job(Protocol::Http, &base, 80, "GET")).await.unwrap();
        assert!(report.success);
        assert_eq!(report.message, "200 OK");
        assert_eq!(report.content_length, Some(5));
        assert!(report.redirect_history.is_empty());
    }

    #[tokio::test]
    async fn test_http_records_redirect_chain() {
        let base = serve(vec![("/", moved("/next")), ("/next", moved("/final")), ("/final", ok(""))]).await;
        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let report = probe.execute(&job(Protocol::Http, &base, 80, "GET")).await.unwrap();
        assert!(report.success);
        assert_eq!(report.redirect_history.len(), 2);
        assert_eq!(report.redirect_history[0].status_code, 301);
        assert!(report.redirect_history[1].url.ends_with("/next"));
    }

    #[tokio::test]
    async fn test_http_non_2xx_is_a_negative_result() {
        let base = serve(vec![]).await;
        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let report = probe.execute(&job(Protocol::Http, &base, 80, "ROBOTSTXT")).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.error_original.as_deref(), Some("Status code not 2xx but 404 Not Found"));
    }

    #[tokio::test]
    async fn test_unknown_sub_verb_is_a_hard_error() {
        let probe = HttpProbe::new(Duration::from_secs(1)).unwrap();
        let result = probe.execute(&job(Protocol::Http, "http://127.0.0.1:1", 80, "PATCH")).await;
        assert!(matches!(result, Err(ProbeError::UnsupportedSubVerb { .. })));
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new(Duration::from_secs(1));

        let report = probe.execute(&job(Protocol::Net, "127.0.0.1", port, "")).await.unwrap();
        assert!(report.success);

        drop(listener);
        let report = probe.execute(&job(Protocol::Net, "127.0.0.1", port, "")).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.error_friendly.as_deref(), Some("TCP connection failed"));
    }

    #[test]
    fn test_probe_set_selects_by_protocol() {
        let http: Arc<dyn Probe> = Arc::new(TcpProbe::new(Duration::from_secs(1)));
        let net: Arc<dyn Probe> = Arc::new(TcpProbe::new(Duration::from_secs(2)));
        let set = ProbeSet::with_probes(http.clone(), net.clone());
        assert!(Arc::ptr_eq(&set.select(Protocol::Http), &http));
        assert!(Arc::ptr_eq(&set.select(Protocol::Net), &net));
    }
}

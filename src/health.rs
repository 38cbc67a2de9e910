//! HTTP health probe for the cache endpoint
//!
//! One `HEAD /` through a blocking reqwest client with a request timeout.
//!
//! A fresh deployment has no backend configured, so varnish answering `503`
//! is the expected healthy result. A connection failure right after start-up
//! is common (containers still pulling) and is reported, not treated as fatal.

use reqwest::blocking::Client;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// 503: varnish is serving but no backend is configured yet
    UpstreamNotConfigured,
    /// Any other HTTP status
    Responding(u16),
    /// Connection refused, timed out, or not HTTP
    Unreachable(String),
}

impl HealthStatus {
    /// True if the cache answered HTTP at all
    pub fn is_responding(&self) -> bool {
        !matches!(self, Self::Unreachable(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamNotConfigured => write!(f, "responding (503, no backend configured yet)"),
            Self::Responding(code) => write!(f, "responding (HTTP {})", code),
            Self::Unreachable(reason) => write!(f, "not responding ({})", reason),
        }
    }
}

pub fn classify_code(code: u16) -> HealthStatus {
    match code {
        503 => HealthStatus::UpstreamNotConfigured,
        other => HealthStatus::Responding(other),
    }
}

/// `HEAD /` against `127.0.0.1:<port>`
pub fn probe(port: u16, timeout: Duration) -> HealthStatus {
    probe_url(&format!("http://127.0.0.1:{}/", port), timeout)
}

pub fn probe_url(url: &str, timeout: Duration) -> HealthStatus {
    let status = match head_request(url, timeout) {
        Ok(code) => classify_code(code),
        Err(e) => HealthStatus::Unreachable(format!("{:#}", anyhow::Error::from(e))),
    };

    match &status {
        HealthStatus::Unreachable(_) => warn!("Health probe {}: {}", url, status),
        _ => info!("Health probe {}: {}", url, status),
    }
    status
}

fn head_request(url: &str, timeout: Duration) -> Result<u16, reqwest::Error> {
    // The endpoint is local; an operator's HTTP_PROXY must not reroute it
    let client = Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .no_proxy()
        .build()?;
    let response = client.head(url).send()?;
    debug!("Health probe {} answered {}", url, response.status());
    Ok(response.status().as_u16())
}

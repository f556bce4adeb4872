//! Readiness probes
//!
//! A probe repeats a cheap check (HTTP status or TCP connect) until it
//! succeeds or its time budget runs out. Network failures only mean
//! "not ready yet".

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::config::PollPolicy;

/// Budget for a single probe attempt.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// A blocking wait logs its progress every this many polls.
pub const PROGRESS_LOG_EVERY: u32 = 10;

/// What a probe checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    /// `HEAD` request; ready on HTTP 200.
    Http { url: String },
    /// Plain TCP connect; ready once the connection is accepted.
    Socket { host: String, port: u16 },
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { url } => write!(f, "http probe {url}"),
            Self::Socket { host, port } => write!(f, "socket probe {host}:{port}"),
        }
    }
}

/// A readiness check with its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub kind: ProbeKind,
    pub retry_interval: Duration,
    pub retry_timeout: Duration,
}

impl Probe {
    pub fn http(url: impl Into<String>, policy: PollPolicy) -> Self {
        Self {
            kind: ProbeKind::Http { url: url.into() },
            retry_interval: policy.interval(),
            retry_timeout: policy.timeout(),
        }
    }

    pub fn socket(host: impl Into<String>, port: u16, policy: PollPolicy) -> Self {
        Self {
            kind: ProbeKind::Socket {
                host: host.into(),
                port,
            },
            retry_interval: policy.interval(),
            retry_timeout: policy.timeout(),
        }
    }

    /// Readiness endpoint of the application server's management port.
    pub fn icm_readiness(management_port: u16, policy: PollPolicy) -> Self {
        Self::http(
            format!("http://localhost:{management_port}/status/ReadinessProbe"),
            policy,
        )
    }

    /// Run the check until it succeeds or `retry_timeout` elapses.
    ///
    /// Returns `false` once the budget is exhausted; the caller decides
    /// whether that is fatal.
    pub async fn execute(&self) -> bool {
        info!(probe = %self.kind, timeout = ?self.retry_timeout, "waiting for readiness");
        let client = match &self.kind {
            ProbeKind::Http { .. } => reqwest::Client::builder()
                .timeout(ATTEMPT_TIMEOUT)
                .connect_timeout(ATTEMPT_TIMEOUT)
                .build()
                .ok(),
            ProbeKind::Socket { .. } => None,
        };
        let ready = poll_until(
            &self.kind.to_string(),
            self.retry_interval,
            self.retry_timeout,
            || self.attempt(client.as_ref()),
        )
        .await;
        if ready {
            info!(probe = %self.kind, "ready");
        }
        ready
    }

    async fn attempt(&self, client: Option<&reqwest::Client>) -> bool {
        match &self.kind {
            ProbeKind::Http { url } => {
                let Some(client) = client else {
                    return false;
                };
                match client.head(url).send().await {
                    Ok(response) => response.status() == reqwest::StatusCode::OK,
                    Err(e) => {
                        debug!(url = %url, "probe attempt failed: {e}");
                        false
                    }
                }
            }
            ProbeKind::Socket { host, port } => {
                match timeout(ATTEMPT_TIMEOUT, TcpStream::connect((host.as_str(), *port))).await {
                    Ok(Ok(_stream)) => true,
                    Ok(Err(e)) => {
                        debug!(host = %host, port, "probe attempt failed: {e}");
                        false
                    }
                    Err(_) => false,
                }
            }
        }
    }
}

/// Call `check` every `interval` until it returns `true` or `limit` elapses.
///
/// The check always runs at least once; with a zero limit it runs exactly
/// once and no sleep happens.
pub async fn poll_until<F, Fut>(what: &str, interval: Duration, limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    let mut polls: u32 = 0;
    loop {
        if check().await {
            return true;
        }
        polls = polls.saturating_add(1);
        let elapsed = started.elapsed();
        if elapsed >= limit {
            debug!(what, polls, "gave up after {elapsed:?}");
            return false;
        }
        if polls % PROGRESS_LOG_EVERY == 0 {
            info!(what, polls, "still waiting after {}s", elapsed.as_secs());
        }
        sleep(interval.min(limit.saturating_sub(elapsed))).await;
    }
}

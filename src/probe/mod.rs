//! Probe module for target health checks.
//!
//! Supports HTTP(S) GET/POST, ICMP ping, TCP connect, PostgreSQL and Oracle.
//! Checkers never return errors: every failure is folded into a `DOWN` result.

mod http;
mod oracle;
mod ping;
mod postgres;
mod tcp;

pub use http::*;
pub use oracle::*;
pub use ping::*;
pub use postgres::*;
pub use tcp::*;

use crate::db::Target;

use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Extra time a checker gets past its own timeout before the executor gives up on it.
const CHECKER_GRACE: Duration = Duration::from_secs(1);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Raw outcome of a probe, before latency policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn up(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Up,
            latency_ms,
            status_code: None,
            message: Some(message.into()),
        }
    }

    pub fn down(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Down,
            latency_ms,
            status_code: None,
            message: Some(message.into()),
        }
    }
}

/// Protocol family a target is checked with, parsed from its type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Ping,
    Tcp,
    Postgres,
    Oracle,
}

impl Protocol {
    pub fn parse(probe_type: &str) -> Option<Self> {
        match probe_type {
            "http" | "https" | "http-post" | "https-post" => Some(Protocol::Http),
            "ping" => Some(Protocol::Ping),
            "tcp" => Some(Protocol::Tcp),
            "postgres" => Some(Protocol::Postgres),
            "oracle" => Some(Protocol::Oracle),
            _ => None,
        }
    }
}

/// A protocol-specific health check.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Probe `target`, finishing within `timeout`.
    async fn check(&self, target: &Target, timeout: Duration) -> ProbeResult;
}

/// Dispatches a target to the checker for its protocol.
pub struct ProbeExecutor {
    default_timeout: Duration,
    http: HttpChecker,
    ping: PingChecker,
    tcp: TcpChecker,
    postgres: PostgresChecker,
    oracle: OracleChecker,
}

impl ProbeExecutor {
    pub fn new(default_timeout: Duration) -> Result<Self, ProbeError> {
        Ok(Self {
            default_timeout,
            http: HttpChecker::new()?,
            ping: PingChecker,
            tcp: TcpChecker,
            postgres: PostgresChecker,
            oracle: OracleChecker,
        })
    }

    fn checker_for(&self, protocol: Protocol) -> &dyn Checker {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::Ping => &self.ping,
            Protocol::Tcp => &self.tcp,
            Protocol::Postgres => &self.postgres,
            Protocol::Oracle => &self.oracle,
        }
    }

    /// Run one check against `target`.
    pub async fn probe(&self, target: &Target) -> ProbeResult {
        let Some(protocol) = Protocol::parse(&target.probe_type) else {
            return ProbeResult::down(0, "Unknown type");
        };

        let timeout = target.timeout_or(self.default_timeout);
        let checker = self.checker_for(protocol);

        match tokio::time::timeout(timeout + CHECKER_GRACE, checker.check(target, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "{} checker for {} overran its {:?} timeout",
                    target.probe_type,
                    target.name,
                    timeout
                );
                ProbeResult::down(millis(timeout), "Connection timed out")
            }
        }
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    millis(start.elapsed())
}

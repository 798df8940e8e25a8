//! HTTP probe implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{elapsed_ms, Checker, ProbeError, ProbeResult, ProbeStatus};
use crate::db::{AuthMode, Target};

/// GET/POST checker for the `http`, `https`, `http-post` and `https-post` types.
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("uptrail/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn check(&self, target: &Target, timeout: Duration) -> ProbeResult {
        let tls = target.probe_type.starts_with("https");
        let url = normalize_url(&target.address, tls);

        let mut request = if target.probe_type.ends_with("-post") {
            self.client
                .post(&url)
                .json(&parse_payload(target.payload.as_deref()))
        } else {
            self.client.get(&url)
        };
        request = request.timeout(timeout);

        if target.auth_mode == AuthMode::Bearer {
            if let Some(token) = target.auth_token.as_deref() {
                request = request.bearer_auth(token);
            }
        }

        let start = Instant::now();

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return error_result(e, elapsed_ms(start), target.allow_unauthorized),
        };

        let code = response.status();

        // Read the full body to measure complete transfer time
        if let Err(e) = response.bytes().await {
            return error_result(e, elapsed_ms(start), target.allow_unauthorized);
        }

        ProbeResult {
            status: status_for(code, target.allow_unauthorized),
            latency_ms: elapsed_ms(start),
            status_code: Some(code.as_u16()),
            message: code.canonical_reason().map(str::to_string),
        }
    }
}

fn status_for(code: StatusCode, allow_unauthorized: bool) -> ProbeStatus {
    if code.is_success() || (allow_unauthorized && code == StatusCode::UNAUTHORIZED) {
        ProbeStatus::Up
    } else {
        ProbeStatus::Down
    }
}

fn error_result(e: reqwest::Error, latency_ms: u64, allow_unauthorized: bool) -> ProbeResult {
    let code = e.status();
    let status = if allow_unauthorized && code == Some(StatusCode::UNAUTHORIZED) {
        ProbeStatus::Up
    } else {
        ProbeStatus::Down
    };

    ProbeResult {
        status,
        latency_ms,
        status_code: code.map(|c| c.as_u16()),
        message: Some(e.to_string()),
    }
}

fn normalize_url(address: &str, tls: bool) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if tls {
        format!("https://{}", address)
    } else {
        format!("http://{}", address)
    }
}

/// POST body: the configured JSON, or an empty object when missing or invalid.
fn parse_payload(payload: Option<&str>) -> serde_json::Value {
    payload
        .and_then(|p| serde_json::from_str(p).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

//! Oracle probe implementation.
//!
//! The `oracle` driver is blocking, so each check runs on the blocking pool.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{elapsed_ms, Checker, ProbeError, ProbeResult};
use crate::db::Target;

const MISSING_FIELDS: &str =
    "Invalid Connection String. Require: Data Source=...;User Id=...;Password=...";

/// Checker for the `oracle` type: connect, `SELECT 1 FROM DUAL`, disconnect.
pub struct OracleChecker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleParams {
    pub connect_string: String,
    /// `None` connects with external (OS or wallet) authentication.
    pub credentials: Option<(String, String)>,
}

#[async_trait]
impl Checker for OracleChecker {
    async fn check(&self, target: &Target, timeout: Duration) -> ProbeResult {
        let params = match parse_oracle_address(&target.address) {
            Ok(params) => params,
            Err(e) => return ProbeResult::down(0, e.to_string()),
        };

        let start = Instant::now();
        let name = target.name.clone();
        let task = tokio::task::spawn_blocking(move || query_dual(&params, timeout, &name));

        // On timeout the blocking task keeps running and closes its own connection.
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(()))) => ProbeResult::up(elapsed_ms(start), "Oracle Connected"),
            Ok(Ok(Err(e))) => ProbeResult::down(elapsed_ms(start), e.to_string()),
            Ok(Err(e)) => ProbeResult::down(elapsed_ms(start), format!("oracle check failed: {}", e)),
            Err(_) => ProbeResult::down(elapsed_ms(start), "Connection timed out"),
        }
    }
}

fn query_dual(params: &OracleParams, timeout: Duration, name: &str) -> Result<(), oracle::Error> {
    let conn = match &params.credentials {
        Some((user, password)) => {
            oracle::Connection::connect(user, password, &params.connect_string)?
        }
        None => oracle::Connector::new("", "", &params.connect_string)
            .external_auth(true)
            .connect()?,
    };

    let result = conn
        .set_call_timeout(Some(timeout))
        .and_then(|_| conn.query_row_as::<i64>("SELECT 1 FROM DUAL", &[]))
        .map(|_| ());

    if let Err(e) = conn.close() {
        tracing::error!("Error closing oracle connection for {}: {}", name, e);
    }

    result
}

/// Parse `Data Source=...;User Id=...;Password=...` (keys case-insensitive), an
/// EZConnect style `user/password@connect_string`, or a bare connect string.
pub fn parse_oracle_address(address: &str) -> Result<OracleParams, ProbeError> {
    let mut connect_string = None;
    let mut user = None;
    let mut password = None;
    let mut keyed = false;

    for part in address.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "data source" => connect_string = Some(value.to_string()),
            "user id" => user = Some(value.to_string()),
            "password" => password = Some(value.to_string()),
            _ => continue,
        }
        keyed = true;
    }

    let missing = || ProbeError::Config(MISSING_FIELDS.to_string());

    if keyed {
        return match (connect_string, user) {
            (Some(connect_string), Some(user)) if !connect_string.is_empty() && !user.is_empty() => {
                Ok(OracleParams {
                    connect_string,
                    credentials: Some((user, password.unwrap_or_default())),
                })
            }
            _ => Err(missing()),
        };
    }

    let address = address.trim();
    let (credentials, connect_string) = match address.rsplit_once('@') {
        Some((credentials, connect)) => match credentials.split_once('/') {
            Some((u, p)) if !u.is_empty() => (Some((u.to_string(), p.to_string())), connect),
            _ => return Err(missing()),
        },
        None => (None, address),
    };

    if connect_string.is_empty() {
        return Err(missing());
    }

    Ok(OracleParams {
        connect_string: connect_string.to_string(),
        credentials,
    })
}

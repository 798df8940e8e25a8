//! PostgreSQL probe implementation.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::Connection;

use super::{elapsed_ms, Checker, ProbeResult};
use crate::db::Target;

/// Checker for the `postgres` type: connect, `SELECT 1`, disconnect.
pub struct PostgresChecker;

#[async_trait]
impl Checker for PostgresChecker {
    async fn check(&self, target: &Target, timeout: Duration) -> ProbeResult {
        let options = match connect_options(&target.address) {
            Ok(options) => options,
            Err(e) => return ProbeResult::down(0, format!("Invalid connection string: {}", e)),
        };

        let start = Instant::now();

        match tokio::time::timeout(timeout, select_one(&options, &target.name)).await {
            Ok(Ok(())) => ProbeResult::up(elapsed_ms(start), "Connected"),
            Ok(Err(e)) => ProbeResult::down(elapsed_ms(start), e.to_string()),
            Err(_) => ProbeResult::down(
                elapsed_ms(start),
                format!("Connection timed out after {}ms", timeout.as_millis()),
            ),
        }
    }
}

/// TLS is attempted but certificates are not verified unless the connection string
/// asks for it with its own `sslmode`.
fn connect_options(address: &str) -> Result<PgConnectOptions, sqlx::Error> {
    let options = PgConnectOptions::from_str(address)?;
    if address.contains("sslmode=") {
        Ok(options)
    } else {
        Ok(options.ssl_mode(PgSslMode::Prefer))
    }
}

async fn select_one(options: &PgConnectOptions, name: &str) -> Result<(), sqlx::Error> {
    let mut conn = PgConnection::connect_with(options).await?;
    let result = sqlx::query("SELECT 1").execute(&mut conn).await;

    if let Err(e) = conn.close().await {
        tracing::warn!("Error closing postgres connection for {}: {}", name, e);
    }

    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeStatus;

    fn target(address: &str) -> Target {
        Target {
            name: "orders-db".to_string(),
            probe_type: "postgres".to_string(),
            address: address.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_connect_options_keeps_explicit_sslmode() {
        let options = connect_options("postgres://u:p@db.local:5433/app?sslmode=disable").unwrap();
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_host(), "db.local");
    }

    #[tokio::test]
    async fn test_invalid_connection_string_is_down_without_io() {
        let result = PostgresChecker
            .check(&target("not a url"), Duration::from_secs(1))
            .await;
        assert_eq!(result.status, ProbeStatus::Down);
        assert_eq!(result.latency_ms, 0);
        assert!(result.message.unwrap().starts_with("Invalid connection string"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_down() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = PostgresChecker
            .check(
                &target(&format!("postgres://monitor:pw@127.0.0.1:{}/app", port)),
                Duration::from_secs(2),
            )
            .await;
        assert_eq!(result.status, ProbeStatus::Down);
        assert!(result.message.is_some());
    }
}

//! TCP connect probe implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::{elapsed_ms, millis, Checker, ProbeResult};
use crate::db::Target;

/// Checker for the `tcp` type: a bare connect to `host:port`.
pub struct TcpChecker;

#[async_trait]
impl Checker for TcpChecker {
    async fn check(&self, target: &Target, timeout: Duration) -> ProbeResult {
        let Some((host, port)) = parse_host_port(&target.address) else {
            return ProbeResult::down(0, "Invalid Host:Port format");
        };

        let start = Instant::now();

        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(mut stream)) => {
                let latency = elapsed_ms(start);
                if let Err(e) = stream.shutdown().await {
                    tracing::debug!("TCP shutdown for {} failed: {}", target.name, e);
                }
                ProbeResult::up(latency, "Connection successful")
            }
            Ok(Err(e)) => ProbeResult::down(elapsed_ms(start), e.to_string()),
            // Dropping the connect future closes the half-open socket.
            Err(_) => ProbeResult::down(millis(timeout), "Connection timed out"),
        }
    }
}

/// Split `host:port`. Bracketed IPv6 hosts (`[::1]:5432`) are accepted.
fn parse_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.trim().rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = port.parse::<u16>().ok()?;

    if host.is_empty() || port == 0 {
        return None;
    }

    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeStatus;
    use tokio::net::TcpListener;

    fn target(address: String) -> Target {
        Target {
            name: "db-port".to_string(),
            probe_type: "tcp".to_string(),
            address,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("db.local:5432"), Some(("db.local", 5432)));
        assert_eq!(parse_host_port("[::1]:22"), Some(("::1", 22)));
        assert_eq!(parse_host_port("db.local"), None);
        assert_eq!(parse_host_port(":80"), None);
        assert_eq!(parse_host_port("db.local:http"), None);
    }

    #[tokio::test]
    async fn test_tcp_connect_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = TcpChecker
            .check(&target(addr.to_string()), Duration::from_secs(2))
            .await;
        assert_eq!(result.status, ProbeStatus::Up);
        assert_eq!(result.message.as_deref(), Some("Connection successful"));
    }

    #[tokio::test]
    async fn test_tcp_refused_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpChecker
            .check(&target(addr.to_string()), Duration::from_secs(2))
            .await;
        assert_eq!(result.status, ProbeStatus::Down);
        assert!(result.message.is_some());
    }

    #[tokio::test]
    async fn test_tcp_malformed_address() {
        let result = TcpChecker
            .check(&target("just-a-host".to_string()), Duration::from_secs(2))
            .await;
        assert_eq!(result.status, ProbeStatus::Down);
        assert_eq!(result.latency_ms, 0);
    }

    #[tokio::test]
    async fn test_tcp_timeout_reports_configured_timeout() {
        // Non-routable address: either the connect hangs until our timeout or the
        // sandbox rejects it outright.
        let result = TcpChecker
            .check(&target("10.255.255.1:81".to_string()), Duration::from_millis(200))
            .await;
        assert_eq!(result.status, ProbeStatus::Down);
        if result.message.as_deref() == Some("Connection timed out") {
            assert_eq!(result.latency_ms, 200);
        }
    }
}

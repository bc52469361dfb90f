//! Probe tests against a throwaway local HTTP server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use agentguard_core::{CircuitBreakerConfig, CircuitBreakerRegistry, GuardError, RetryConfig};
use agentguard_http::{HealthStatus, ProbeClient, ProbeConfig};

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// Answer every request with `status` after `delay`. Returns the base URL
/// and a hit counter.
async fn serve(status: u16, delay: Duration) -> (String, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                let body = "ok";
                let response = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), hits)
}

fn client(threshold: u32, attempts: u32, timeout: Duration) -> ProbeClient {
    let config = ProbeConfig {
        path: "/health".into(),
        timeout,
        retry: RetryConfig {
            max_attempts: attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..Default::default()
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
        },
    };
    ProbeClient::new(Arc::new(CircuitBreakerRegistry::new()), config).expect("client")
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn healthy_agent() {
    let (url, hits) = serve(200, Duration::ZERO).await;
    let client = client(5, 2, Duration::from_secs(2));

    let report = client.probe(&url).await.expect("probe");
    assert_eq!(report.status, 200);
    assert_eq!(report.url, format!("{url}/health"));
    assert_eq!(report.health, HealthStatus::Healthy);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(client.health(&url), HealthStatus::Healthy);
}

#[tokio::test]
async fn server_errors_are_retried() {
    let (url, hits) = serve(503, Duration::ZERO).await;
    let client = client(5, 2, Duration::from_secs(2));

    let err = client.probe(&url).await.unwrap_err();
    assert!(matches!(err, GuardError::Status { status: 503, .. }), "got {err:?}");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let stats = client.breaker_for(&url).unwrap().stats();
    assert_eq!(stats.total_failures, 2);
    assert_eq!(stats.failures, 2);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (url, hits) = serve(404, Duration::ZERO).await;
    let client = client(5, 3, Duration::from_secs(2));

    let err = client.probe(&url).await.unwrap_err();
    assert!(matches!(err, GuardError::Status { status: 404, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn open_circuit_skips_the_agent() {
    let (url, hits) = serve(500, Duration::ZERO).await;
    let client = client(2, 1, Duration::from_secs(2));

    client.probe(&url).await.unwrap_err();
    client.probe(&url).await.unwrap_err();
    assert_eq!(client.health(&url), HealthStatus::Unhealthy);

    let err = client.probe(&url).await.unwrap_err();
    assert!(matches!(err, GuardError::CircuitOpen(_)), "got {err:?}");
    assert!(err.is_degraded());
    assert_eq!(hits.load(Ordering::SeqCst), 2, "open circuit sends nothing");
}

#[tokio::test]
async fn slow_agent_times_out() {
    let (url, _hits) = serve(200, Duration::from_secs(5)).await;
    let client = client(5, 1, Duration::from_millis(100));
    let start = std::time::Instant::now();

    let err = client.probe(&url).await.unwrap_err();
    assert!(matches!(err, GuardError::Timeout(_)), "got {err:?}");
    assert_eq!(err.to_string(), "health probe timed out");
    assert!(start.elapsed() < Duration::from_secs(2));

    let stats = client.breaker_for(&url).unwrap().stats();
    assert_eq!(stats.total_failures, 1, "aborted attempt counts as a failure");
}

#[tokio::test]
async fn unreachable_agent() {
    // Grab a free port, then close it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client(5, 2, Duration::from_secs(2));
    let err = client.probe(&format!("http://{addr}")).await.unwrap_err();
    assert!(matches!(err, GuardError::Http(_)), "got {err:?}");
}

//! Health check probe logic.
//!
//! A single bounded-timeout HTTP GET against a service's health endpoint,
//! producing a `HealthCheckResult`.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

use fleet_registry::HealthCheckResult;

/// Probe `http://{address}{path}` with the given timeout.
///
/// [200,400) responses are healthy. Non-2xx/3xx statuses and
/// transport-level failures (connection refused, handshake error,
/// timeout) are unhealthy; the error text is kept for classification.
pub async fn probe(
    service: &str,
    address: &str,
    path: &str,
    timeout: Duration,
) -> HealthCheckResult {
    let began = Instant::now();
    let outcome = tokio::time::timeout(timeout, probe_inner(address, path)).await;

    let (healthy, status_code, error) = match outcome {
        Ok(Ok(code)) => {
            let healthy = (200..400).contains(&code);
            if !healthy {
                debug!(%service, %address, code, "health probe non-2xx/3xx");
            }
            (healthy, Some(code), (!healthy).then(|| format!("status {code}")))
        }
        Ok(Err(e)) => {
            debug!(%service, %address, error = %e, "health probe failed");
            (false, None, Some(e))
        }
        Err(_) => {
            debug!(%service, %address, "health probe timed out");
            (false, None, Some(format!("timeout after {}ms", timeout.as_millis())))
        }
    };

    HealthCheckResult {
        service: service.to_string(),
        healthy,
        status_code,
        response_time_ms: began.elapsed().as_millis() as u64,
        error,
        timestamp: epoch_millis(),
    }
}

/// Raw http1 GET returning the status code or an error string.
async fn probe_inner(address: &str, path: &str) -> Result<u16, String> {
    let uri = format!("http://{address}{path}");

    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| format!("connect: {e}"))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| format!("handshake: {e}"))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(&uri)
        .header("host", address)
        .header("user-agent", "fleet-health/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| format!("request build: {e}"))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| format!("request: {e}"))?;
    Ok(resp.status().as_u16())
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal one-shot HTTP server returning a fixed status line.
    async fn serve_once(status_line: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = format!("{status_line}content-length: 2\r\n\r\nok");
                let _ = stream.write_all(body.as_bytes()).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn ok_response_is_healthy() {
        let addr = serve_once("HTTP/1.1 200 OK\r\n").await;
        let result = probe("api", &addr, "/health", Duration::from_secs(2)).await;

        assert!(result.healthy);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.error, None);
        assert_eq!(result.service, "api");
    }

    #[tokio::test]
    async fn redirect_counts_as_healthy() {
        let addr = serve_once("HTTP/1.1 302 Found\r\n").await;
        let result = probe("api", &addr, "/health", Duration::from_secs(2)).await;

        assert!(result.healthy);
        assert_eq!(result.status_code, Some(302));
    }

    #[tokio::test]
    async fn server_error_is_unhealthy_with_status() {
        let addr = serve_once("HTTP/1.1 500 Internal Server Error\r\n").await;
        let result = probe("api", &addr, "/health", Duration::from_secs(2)).await;

        assert!(!result.healthy);
        assert_eq!(result.status_code, Some(500));
        assert!(result.error.as_deref().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn client_error_is_unhealthy() {
        let addr = serve_once("HTTP/1.1 404 Not Found\r\n").await;
        let result = probe("api", &addr, "/health", Duration::from_secs(2)).await;

        assert!(!result.healthy);
        assert_eq!(result.status_code, Some(404));
    }

    #[tokio::test]
    async fn connection_refused_is_unhealthy_with_error_text() {
        // Port 1 is essentially never listening.
        let result = probe("api", "127.0.0.1:1", "/health", Duration::from_millis(500)).await;

        assert!(!result.healthy);
        assert_eq!(result.status_code, None);
        assert!(result.error.as_deref().unwrap().contains("connect"));
    }

    #[tokio::test]
    async fn invalid_health_path_is_unhealthy_not_fatal() {
        // A path with a character the URI grammar forbids must come back
        // as an unhealthy result, not tear down the caller.
        let addr = serve_once("HTTP/1.1 200 OK\r\n").await;
        let result = probe("api", &addr, "/health check", Duration::from_secs(2)).await;

        assert!(!result.healthy);
        assert_eq!(result.status_code, None);
        assert!(result.error.as_deref().unwrap().contains("request build"));
    }

    #[tokio::test]
    async fn hung_server_times_out() {
        // Listener that accepts but never responds.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let result = probe("api", &addr, "/health", Duration::from_millis(200)).await;
        assert!(!result.healthy);
        assert!(result.error.as_deref().unwrap().contains("timeout"));
    }
}

//! HTTP probe implementation.

use std::time::{Duration, Instant};

use super::ProbeError;

/// GET the address and return the time to the response headers.
///
/// Any HTTP response counts as reachable, whatever its status code.
pub async fn run_http_probe(
    client: &reqwest::Client,
    address: &str,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let url = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    let start = Instant::now();
    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else if e.is_builder() {
                ProbeError::Config(e.to_string())
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;
    let elapsed = start.elapsed();

    tracing::trace!("HTTP probe {} answered {}", url, response.status());
    Ok(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let client = reqwest::Client::new();
        let result = run_http_probe(&client, "http://256.256.256.256", Duration::from_millis(100)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_http_probe_error_status_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/",
                axum::routing::get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let latency = run_http_probe(&client, &addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(latency < Duration::from_secs(5));
    }
}

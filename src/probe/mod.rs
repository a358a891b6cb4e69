//! Reachability probes.
//!
//! A target is an ordered list of hosts; it counts as reachable when any of
//! them answers. Ping is the default, HTTP and DNS are available for networks
//! that filter ICMP.

mod dns;
mod http;
mod ping;

pub use dns::*;
pub use http::*;
pub use ping::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ProbeKind, RuntimeSettings};

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
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

/// A successful answer from one host.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub host: String,
    pub latency: Duration,
}

/// Source of reachability answers for the poll loop.
#[async_trait]
pub trait ProbeSource: Send + Sync {
    /// Probe the configured target once. Each host gets at most
    /// `settings.probe_timeout()`.
    async fn probe(&self, settings: &RuntimeSettings) -> Result<Reply, ProbeError>;
}

/// Probes real hosts over the network.
pub struct NetworkProbe {
    http_client: reqwest::Client,
}

impl NetworkProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("heimdall/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self { http_client })
    }

    async fn probe_host(&self, kind: ProbeKind, host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        let result = match kind {
            ProbeKind::Ping => run_ping_probe(host, timeout).await,
            ProbeKind::Http => run_http_probe(&self.http_client, host, timeout).await,
            ProbeKind::Dns => run_dns_probe(host, timeout).await,
        };

        match result {
            Ok(latency) if latency >= timeout => Err(ProbeError::Timeout(timeout)),
            other => other,
        }
    }
}

#[async_trait]
impl ProbeSource for NetworkProbe {
    async fn probe(&self, settings: &RuntimeSettings) -> Result<Reply, ProbeError> {
        let timeout = settings.probe_timeout();
        let mut last_err = ProbeError::Config("no targets configured".to_string());

        for host in &settings.targets {
            match self.probe_host(settings.probe_kind, host, timeout).await {
                Ok(latency) => {
                    return Ok(Reply {
                        host: host.clone(),
                        latency,
                    })
                }
                Err(e) => {
                    tracing::debug!("{} probe of {} failed: {}", settings.probe_kind, host, e);
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }
}

/// Upper bound for one whole probe call: every host may use its full
/// timeout, plus slack for process spawn and DNS resolution.
pub fn probe_deadline(settings: &RuntimeSettings) -> Duration {
    let hosts = settings.targets.len().max(1) as u32;
    settings.probe_timeout() * hosts + Duration::from_secs(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(targets: &[&str], kind: ProbeKind) -> RuntimeSettings {
        RuntimeSettings {
            targets: targets.iter().map(|s| s.to_string()).collect(),
            probe_kind: kind,
            poll_interval: 10,
            probe_timeout: 1,
        }
    }

    #[test]
    fn test_probe_deadline_scales_with_hosts() {
        assert_eq!(probe_deadline(&settings(&["a"], ProbeKind::Ping)), Duration::from_secs(3));
        assert_eq!(probe_deadline(&settings(&["a", "b", "c"], ProbeKind::Ping)), Duration::from_secs(5));
        assert_eq!(probe_deadline(&settings(&[], ProbeKind::Ping)), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_empty_target_list_is_config_error() {
        let probe = NetworkProbe::new().unwrap();
        let err = probe.probe(&settings(&[], ProbeKind::Http)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }

    #[tokio::test]
    async fn test_http_probe_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().route("/", axum::routing::get(|| async { "ok" }));
            axum::serve(listener, app).await.unwrap();
        });

        let probe = NetworkProbe::new().unwrap();
        let reply = probe
            .probe(&settings(&["127.0.0.1:1", &addr.to_string()], ProbeKind::Http))
            .await
            .unwrap();
        assert_eq!(reply.host, addr.to_string());
    }
}

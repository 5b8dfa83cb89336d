use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use http_body_util::Empty;
use hyper::{Method, Request, body::Bytes, header::HOST};
use hyper_util::rt::TokioIo;
use tokio::{
    net::TcpStream,
    sync::watch,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::TunnelConfig;

use super::stop_requested;

/// Outcome of one request to the local service's health endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbeResult {
    pub reachable: bool,
    pub status: Option<u16>,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

impl HealthProbeResult {
    pub(crate) fn healthy(status: u16, latency: Duration) -> Self {
        HealthProbeResult {
            reachable: true,
            status: Some(status),
            latency: Some(latency),
            error: None,
        }
    }
    pub(crate) fn unhealthy(status: Option<u16>, error: impl Into<String>) -> Self {
        HealthProbeResult {
            reachable: false,
            status,
            latency: None,
            error: Some(error.into()),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait HealthProbe: Send + Sync {
    async fn probe(&self, config: &TunnelConfig) -> HealthProbeResult;
}

/// Plain HTTP/1.1 `GET` against 127.0.0.1.
pub(crate) struct HttpHealthProbe;

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, config: &TunnelConfig) -> HealthProbeResult {
        probe_local_health(config).await
    }
}

/// `GET http://127.0.0.1:{local_port}{health_path}`, bounded by the
/// configured timeout. Only 2xx counts as reachable.
pub(crate) async fn probe_local_health(config: &TunnelConfig) -> HealthProbeResult {
    let started = Instant::now();
    match tokio::time::timeout(
        config.health_timeout(),
        request_health(config.local_port, &config.health_path),
    )
    .await
    {
        Ok(Ok(status)) if (200..300).contains(&status) => {
            HealthProbeResult::healthy(status, started.elapsed())
        }
        Ok(Ok(status)) => HealthProbeResult::unhealthy(Some(status), format!("status {status}")),
        Ok(Err(e)) => HealthProbeResult::unhealthy(None, e),
        Err(_) => HealthProbeResult::unhealthy(
            None,
            format!("no answer within {}ms", config.health_timeout_ms),
        ),
    }
}

async fn request_health(port: u16, path: &str) -> Result<u16, String> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| format!("connect: {e}"))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| format!("handshake: {e}"))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "health connection closed");
        }
    });
    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, format!("127.0.0.1:{port}"))
        .body(Empty::<Bytes>::new())
        .map_err(|e| format!("request: {e}"))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("request: {e}"))?;
    Ok(response.status().as_u16())
}

/// Probes every `health_interval` until `shutdown` flips. Results are
/// published on `results` and logged; nothing else is touched.
pub(crate) async fn monitor(
    config: Arc<TunnelConfig>,
    probe: Arc<dyn HealthProbe>,
    results: Arc<watch::Sender<Option<HealthProbeResult>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.health_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_requested(&mut shutdown) => return,
        }
        let result = probe.probe(&config).await;
        if result.reachable {
            debug!(
                tunnel = %config.name,
                latency_ms = ?result.latency.map(|l| l.as_millis() as u64),
                "local service healthy"
            );
        } else {
            warn!(
                tunnel = %config.name,
                port = config.local_port,
                path = %config.health_path,
                error = result.error.as_deref().unwrap_or("unknown"),
                "local service is not answering its health check"
            );
        }
        results.send_replace(Some(result));
    }
}

//! Pull-based Prometheus view of the workload.
//!
//! Counters mirror [`crate::stats::AggregateStats`] but are labelled, and the
//! latency histogram is only fed from successful writes. The text endpoint is
//! a minimal HTTP loop that stops with the rest of the process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::debug;

use crate::error::ErrorClass;

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Registry and handles for every exported workload metric.
#[derive(Clone)]
pub struct WorkloadMetrics {
    registry: Registry,
    write_requests_total: IntCounterVec,
    write_latency_seconds: Histogram,
    connection_errors_total: IntCounterVec,
    host_transitions_total: IntCounter,
}

impl WorkloadMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("workload".to_string()), None)?;

        let write_requests_total = IntCounterVec::new(
            Opts::new("write_requests_total", "Logical write operations by final status"),
            &["status"],
        )?;
        let write_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("write_latency_seconds", "Write call latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let connection_errors_total = IntCounterVec::new(
            Opts::new(
                "connection_errors_total",
                "Terminal write failures by error class",
            ),
            &["error_type"],
        )?;
        let host_transitions_total = IntCounter::new(
            "host_transitions_total",
            "Serving-node changes observed by workers",
        )?;

        registry.register(Box::new(write_requests_total.clone()))?;
        registry.register(Box::new(write_latency_seconds.clone()))?;
        registry.register(Box::new(connection_errors_total.clone()))?;
        registry.register(Box::new(host_transitions_total.clone()))?;

        Ok(Self {
            registry,
            write_requests_total,
            write_latency_seconds,
            connection_errors_total,
            host_transitions_total,
        })
    }

    pub fn record_success(&self, latency: Duration) {
        self.write_requests_total
            .with_label_values(&["success"])
            .inc();
        self.write_latency_seconds.observe(latency.as_secs_f64());
    }

    pub fn record_failure(&self, class: ErrorClass) {
        self.write_requests_total
            .with_label_values(&["failure"])
            .inc();
        self.connection_errors_total
            .with_label_values(&[class.as_str()])
            .inc();
    }

    pub fn record_transition(&self) {
        self.host_transitions_total.inc();
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut output = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut output)
            .context("encode metrics")?;
        String::from_utf8(output).context("metrics are not utf-8")
    }
}

/// Accept loop over an already bound listener.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<WorkloadMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
            accept = listener.accept() => {
                let (stream, _) = accept.context("accept metrics connection")?;
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_metrics_connection(stream, metrics).await {
                        debug!(error = %err, "metrics request failed");
                    }
                });
            }
        }
    }
}

async fn handle_metrics_connection(
    mut stream: TcpStream,
    metrics: Arc<WorkloadMetrics>,
) -> Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await.context("read metrics request")?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let path = req
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, content_type, body) = match path {
        "/metrics" => (200, "text/plain; version=0.0.4", metrics.render_prometheus()?),
        "/live" | "/" => (200, "text/plain", "live\n".to_string()),
        _ => (404, "text/plain", "not-found\n".to_string()),
    };
    let reason = if status == 200 { "OK" } else { "Not Found" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream
        .write_all(response.as_bytes())
        .await
        .context("write metrics response")?;
    stream.flush().await.context("flush metrics response")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_expected_families() {
        let metrics = WorkloadMetrics::new().expect("metrics");
        metrics.record_success(Duration::from_millis(3));
        metrics.record_failure(ErrorClass::ConnectionLost);
        metrics.record_transition();

        let rendered = metrics.render_prometheus().expect("render");
        assert!(rendered.contains("workload_write_requests_total{status=\"success\"} 1"));
        assert!(rendered.contains("workload_write_requests_total{status=\"failure\"} 1"));
        assert!(rendered.contains("workload_connection_errors_total{error_type=\"connection_lost\"} 1"));
        assert!(rendered.contains("workload_write_latency_seconds_bucket"));
        assert!(rendered.contains("workload_host_transitions_total 1"));
    }

    #[tokio::test]
    async fn serves_metrics_over_http() {
        let metrics = Arc::new(WorkloadMetrics::new().expect("metrics"));
        metrics.record_success(Duration::from_millis(1));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve_metrics(listener, metrics, rx));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("workload_write_requests_total"));

        tx.send(true).expect("shutdown");
        server.await.expect("join").expect("server result");
    }
}

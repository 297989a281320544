//! Tiny HTTP endpoint for Prometheus scraping.
//! Uses raw `TcpListener`; no HTTP server dependency.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::metrics::PipelineMetrics;

/// How long a client gets to send its request line before it is served the
/// default exposition anyway.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Serve metrics on `addr` (e.g. "127.0.0.1:9091") until `cancel` fires.
/// `/metrics.json` returns the JSON snapshot; any other path the text exposition.
pub async fn serve_metrics(addr: &str, metrics: Arc<PipelineMetrics>, cancel: CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!("Metrics HTTP: failed to bind {}: {}", addr, e);
            return;
        }
    };

    tracing::info!("Metrics HTTP: listening on http://{}/metrics", addr);
    serve(listener, metrics, cancel).await;
}

async fn serve(listener: TcpListener, metrics: Arc<PipelineMetrics>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Metrics HTTP: shutting down");
                break;
            }
            accept = listener.accept() => {
                let Ok((stream, _)) = accept else { continue };
                // Each connection on its own task: a silent client cannot stall the loop.
                tokio::spawn(respond(stream, metrics.clone(), REQUEST_READ_TIMEOUT));
            }
        }
    }
}

async fn respond(mut stream: TcpStream, metrics: Arc<PipelineMetrics>, read_timeout: Duration) {
    let mut buf = [0u8; 1024];
    let n = match tokio::time::timeout(read_timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(_)) | Err(_) => 0,
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request.split_whitespace().nth(1).unwrap_or("/metrics");

    let (content_type, body) = if path == "/metrics.json" {
        ("application/json", metrics.snapshot().to_string())
    } else {
        (
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.to_prometheus(),
        )
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        content_type,
        body.len(),
        body
    );

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

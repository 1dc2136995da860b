// External crates
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::CONTENT_TYPE,
    http::{Method, Request, Response, StatusCode},
    service::service_fn,
};
use hyper_util::{rt::TokioExecutor, server::conn::auto::Builder as HyperServerBuilder};
use prometheus::{Encoder, TextEncoder};
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

fn render_metrics() -> Response<Full<Bytes>> {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode prometheus metrics");
        let mut response = Response::new(Full::new(Bytes::from_static(b"metrics encoding failed")));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    }

    tracing::debug!(
        writer_buffer = %buffer.len(),
        "Encoded collected metrics into prometheus text format"
    );

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse() {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn not_found() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"Not Found")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

#[instrument(
    name = "metrics_server::handler",
    target = "metrics::http",
    skip_all,
    level = "debug"
)]
async fn metrics_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => render_metrics(),
        _ => not_found(),
    })
}

/// Bind `addr` and serve `/metrics` until `cancel` fires.
#[instrument(
    name = "metrics_server::start_metrics_server",
    target = "metrics::http",
    skip_all,
    level = "debug"
)]
pub async fn start_metrics_server(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint on {addr}"))?;

    tracing::info!(
        metrics_endpoint = %addr,
        "Collector metrics available at http://{addr}/metrics"
    );

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Metrics server received shutdown signal");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept metrics connection");
                    continue;
                }
            },
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(err) = HyperServerBuilder::new(TokioExecutor::new())
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!(
                    error = %err,
                    "Metrics server error"
                );
            }
        });
    }
}

//! `GET /metrics` Prometheus exposition endpoint over the metrics
//! aggregator (C6). Only bound when the configuration names a
//! metrics listen address.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};

use crate::metrics::Aggregator;

async fn render(aggregator: Arc<Aggregator>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("static response is well-formed"));
    }

    Ok(Response::new(Body::from(aggregator.render_prometheus())))
}

/// Serve the exporter until the process is terminated. Errors binding
/// or serving are returned to the caller, which logs and exits.
pub async fn serve(addr: SocketAddr, aggregator: Arc<Aggregator>) -> hyper::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let aggregator = aggregator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| render(aggregator.clone(), req)))
        }
    });

    tracing::info!(message = "metrics exporter listening", %addr);
    Server::bind(&addr).serve(make_svc).await
}

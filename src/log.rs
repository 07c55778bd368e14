//! Structured per-connection log lines, one per terminal transition.
//! Kept separate from `trace`, which only brings up the subscriber.

use std::time::Duration;

use crate::metrics::{ProxyMetrics, Status};

pub fn connection_closed(
    access_key: &str,
    net_key: &str,
    status: Status,
    duration: Duration,
    metrics: ProxyMetrics,
) {
    match status {
        Status::Ok => info!(
            message = "connection closed",
            access_key,
            net_key,
            status = status.as_str(),
            duration_ms = duration.as_millis() as u64,
            proxy_client = metrics.proxy_client,
            client_proxy = metrics.client_proxy,
            proxy_target = metrics.proxy_target,
            target_proxy = metrics.target_proxy,
        ),
        _ => warn!(
            message = "connection closed",
            access_key,
            net_key,
            status = status.as_str(),
            duration_ms = duration.as_millis() as u64,
            proxy_client = metrics.proxy_client,
            client_proxy = metrics.client_proxy,
            proxy_target = metrics.proxy_target,
            target_proxy = metrics.target_proxy,
        ),
    }
}

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;

use ssrelay::{Aggregator, Config, Handler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    ssrelay::trace_init();

    let path = match std::env::args_os().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: ssrelay <config.yaml>");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(path.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!(message = "failed to load config", error = %e);
            return ExitCode::FAILURE;
        }
    };

    let cipher_list = match config.cipher_list() {
        Ok(list) => Arc::new(list),
        Err(e) => {
            error!(message = "failed to build cipher list", error = %e);
            return ExitCode::FAILURE;
        }
    };

    let listener = match TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(message = "failed to bind listen address", addr = %config.listen, error = %e);
            return ExitCode::FAILURE;
        }
    };

    let aggregator = Arc::new(Aggregator::default());
    let handler = Arc::new(Handler::new(
        cipher_list,
        config.dial_timeout(),
        aggregator.clone(),
    ));

    if let Some(metrics_addr) = config.metrics {
        let aggregator = aggregator.clone();
        tokio::spawn(async move {
            if let Err(e) = ssrelay::http::serve(metrics_addr, aggregator).await {
                error!(message = "metrics exporter failed", error = %e);
            }
        });
    }

    info!(message = "listening", addr = %config.listen);

    tokio::select! {
        _ = ssrelay::server::serve(listener, handler) => {}
        _ = tokio::signal::ctrl_c() => {
            info!(message = "received shutdown signal, stopping accept loop");
        }
    }

    ExitCode::SUCCESS
}

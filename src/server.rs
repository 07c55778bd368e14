//! The accept loop: binds the listen address and hands every accepted
//! connection to an independent task running the connection handler.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::handler::Handler;

pub async fn serve(listener: TcpListener, handler: Arc<Handler>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) if is_transient(&e) => {
                tracing::warn!(message = "accept failed, retrying", error = %e);
                continue;
            }
            Err(e) => {
                tracing::error!(message = "accept loop stopping on unrecoverable error", error = %e);
                return;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            handler.handle(stream, peer_addr).await;
        });
    }
}

/// Per-accept errors the OS raises for a single in-flight peer
/// (reset/aborted before we could take the socket, or a transient
/// interrupt) are worth retrying. Anything else, in particular
/// resource exhaustion (e.g. the process hit its file descriptor
/// limit), will recur on every subsequent call and must stop the loop
/// instead of spinning.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

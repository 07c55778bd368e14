//! Dialing the destination named by a parsed client address, with a
//! bounded timeout and TCP keepalive enabled on the resulting socket.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::addr::Address;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Dials upstream targets on behalf of the connection handler.
pub struct Upstream {
    dial_timeout: Duration,
}

impl Upstream {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }

    /// Connect to `destination`, failing with `ErrorKind::TimedOut` if
    /// the connect does not complete within the configured timeout.
    pub async fn connect(&self, destination: &Address) -> io::Result<TcpStream> {
        let target = destination.to_string();
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream dial timed out"))??;

        enable_keepalive(&stream)?;
        Ok(stream)
    }
}

/// Enable TCP keepalive on an accepted or dialed stream.
pub fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    sock_ref.set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_a_listening_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let upstream = Upstream::new(Duration::from_secs(1));
        let destination = Address::IPv4(std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        upstream.connect(&destination).await.unwrap();
    }

    #[tokio::test]
    async fn times_out_on_an_unroutable_address() {
        // 10.255.255.1 is conventionally unreachable/black-holed in test sandboxes.
        let upstream = Upstream::new(Duration::from_millis(50));
        let destination = Address::IPv4(std::net::SocketAddrV4::new(
            Ipv4Addr::new(10, 255, 255, 1),
            9,
        ));
        let result = upstream.connect(&destination).await;
        assert!(result.is_err());
    }
}

//! Per-connection state machine: accept -> identify -> read
//! destination -> dial upstream -> relay -> teardown, attributing the
//! outcome to the metrics aggregator on every exit path, including a
//! panic in any sub-step.

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use shadowsocks::{CipherList, EncryptedWriter};
use tokio::net::TcpStream;

use crate::addr::Address;
use crate::cipher_stream::CipherStream;
use crate::metrics::{Aggregator, ProxyMetrics, Sink, Status, INVALID_KEY};
use crate::relay::{self, Measured};
use crate::upstream::{self, Upstream};

pub struct Handler {
    cipher_list: Arc<CipherList>,
    upstream: Upstream,
    metrics: Arc<Aggregator>,
}

impl Handler {
    pub fn new(cipher_list: Arc<CipherList>, dial_timeout: Duration, metrics: Arc<Aggregator>) -> Self {
        Self {
            cipher_list,
            upstream: Upstream::new(dial_timeout),
            metrics,
        }
    }

    pub async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let started = Instant::now();
        self.metrics.add_tcp_connection();

        let net_key = net_key(peer_addr);
        let access_key = RefCell::new(INVALID_KEY.to_owned());
        let metrics = Cell::new(ProxyMetrics::default());
        // Worst case until `run` proves otherwise: if `run` panics
        // mid-relay this is the status that gets recorded.
        let status = Cell::new(Status::ErrRelay);

        scopeguard::defer! {
            let access_key = access_key.borrow();
            self.metrics.add(&access_key, &net_key, metrics.get());
            self.metrics
                .remove_tcp_connection(&access_key, status.get(), started.elapsed());
            crate::log::connection_closed(&access_key, &net_key, status.get(), started.elapsed(), metrics.get());
        }

        status.set(self.run(stream, &access_key, &metrics).await);
    }

    async fn run(
        &self,
        stream: TcpStream,
        access_key: &RefCell<String>,
        metrics: &Cell<ProxyMetrics>,
    ) -> Status {
        if let Err(e) = upstream::enable_keepalive(&stream) {
            tracing::debug!(message = "failed to enable client keepalive", error = %e);
        }

        let client = Measured::new(stream);
        let client_counters = client.counters();

        let identified = match shadowsocks::identify(client, &self.cipher_list).await {
            Ok(identified) => identified,
            Err(_) => {
                metrics.set(ProxyMetrics {
                    proxy_client: client_counters.read(),
                    client_proxy: client_counters.written(),
                    ..Default::default()
                });
                return Status::ErrCipher;
            }
        };

        *access_key.borrow_mut() = identified.index.to_string();

        let entry = self
            .cipher_list
            .get(identified.index)
            .expect("index came from this list");
        let kind = entry.kind();
        let master_key = entry.master_key().to_vec();

        let mut salt = vec![0u8; kind.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        let writer = EncryptedWriter::new(kind, &master_key, &salt);

        let mut client = CipherStream::new(identified.stream, identified.reader, writer);

        let destination = match Address::read(&mut client).await {
            Ok(addr) => addr,
            Err(_) => {
                metrics.set(ProxyMetrics {
                    proxy_client: client_counters.read(),
                    client_proxy: client_counters.written(),
                    ..Default::default()
                });
                return Status::ErrReadAddress;
            }
        };

        let upstream_stream = match self.upstream.connect(&destination).await {
            Ok(stream) => stream,
            Err(_) => {
                metrics.set(ProxyMetrics {
                    proxy_client: client_counters.read(),
                    client_proxy: client_counters.written(),
                    ..Default::default()
                });
                return Status::ErrConnect;
            }
        };

        let mut upstream_measured = Measured::new(upstream_stream);
        let upstream_counters = upstream_measured.counters();

        let relay_result = relay::thp(&mut client, &mut upstream_measured).await;

        metrics.set(ProxyMetrics {
            proxy_client: client_counters.read(),
            client_proxy: client_counters.written(),
            proxy_target: upstream_counters.written(),
            target_proxy: upstream_counters.read(),
        });

        match relay_result {
            Ok(()) => Status::Ok,
            Err(_) => Status::ErrRelay,
        }
    }
}

/// Mask the client's source address to /24 (IPv4) or /112 (IPv6).
fn net_key(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
        }
        IpAddr::V6(ip) => {
            let mut segments = ip.segments();
            segments[7] = 0;
            let masked = std::net::Ipv6Addr::from(segments);
            format!("{masked}/112")
        }
    }
}

//! Thread-safe aggregation of per-connection proxy-metrics tuples,
//! plus the abstract sink the connection handler reports terminal
//! status through.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Access key and net key both fall back to this when a connection
/// never identified a cipher or never parsed a peer address.
pub const INVALID_KEY: &str = "INVALID";

const SHARD_COUNT: usize = 16;

/// Bytes observed on each of a connection's four half-streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyMetrics {
    pub proxy_client: u64,
    pub client_proxy: u64,
    pub proxy_target: u64,
    pub target_proxy: u64,
}

impl ProxyMetrics {
    pub fn add(&mut self, other: ProxyMetrics) {
        self.proxy_client = self.proxy_client.saturating_add(other.proxy_client);
        self.client_proxy = self.client_proxy.saturating_add(other.client_proxy);
        self.proxy_target = self.proxy_target.saturating_add(other.proxy_target);
        self.target_proxy = self.target_proxy.saturating_add(other.target_proxy);
    }
}

/// Terminal status of one connection, also used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    ErrCipher,
    ErrReadAddress,
    ErrConnect,
    ErrRelay,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Ok,
        Status::ErrCipher,
        Status::ErrReadAddress,
        Status::ErrConnect,
        Status::ErrRelay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::ErrCipher => "ERR_CIPHER",
            Status::ErrReadAddress => "ERR_READ_ADDRESS",
            Status::ErrConnect => "ERR_CONNECT",
            Status::ErrRelay => "ERR_RELAY",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lock-striped `String -> ProxyMetrics` map. `Add` folds a delta
/// into the named entry; `Get` never allocates on a miss.
struct MetricsMap {
    shards: Vec<Mutex<HashMap<String, ProxyMetrics>>>,
}

impl MetricsMap {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, ProxyMetrics>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn add(&self, key: &str, delta: ProxyMetrics) {
        let mut shard = self.shard_for(key).lock();
        shard.entry(key.to_owned()).or_default().add(delta);
    }

    fn get(&self, key: &str) -> ProxyMetrics {
        self.shard_for(key)
            .lock()
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<(String, ProxyMetrics)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.lock().iter().map(|(k, v)| (k.clone(), *v)));
        }
        out
    }
}

/// The interface the exporter (C11) renders and the handler (C5)
/// reports terminal outcomes through.
pub trait Sink: Send + Sync {
    fn add_tcp_connection(&self);
    fn remove_tcp_connection(&self, access_key: &str, status: Status, duration: Duration);
}

/// Concrete metrics backend: two lock-striped maps (by access key, by
/// client network), an in-flight gauge and a total-connections and
/// per-status counters.
pub struct Aggregator {
    by_access_key: MetricsMap,
    by_net: MetricsMap,
    in_flight: AtomicI64,
    total_connections: AtomicU64,
    status_counts: [AtomicU64; Status::ALL.len()],
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            by_access_key: MetricsMap::new(),
            by_net: MetricsMap::new(),
            in_flight: AtomicI64::new(0),
            total_connections: AtomicU64::new(0),
            status_counts: Default::default(),
        }
    }

    /// Fold a connection's completed proxy-metrics tuple into both
    /// maps. Called once per connection, after both sockets are closed.
    pub fn add(&self, access_key: &str, net_key: &str, delta: ProxyMetrics) {
        self.by_access_key.add(access_key, delta);
        self.by_net.add(net_key, delta);
    }

    pub fn access_key_metrics(&self, key: &str) -> ProxyMetrics {
        self.by_access_key.get(key)
    }

    pub fn net_metrics(&self, key: &str) -> ProxyMetrics {
        self.by_net.get(key)
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn status_count(&self, status: Status) -> u64 {
        self.status_counts[status.index()].load(Ordering::Relaxed)
    }

    /// Render the current snapshot in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP ssrelay_tcp_connections_in_flight TCP connections currently being relayed.\n");
        out.push_str("# TYPE ssrelay_tcp_connections_in_flight gauge\n");
        out.push_str(&format!(
            "ssrelay_tcp_connections_in_flight {}\n",
            self.in_flight()
        ));

        out.push_str("# HELP ssrelay_tcp_connections_total Total TCP connections accepted.\n");
        out.push_str("# TYPE ssrelay_tcp_connections_total counter\n");
        out.push_str(&format!(
            "ssrelay_tcp_connections_total {}\n",
            self.total_connections()
        ));

        out.push_str("# HELP ssrelay_tcp_connections_closed_total TCP connections closed, by terminal status.\n");
        out.push_str("# TYPE ssrelay_tcp_connections_closed_total counter\n");
        for status in Status::ALL {
            out.push_str(&format!(
                "ssrelay_tcp_connections_closed_total{{status=\"{}\"}} {}\n",
                status.as_str(),
                self.status_count(status)
            ));
        }

        out.push_str("# HELP ssrelay_bytes_total Cumulative bytes observed per half-stream.\n");
        out.push_str("# TYPE ssrelay_bytes_total counter\n");
        render_map(&mut out, "access_key", &self.by_access_key);
        render_map(&mut out, "net", &self.by_net);

        out
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn render_map(out: &mut String, key_type: &str, map: &MetricsMap) {
    for (key, metrics) in map.snapshot() {
        for (direction, value) in [
            ("proxy_client", metrics.proxy_client),
            ("client_proxy", metrics.client_proxy),
            ("proxy_target", metrics.proxy_target),
            ("target_proxy", metrics.target_proxy),
        ] {
            out.push_str(&format!(
                "ssrelay_bytes_total{{key_type=\"{key_type}\",key=\"{key}\",direction=\"{direction}\"}} {value}\n"
            ));
        }
    }
}

impl Sink for Aggregator {
    fn add_tcp_connection(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn remove_tcp_connection(&self, _access_key: &str, status: Status, _duration: Duration) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.status_counts[status.index()].fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_on_absent_key_is_zero_without_allocating() {
        let agg = Aggregator::new();
        assert_eq!(agg.access_key_metrics("0"), ProxyMetrics::default());
    }

    #[test]
    fn concurrent_add_sums_linearizably() {
        let agg = Arc::new(Aggregator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let agg = agg.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    agg.add(
                        "0",
                        "10.0.0.0/24",
                        ProxyMetrics {
                            proxy_client: 1,
                            client_proxy: 2,
                            proxy_target: 3,
                            target_proxy: 4,
                        },
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let totals = agg.access_key_metrics("0");
        assert_eq!(totals.proxy_client, 8000);
        assert_eq!(totals.client_proxy, 16000);
        assert_eq!(totals.proxy_target, 24000);
        assert_eq!(totals.target_proxy, 32000);
    }

    #[test]
    fn in_flight_gauge_tracks_add_and_remove() {
        let agg = Aggregator::new();
        agg.add_tcp_connection();
        agg.add_tcp_connection();
        assert_eq!(agg.in_flight(), 2);

        agg.remove_tcp_connection("0", Status::Ok, Duration::from_millis(5));
        assert_eq!(agg.in_flight(), 1);
        assert_eq!(agg.status_count(Status::Ok), 1);
    }
}

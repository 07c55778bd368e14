pub mod addr;
mod cipher_stream;
pub mod config;
pub mod handler;
pub mod http;
mod log;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod trace;
pub mod upstream;

#[macro_use]
extern crate tracing;

pub use addr::{AddrError, Address};
pub use config::Config;
pub use handler::Handler;
pub use metrics::Aggregator;
pub use relay::thp;
pub use trace::init as trace_init;
pub use upstream::Upstream;

//! Measured duplex streams (C3) and the bidirectional relay engine (C4).

pub mod measured;
pub mod pipe;

pub use measured::{Counters, Measured};
pub use pipe::thp;

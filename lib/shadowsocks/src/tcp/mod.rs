//! Framed AEAD transport over a TCP stream: per-frame encryption and
//! decryption (`aead`), and cipher-trial identification for a freshly
//! accepted connection (`trial`).

pub mod aead;
pub mod trial;

pub use aead::{DecryptedReader, EncryptedWriter, ProtocolError, MAX_PACKET_SIZE};
pub use trial::{identify, Identified, PrefixedStream, TrialError};

//! Shadowsocks-compatible AEAD framing, key derivation and cipher-trial
//! identification for a TCP proxy relay.

pub mod cipher_list;
pub mod crypto;
pub mod tcp;

pub use cipher_list::{CipherEntry, CipherList, CipherListError};
pub use crypto::{derive_master_key, derive_subkey, Cipher, CipherKind, CryptoError};
pub use tcp::{identify, DecryptedReader, EncryptedWriter, Identified, ProtocolError, TrialError};

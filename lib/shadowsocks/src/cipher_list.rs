//! The administrator-supplied, trial-ordered list of candidate ciphers.

use bytes::Bytes;

use crate::crypto::{derive_master_key, CipherKind};

/// One entry in the cipher list: a cipher kind plus its pre-derived
/// master key. The entry's position in the list is its access-key.
pub struct CipherEntry {
    kind: CipherKind,
    master_key: Bytes,
}

impl CipherEntry {
    pub fn new(kind: CipherKind, secret: &[u8]) -> Self {
        let master_key = derive_master_key(secret, kind.key_len());
        Self {
            kind,
            master_key: Bytes::from(master_key),
        }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }
}

/// Immutable, ordered set of cipher entries shared read-only across
/// every connection for the lifetime of the server.
pub struct CipherList {
    entries: Vec<CipherEntry>,
}

#[derive(thiserror::Error, Debug)]
pub enum CipherListError {
    #[error("cipher list must not be empty")]
    Empty,
}

impl CipherList {
    pub fn new(entries: Vec<CipherEntry>) -> Result<Self, CipherListError> {
        if entries.is_empty() {
            return Err(CipherListError::Empty);
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CipherEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &CipherEntry)> {
        self.entries.iter().enumerate()
    }
}

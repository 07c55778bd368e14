//! AEAD cipher kinds and key derivation.
//!
//! Key derivation follows the classic Shadowsocks AEAD construction:
//! the configured secret is stretched into a master key with the
//! OpenSSL `EVP_BytesToKey` algorithm (repeated MD5), and every
//! connection derives an independent subkey from that master key and
//! a random per-direction salt via HKDF-SHA1 with info string
//! `"ss-subkey"`.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),
    #[error("secret too short to derive a {0}-byte key")]
    SecretTooShort(usize),
}

/// The AEAD ciphers this server is willing to speak.
///
/// Every variant here is AEAD by construction, so a `CipherKind` that
/// parses successfully can never be the "non-AEAD cipher" the
/// configuration loader is required to reject at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub const fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    pub const fn salt_len(self) -> usize {
        self.key_len()
    }

    pub const fn tag_len(self) -> usize {
        16
    }

    pub const fn nonce_len(self) -> usize {
        12
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-poly1305" | "chacha20-ietf-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => Err(CryptoError::UnsupportedCipher(other.to_owned())),
        }
    }
}

/// Stretch an arbitrary-length secret into a `key_len`-byte master key,
/// following OpenSSL's `EVP_BytesToKey` with MD5 as the digest.
pub fn derive_master_key(secret: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(secret);
        let digest = hasher.finalize();
        prev = digest.to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}

/// Derive a per-session subkey from the master key and a per-direction salt.
pub fn derive_subkey(master_key: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(SUBKEY_INFO, &mut subkey)
        .expect("subkey length is always within HKDF-SHA1's output limit");
    subkey
}

enum Inner {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

/// A concrete AEAD cipher bound to one subkey, with its own monotonic
/// nonce counter. One `Cipher` seals or opens in place; callers never
/// see the underlying RustCrypto types.
pub struct Cipher {
    inner: Inner,
    kind: CipherKind,
    nonce: [u8; 12],
}

impl Cipher {
    pub fn new(kind: CipherKind, subkey: &[u8]) -> Self {
        let inner = match kind {
            CipherKind::Aes128Gcm => Inner::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(subkey).expect("subkey length matches cipher kind"),
            )),
            CipherKind::Aes256Gcm => Inner::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(subkey).expect("subkey length matches cipher kind"),
            )),
            CipherKind::ChaCha20Poly1305 => Inner::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(subkey)
                    .expect("subkey length matches cipher kind"),
            )),
        };

        Cipher {
            inner,
            kind,
            nonce: [0u8; 12],
        }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn tag_len(&self) -> usize {
        self.kind.tag_len()
    }

    /// Encrypt `buf` in place. `buf` must have `tag_len()` bytes of
    /// trailing capacity already accounted for by the caller; on
    /// return the tag has been appended to the first
    /// `buf.len() - tag_len()` bytes of plaintext.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        let plain_len = buf.len() - self.tag_len();
        let (plain, tag_slot) = buf.split_at_mut(plain_len);
        let tag = match &self.inner {
            Inner::Aes128Gcm(c) => c
                .encrypt_in_place_detached(&self.nonce.into(), b"", plain)
                .expect("AEAD seal never fails"),
            Inner::Aes256Gcm(c) => c
                .encrypt_in_place_detached(&self.nonce.into(), b"", plain)
                .expect("AEAD seal never fails"),
            Inner::ChaCha20Poly1305(c) => c
                .encrypt_in_place_detached(&self.nonce.into(), b"", plain)
                .expect("AEAD seal never fails"),
        };
        tag_slot.copy_from_slice(&tag);
        self.increment_nonce();
    }

    /// Authenticate and decrypt `buf` in place, dropping the trailing
    /// tag on success. Returns `false` on tag mismatch; `buf`'s
    /// content is unspecified in that case but the cipher's nonce is
    /// still advanced, matching a single consumed AEAD operation.
    #[must_use]
    pub fn decrypt(&mut self, buf: &mut [u8]) -> bool {
        let tag_len = self.tag_len();
        if buf.len() < tag_len {
            return false;
        }
        let cipher_len = buf.len() - tag_len;
        let (cipher_text, tag) = buf.split_at_mut(cipher_len);
        let tag = GenericArray::clone_from_slice(tag);

        let result = match &self.inner {
            Inner::Aes128Gcm(c) => {
                c.decrypt_in_place_detached(&self.nonce.into(), b"", cipher_text, &tag)
            }
            Inner::Aes256Gcm(c) => {
                c.decrypt_in_place_detached(&self.nonce.into(), b"", cipher_text, &tag)
            }
            Inner::ChaCha20Poly1305(c) => {
                c.decrypt_in_place_detached(&self.nonce.into(), b"", cipher_text, &tag)
            }
        };

        self.increment_nonce();
        result.is_ok()
    }

    fn increment_nonce(&mut self) {
        for byte in self.nonce.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }
}

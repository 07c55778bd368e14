//! YAML configuration: listen address, cipher list, metrics endpoint.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use shadowsocks::{CipherEntry, CipherKind, CipherList, CipherListError};

const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("unsupported cipher {cipher:?}: {source}")]
    UnknownCipher {
        cipher: String,
        source: shadowsocks::CryptoError,
    },
    #[error(transparent)]
    CipherList(#[from] CipherListError),
}

#[derive(Debug, Deserialize)]
pub struct KeyConfig {
    pub cipher: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub listen: SocketAddr,
    pub keys: Vec<KeyConfig>,
    #[serde(default)]
    pub metrics: Option<SocketAddr>,
    #[serde(default)]
    pub dial_timeout_secs: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.cipher_list()?;
        Ok(config)
    }

    /// Materialize the configured keys into a trial-ordered cipher
    /// list, validating every cipher name in the process.
    pub fn cipher_list(&self) -> Result<CipherList, ConfigError> {
        let mut entries = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let kind: CipherKind =
                key.cipher
                    .parse()
                    .map_err(|source| ConfigError::UnknownCipher {
                        cipher: key.cipher.clone(),
                        source,
                    })?;
            entries.push(CipherEntry::new(kind, key.secret.as_bytes()));
        }
        Ok(CipherList::new(entries)?)
    }

    pub fn dial_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.dial_timeout_secs.unwrap_or(DEFAULT_DIAL_TIMEOUT_SECS))
    }
}

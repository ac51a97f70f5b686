//! Expected digests of downloaded artifacts.
//!
//! Accepted forms are `sha256:<hex>` and a bare `<hex>`, which implies
//! sha256. Digests are stored lower-case.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
}

impl ChecksumAlgorithm {
    /// Length of a hex-encoded digest.
    #[must_use]
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }
}

/// An expected digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

impl Checksum {
    /// Parse `sha256:<hex>` or `<hex>`.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidChecksum {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let (algorithm, digest) = match value.trim().split_once(':') {
            Some((algo, digest)) => {
                let algorithm = match algo.to_ascii_lowercase().as_str() {
                    "sha256" => ChecksumAlgorithm::Sha256,
                    _ => return Err(invalid(&format!("unsupported algorithm '{algo}'"))),
                };
                (algorithm, digest)
            }
            None => (ChecksumAlgorithm::Sha256, value.trim()),
        };

        let digest = digest.to_ascii_lowercase();
        if digest.len() != algorithm.hex_len() {
            return Err(invalid(&format!(
                "expected {} hex characters, got {}",
                algorithm.hex_len(),
                digest.len()
            )));
        }
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("digest is not hexadecimal"));
        }

        Ok(Self { algorithm, digest })
    }

    #[must_use]
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Lower-case hex digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Whether an actual hex digest matches, ignoring case.
    #[must_use]
    pub fn matches(&self, actual: &str) -> bool {
        self.digest.eq_ignore_ascii_case(actual.trim())
    }
}

impl FromStr for Checksum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.digest)
    }
}

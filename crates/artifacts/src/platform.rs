//! Platform normalization for artifact downloads.
//!
//! Hosts report their machine with `uname`, release artifacts are named
//! with Go-style identifiers. This module maps one onto the other.
//!
//! | Reported            | Normalized |
//! |---------------------|------------|
//! | `x86_64`, `amd64`   | `amd64`    |
//! | `aarch64`, `arm64`  | `arm64`    |
//! | `armv7l`, `armhf`   | `arm`      |
//! | `riscv64`           | `riscv64`  |
//! | `ppc64le`           | `ppc64le`  |
//! | `s390x`             | `s390x`    |

use crate::error::{Error, Result};
use execgraph::HostFacts;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalize a reported machine architecture.
pub fn normalize_arch(raw: &str) -> Result<String> {
    let arch = match raw.trim().to_ascii_lowercase().as_str() {
        "x86_64" | "amd64" | "x64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        "armv7l" | "armv7" | "armhf" | "arm" => "arm",
        "riscv64" => "riscv64",
        "ppc64le" => "ppc64le",
        "s390x" => "s390x",
        _ => {
            return Err(Error::UnsupportedPlatform {
                kind: "architecture",
                value: raw.trim().to_string(),
            });
        }
    };
    Ok(arch.to_string())
}

/// Normalize a reported kernel name.
pub fn normalize_os(raw: &str) -> Result<String> {
    let os = match raw.trim().to_ascii_lowercase().as_str() {
        "linux" => "linux",
        "darwin" | "macos" => "darwin",
        _ => {
            return Err(Error::UnsupportedPlatform {
                kind: "operating system",
                value: raw.trim().to_string(),
            });
        }
    };
    Ok(os.to_string())
}

/// Normalized operating system and architecture of a host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system (e.g., "linux").
    pub os: String,
    /// Architecture (e.g., "amd64").
    pub arch: String,
}

impl Platform {
    /// Build a platform from already normalized values.
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Normalize raw host facts.
    pub fn from_facts(facts: &HostFacts) -> Result<Self> {
        Ok(Self {
            os: normalize_os(&facts.os)?,
            arch: normalize_arch(&facts.arch)?,
        })
    }

    /// Same OS, a different architecture.
    pub fn with_arch(&self, arch: &str) -> Result<Self> {
        Ok(Self {
            os: self.os.clone(),
            arch: normalize_arch(arch)?,
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_arch() {
        assert_eq!(normalize_arch("x86_64").unwrap(), "amd64");
        assert_eq!(normalize_arch("amd64").unwrap(), "amd64");
        assert_eq!(normalize_arch("aarch64\n").unwrap(), "arm64");
        assert_eq!(normalize_arch("arm64").unwrap(), "arm64");
        assert_eq!(normalize_arch("armv7l").unwrap(), "arm");
        assert_eq!(normalize_arch("ppc64le").unwrap(), "ppc64le");
    }

    #[test]
    fn test_normalize_arch_rejects_unknown() {
        let err = normalize_arch("mips").unwrap_err();
        assert!(err.to_string().contains("mips"));
    }

    #[test]
    fn test_normalize_os() {
        assert_eq!(normalize_os("Linux").unwrap(), "linux");
        assert_eq!(normalize_os("Darwin").unwrap(), "darwin");
        assert!(normalize_os("Plan9").is_err());
    }

    #[test]
    fn test_from_facts() {
        let facts = HostFacts {
            arch: "aarch64".to_string(),
            os: "Linux".to_string(),
        };
        let platform = Platform::from_facts(&facts).unwrap();
        assert_eq!(platform, Platform::new("linux", "arm64"));
        assert_eq!(platform.to_string(), "linux/arm64");
    }

    #[test]
    fn test_with_arch() {
        let platform = Platform::new("linux", "amd64").with_arch("aarch64").unwrap();
        assert_eq!(platform.arch, "arm64");
        assert_eq!(platform.os, "linux");
    }
}

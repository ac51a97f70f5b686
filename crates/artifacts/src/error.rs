//! Error types for artifact planning and acquisition.
//!
//! Errors are categorized the way the failure should be handled: planning
//! errors abort the planning call before anything runs, acquisition errors
//! surface from a node's run, and platform errors mean a host reported
//! something no artifact exists for.

use execgraph::GraphError;
use std::fmt;
use std::path::PathBuf;

/// Result type alias for artifact operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of artifact errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input to a planner (missing parameter, template, graph).
    Planning,
    /// Fetching or verifying an artifact failed.
    Acquisition,
    /// Architecture or OS could not be resolved.
    Platform,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Planning => "Invalid plan input",
            Self::Acquisition => "Artifact acquisition failed",
            Self::Platform => "Unsupported platform",
        }
    }

    /// Get actionable advice for resolving this error category.
    #[must_use]
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Planning => "Check component names, versions and templates in the cluster file",
            Self::Acquisition => "Check network access to the download mirror and the checksum",
            Self::Platform => "Pin the host architecture in the inventory or use a supported host",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors raised while planning or acquiring artifacts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required request field is empty.
    #[error("missing {parameter} for component '{component}'")]
    MissingParameter {
        /// Component being requested.
        component: String,
        /// Name of the missing field.
        parameter: &'static str,
    },

    /// The registry has no entry for the component.
    #[error("unknown component: {0}")]
    UnknownComponent(String),

    /// The component is a direct binary but a binary key was requested,
    /// or the archive has no entry for the requested key.
    #[error("component '{component}' has no binary '{binary}'")]
    UnknownBinary {
        /// Component being requested.
        component: String,
        /// Requested binary key.
        binary: String,
    },

    /// A registry template failed to render.
    #[error("failed to render {field} template for '{component}': {message}")]
    Template {
        /// Component being requested.
        component: String,
        /// Which template ("url", "file", binary path).
        field: String,
        /// Renderer message.
        message: String,
    },

    /// The checksum string is malformed or uses an unsupported algorithm.
    #[error("invalid checksum '{value}': {reason}")]
    InvalidChecksum {
        /// Checksum as given.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A freshly downloaded file does not match its expected digest.
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        /// Downloaded file.
        path: PathBuf,
        /// Expected digest.
        expected: String,
        /// Actual digest.
        actual: String,
    },

    /// The host reported an architecture or OS with no artifact mapping.
    #[error("unsupported {kind}: {value}")]
    UnsupportedPlatform {
        /// "architecture" or "operating system".
        kind: &'static str,
        /// Raw value reported.
        value: String,
    },

    /// Querying the control node's platform failed.
    #[error("cannot resolve platform of {host}: {message}")]
    PlatformDetection {
        /// Host that was queried.
        host: String,
        /// Underlying failure.
        message: String,
    },

    /// Inspecting existing state on the control node failed.
    #[error("precheck on {host} failed: {message}")]
    Precheck {
        /// Host that was inspected.
        host: String,
        /// Underlying failure.
        message: String,
    },

    /// The produced fragment is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl Error {
    /// Get the error category.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::MissingParameter { .. }
            | Error::UnknownComponent(_)
            | Error::UnknownBinary { .. }
            | Error::Template { .. }
            | Error::InvalidChecksum { .. }
            | Error::Graph(_) => ErrorCategory::Planning,
            Error::ChecksumMismatch { .. } | Error::Precheck { .. } => ErrorCategory::Acquisition,
            Error::UnsupportedPlatform { .. } | Error::PlatformDetection { .. } => {
                ErrorCategory::Platform
            }
        }
    }

    pub(crate) fn precheck(host: impl fmt::Display, err: &anyhow::Error) -> Self {
        Self::Precheck {
            host: host.to_string(),
            message: format!("{err:#}"),
        }
    }
}

//! Resource identities and the cache layout derived from them.

use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// The tuple that deterministically identifies an artifact.
///
/// Every path a handle produces is a pure function of this identity plus
/// the work directory and cluster name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub component: String,
    pub version: String,
    pub arch: String,
    pub os: String,
    /// Binary requested from an archive, if any
    pub binary: Option<String>,
}

impl ResourceIdentity {
    pub fn new(component: impl Into<String>, version: impl Into<String>, platform: &Platform) -> Self {
        Self {
            component: component.into(),
            version: version.into(),
            arch: platform.arch.clone(),
            os: platform.os.clone(),
            binary: None,
        }
    }

    #[must_use]
    pub fn with_binary(mut self, binary: Option<String>) -> Self {
        self.binary = binary;
        self
    }

    /// `<work_dir>/<cluster>/<component>/<version>/<arch>`
    pub fn artifact_dir(&self, work_dir: &Path, cluster: &str) -> PathBuf {
        work_dir
            .join(cluster)
            .join(&self.component)
            .join(&self.version)
            .join(&self.arch)
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({}/{})", self.component, self.version, self.os, self.arch)?;
        if let Some(binary) = &self.binary {
            write!(f, " [{binary}]")?;
        }
        Ok(())
    }
}

/// Directory an archive is extracted into, next to the archive itself.
///
/// `etcd-3.5.9-linux-amd64.tar.gz` extracts into
/// `extracted_etcd-3.5.9-linux-amd64`.
pub fn extraction_dir(archive: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = archive.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("extracted_{}", archive_basename(&name)))
}

/// File name with any known archive extension removed.
pub fn archive_basename(file_name: &str) -> &str {
    const EXTENSIONS: [&str; 6] = [".tar.gz", ".tgz", ".tar.xz", ".tar.bz2", ".zip", ".tar"];
    EXTENSIONS
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .unwrap_or(file_name)
}

//! Control-node acquisition operations.
//!
//! Each operation follows the precheck/run/rollback contract and talks to
//! hosts only through the [`Connector`](execgraph::Connector) primitives.

use crate::checksum::Checksum;
use crate::error::Error;
use anyhow::{Context, Result};
use execgraph::digest::sha256_hex;
use execgraph::{ExecContext, Host, Operation};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Mode given to every finalized executable.
pub const EXECUTABLE_MODE: u32 = 0o755;

/// Download a URL to a fixed path, verifying its digest when known.
#[derive(Debug, Clone)]
pub struct DownloadFile {
    pub url: String,
    pub dest: PathBuf,
    pub checksum: Option<Checksum>,
}

impl DownloadFile {
    /// Whether `dest` exists and matches the expected digest, if any.
    pub fn verified(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        if !ctx.connector.exists(host, &self.dest)? {
            return Ok(false);
        }
        let Some(checksum) = &self.checksum else {
            return Ok(true);
        };
        let actual = ctx.connector.sha256(host, &self.dest)?;
        if checksum.matches(&actual) {
            Ok(true)
        } else {
            log::warn!(
                "{} does not match {}, downloading again",
                self.dest.display(),
                checksum
            );
            Ok(false)
        }
    }
}

impl Operation for DownloadFile {
    fn kind(&self) -> &'static str {
        "download"
    }

    fn describe(&self) -> String {
        format!("Download {} to {}", self.url, self.dest.display())
    }

    fn fingerprint(&self) -> String {
        let checksum = self.checksum.as_ref().map(ToString::to_string);
        format!(
            "{} -> {} [{}]",
            self.url,
            self.dest.display(),
            checksum.as_deref().unwrap_or("unverified")
        )
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        self.verified(ctx, host)
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        if let Some(parent) = self.dest.parent() {
            ctx.connector.mkdir_all(host, parent)?;
        }
        ctx.connector
            .download(host, &self.url, &self.dest)
            .with_context(|| format!("Failed to download {}", self.url))?;

        if let Some(checksum) = &self.checksum {
            let actual = ctx.connector.sha256(host, &self.dest)?;
            if !checksum.matches(&actual) {
                ctx.connector.remove(host, &self.dest)?;
                return Err(Error::ChecksumMismatch {
                    path: self.dest.clone(),
                    expected: checksum.digest().to_string(),
                    actual,
                }
                .into());
            }
        }
        Ok(())
    }

    fn rollback(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector.remove(host, &self.dest)
    }
}

/// Unpack an archive into a dedicated directory.
///
/// A marker holding the archive digest is written last, so a directory
/// left over from a different or interrupted download is never trusted.
/// Binaries finalized into the same directory by sibling handles survive
/// both a re-extraction and a rollback.
#[derive(Debug, Clone)]
pub struct ExtractArchive {
    pub archive: PathBuf,
    pub dest_dir: PathBuf,
}

impl ExtractArchive {
    fn marker(&self) -> PathBuf {
        self.dest_dir.join(EXTRACT_MARKER)
    }
}

/// Marker file of a completed extraction.
pub const EXTRACT_MARKER: &str = ".extracted";

impl Operation for ExtractArchive {
    fn kind(&self) -> &'static str {
        "extract"
    }

    fn describe(&self) -> String {
        format!(
            "Extract {} into {}",
            self.archive.display(),
            self.dest_dir.display()
        )
    }

    fn fingerprint(&self) -> String {
        format!("{} -> {}", self.archive.display(), self.dest_dir.display())
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        let marker = self.marker();
        if !ctx.connector.exists(host, &self.archive)? || !ctx.connector.exists(host, &marker)? {
            return Ok(false);
        }
        let digest = ctx.connector.sha256(host, &self.archive)?;
        Ok(ctx.connector.sha256(host, &marker)? == sha256_hex(digest.as_bytes()))
    }

    // Entries are overwritten in place; the directory is never wiped.
    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector.remove(host, &self.marker())?;
        ctx.connector.mkdir_all(host, &self.dest_dir)?;
        ctx.connector
            .extract(host, &self.archive, &self.dest_dir)
            .with_context(|| format!("Failed to extract {}", self.archive.display()))?;
        let digest = ctx.connector.sha256(host, &self.archive)?;
        ctx.connector
            .write_file(host, digest.as_bytes(), &self.marker(), 0o644)
    }

    fn rollback(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector.remove(host, &self.marker())
    }
}

/// Copy a binary out of an extracted archive and make it executable.
#[derive(Debug, Clone)]
pub struct FinalizeBinary {
    pub source: PathBuf,
    pub dest: PathBuf,
}

impl FinalizeBinary {
    fn in_place(&self) -> bool {
        self.source == self.dest
    }
}

impl Operation for FinalizeBinary {
    fn kind(&self) -> &'static str {
        "finalize"
    }

    fn describe(&self) -> String {
        if self.in_place() {
            format!("Mark {} executable", self.dest.display())
        } else {
            format!(
                "Install {} as {}",
                self.source.display(),
                self.dest.display()
            )
        }
    }

    fn fingerprint(&self) -> String {
        format!("{} -> {}", self.source.display(), self.dest.display())
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        if !ctx.connector.exists(host, &self.dest)? {
            return Ok(false);
        }
        if self.in_place() {
            // Mode cannot be inspected; chmod again.
            return Ok(false);
        }
        if !ctx.connector.exists(host, &self.source)? {
            return Ok(true);
        }
        Ok(ctx.connector.sha256(host, &self.source)? == ctx.connector.sha256(host, &self.dest)?)
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        if !self.in_place() {
            ctx.connector.copy(host, &self.source, &self.dest)?;
        }
        ctx.connector.chmod(host, &self.dest, EXECUTABLE_MODE)
    }

    fn rollback(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        if self.in_place() {
            return Ok(());
        }
        ctx.connector.remove(host, &self.dest)
    }
}

/// Make a downloaded file executable.
#[derive(Debug, Clone)]
pub struct MarkExecutable {
    pub path: PathBuf,
}

impl Operation for MarkExecutable {
    fn kind(&self) -> &'static str {
        "chmod"
    }

    fn describe(&self) -> String {
        format!("Mark {} executable", self.path.display())
    }

    fn fingerprint(&self) -> String {
        format!("{:o} {}", EXECUTABLE_MODE, self.path.display())
    }

    fn precheck(&self, _ctx: &ExecContext, _host: &Host) -> Result<bool> {
        Ok(false)
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector.chmod(host, &self.path, EXECUTABLE_MODE)
    }
}

/// Container runtime used to pull images on a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRuntime {
    #[default]
    Containerd,
    Docker,
}

impl ImageRuntime {
    fn inspect_command(self, reference: &str) -> String {
        match self {
            Self::Containerd => format!("ctr -n k8s.io images ls -q name=={reference}"),
            Self::Docker => format!("docker image inspect --format '{{{{.Id}}}}' {reference}"),
        }
    }

    fn pull_command(self, reference: &str) -> String {
        match self {
            Self::Containerd => format!("ctr -n k8s.io images pull {reference}"),
            Self::Docker => format!("docker pull {reference}"),
        }
    }
}

/// Pull a container image on a host unless it is already present.
#[derive(Debug, Clone)]
pub struct PullImage {
    pub reference: String,
    pub runtime: ImageRuntime,
}

impl Operation for PullImage {
    fn kind(&self) -> &'static str {
        "pull"
    }

    fn describe(&self) -> String {
        format!("Pull image {}", self.reference)
    }

    fn fingerprint(&self) -> String {
        format!("{:?} {}", self.runtime, self.reference)
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        let output = ctx
            .connector
            .run(host, &self.runtime.inspect_command(&self.reference))?;
        Ok(output.success && !output.stdout_str().trim().is_empty())
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector
            .run_checked(host, &self.runtime.pull_command(&self.reference))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execgraph::CommandOutput;
    use execgraph::testing::MockConnector;

    fn control() -> Host {
        Host::local("control")
    }

    fn download(checksum: Option<&str>) -> DownloadFile {
        DownloadFile {
            url: "https://example.com/tool.tar.gz".to_string(),
            dest: PathBuf::from("/work/tool.tar.gz"),
            checksum: checksum.map(|c| Checksum::parse(c).unwrap()),
        }
    }

    #[test]
    fn test_download_verifies_checksum() {
        let mock = MockConnector::new();
        mock.serve("https://example.com/tool.tar.gz", b"payload".to_vec());
        let ctx = ExecContext::new(&mock);

        let op = download(Some(&sha256_hex(b"payload")));
        assert!(!op.precheck(&ctx, &control()).unwrap());
        op.run(&ctx, &control()).unwrap();
        assert!(op.precheck(&ctx, &control()).unwrap());
    }

    #[test]
    fn test_download_mismatch_fails_and_removes_file() {
        let mock = MockConnector::new();
        mock.serve("https://example.com/tool.tar.gz", b"tampered".to_vec());
        let ctx = ExecContext::new(&mock);

        let op = download(Some(&sha256_hex(b"payload")));
        let err = op.run(&ctx, &control()).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(mock.file(&control(), "/work/tool.tar.gz").is_none());
    }

    #[test]
    fn test_existing_file_with_wrong_digest_is_not_satisfied() {
        let mock = MockConnector::new();
        mock.put_file(&control(), "/work/tool.tar.gz", "stale");
        let ctx = ExecContext::new(&mock);

        assert!(download(None).precheck(&ctx, &control()).unwrap());
        assert!(!download(Some(&sha256_hex(b"payload"))).precheck(&ctx, &control()).unwrap());
    }

    #[test]
    fn test_extract_marker_tracks_archive_digest() {
        let mock = MockConnector::new();
        let ctx = ExecContext::new(&mock);
        mock.put_file(&control(), "/work/tool.tar.gz", "v1");
        mock.add_archive("tool.tar.gz", [("bin/tool", b"tool".to_vec())]);

        let op = ExtractArchive {
            archive: PathBuf::from("/work/tool.tar.gz"),
            dest_dir: PathBuf::from("/work/extracted_tool"),
        };
        assert!(!op.precheck(&ctx, &control()).unwrap());
        op.run(&ctx, &control()).unwrap();
        assert!(op.precheck(&ctx, &control()).unwrap());
        assert!(mock.file(&control(), "/work/extracted_tool/bin/tool").is_some());

        // A different archive at the same path invalidates the extraction.
        mock.put_file(&control(), "/work/tool.tar.gz", "v2");
        assert!(!op.precheck(&ctx, &control()).unwrap());
    }

    #[test]
    fn test_extract_keeps_finalized_siblings() {
        let mock = MockConnector::new();
        let ctx = ExecContext::new(&mock);
        mock.put_file(&control(), "/work/tool.tar.gz", "v1");
        mock.add_archive(
            "tool.tar.gz",
            [("bin/tool", b"tool".to_vec()), ("bin/toolctl", b"toolctl".to_vec())],
        );
        mock.put_file_with_mode(&control(), "/work/extracted_tool/toolctl", "toolctl", EXECUTABLE_MODE);

        let op = ExtractArchive {
            archive: PathBuf::from("/work/tool.tar.gz"),
            dest_dir: PathBuf::from("/work/extracted_tool"),
        };
        op.run(&ctx, &control()).unwrap();
        assert!(mock.file(&control(), "/work/extracted_tool/toolctl").is_some());

        op.rollback(&ctx, &control()).unwrap();
        assert!(!op.precheck(&ctx, &control()).unwrap());
        assert_eq!(
            mock.mode(&control(), "/work/extracted_tool/toolctl"),
            Some(EXECUTABLE_MODE)
        );
    }

    #[test]
    fn test_finalize_copies_and_marks_executable() {
        let mock = MockConnector::new();
        let ctx = ExecContext::new(&mock);
        mock.put_file(&control(), "/work/x/bin/tool", "tool");

        let op = FinalizeBinary {
            source: PathBuf::from("/work/x/bin/tool"),
            dest: PathBuf::from("/work/x/tool"),
        };
        assert!(!op.precheck(&ctx, &control()).unwrap());
        op.run(&ctx, &control()).unwrap();
        assert_eq!(mock.mode(&control(), "/work/x/tool"), Some(EXECUTABLE_MODE));
        assert!(op.precheck(&ctx, &control()).unwrap());

        op.rollback(&ctx, &control()).unwrap();
        assert!(mock.file(&control(), "/work/x/tool").is_none());
        assert!(mock.file(&control(), "/work/x/bin/tool").is_some());
    }

    #[test]
    fn test_pull_image_if_absent() {
        let mock = MockConnector::new();
        let ctx = ExecContext::new(&mock);
        let node = Host::new("node1", "10.0.0.1");
        let op = PullImage {
            reference: "registry.k8s.io/pause:3.9".to_string(),
            runtime: ImageRuntime::Containerd,
        };

        assert!(!op.precheck(&ctx, &node).unwrap());
        op.run(&ctx, &node).unwrap();
        assert_eq!(
            mock.commands_on(&node).last().map(String::as_str),
            Some("ctr -n k8s.io images pull registry.k8s.io/pause:3.9")
        );

        mock.respond(
            "ctr -n k8s.io images ls -q name==registry.k8s.io/pause:3.9",
            CommandOutput::ok("registry.k8s.io/pause:3.9\n"),
        );
        assert!(op.precheck(&ctx, &node).unwrap());
    }

    #[test]
    fn test_docker_runtime_commands() {
        assert_eq!(
            ImageRuntime::Docker.pull_command("nginx:1.27"),
            "docker pull nginx:1.27"
        );
        assert_eq!(
            ImageRuntime::Docker.inspect_command("nginx:1.27"),
            "docker image inspect --format '{{.Id}}' nginx:1.27"
        );
    }
}

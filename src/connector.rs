//! Connector for real hosts
//!
//! Local hosts (the control node in most setups) are driven directly:
//! files through `std::fs`, downloads through `ureq`, archives through
//! `flate2`/`tar` and `zip`. Remote hosts are driven over `ssh`/`scp`
//! with `BatchMode` so a missing key fails instead of prompting.

use anyhow::{Context, Result, bail};
use execgraph::context::quote;
use execgraph::digest::sha256_reader;
use execgraph::{CommandOutput, Connector, Host};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};

/// Largest artifact a download may produce.
const MAX_DOWNLOAD_SIZE: u64 = 1024 * 1024 * 1024;

const USER_AGENT: &str = concat!("clusterforge/", env!("CARGO_PKG_VERSION"));

/// Archive formats the connector can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    fn detect(archive: &Path) -> Result<Self> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if name.ends_with(".tar") {
            Ok(Self::Tar)
        } else if name.ends_with(".zip") {
            Ok(Self::Zip)
        } else {
            bail!("Unsupported archive format: {}", archive.display())
        }
    }
}

/// Runs connector primitives on the local machine or over ssh.
pub struct ShellConnector {
    agent: ureq::Agent,
}

impl Default for ShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellConnector {
    pub fn new() -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
        }
    }

    fn ssh(host: &Host) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"]);
        if let Some(port) = host.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(host.destination());
        cmd
    }

    fn output(mut cmd: Command, what: &str) -> Result<CommandOutput> {
        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute: {what}"))?;
        Ok(output.into())
    }

    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let mut response = self
            .agent
            .get(url)
            .header("User-Agent", USER_AGENT)
            .call()
            .with_context(|| format!("Failed to download {url}"))?;

        let bytes = response
            .body_mut()
            .with_config()
            .limit(MAX_DOWNLOAD_SIZE)
            .read_to_vec()
            .context("Failed to read response body")?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write beside the destination so an interrupted download never
        // leaves a truncated file at the final path.
        let partial = dest.with_extension("part");
        fs::write(&partial, &bytes)
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        fs::rename(&partial, dest)?;
        log::debug!("Downloaded {} ({} bytes)", url, bytes.len());
        Ok(())
    }

    fn unpack(archive: &Path, dest_dir: &Path) -> Result<()> {
        let format = ArchiveFormat::detect(archive)?;
        fs::create_dir_all(dest_dir)?;
        let file = File::open(archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;

        match format {
            ArchiveFormat::TarGz => {
                let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
                tar::Archive::new(decoder).unpack(dest_dir)?;
            }
            ArchiveFormat::Tar => {
                tar::Archive::new(BufReader::new(file)).unpack(dest_dir)?;
            }
            ArchiveFormat::Zip => {
                let mut zip = zip::ZipArchive::new(BufReader::new(file))?;
                zip.extract(dest_dir)?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn set_mode(path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set mode on {}", path.display()))
    }

    #[cfg(not(unix))]
    fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
        Ok(())
    }
}

impl Connector for ShellConnector {
    fn exists(&self, host: &Host, path: &Path) -> Result<bool> {
        if host.is_local() {
            return Ok(path.exists());
        }
        Ok(self.run(host, &format!("test -e {}", quote(path)))?.success)
    }

    fn sha256(&self, host: &Host, path: &Path) -> Result<String> {
        if host.is_local() {
            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            return Ok(sha256_reader(BufReader::new(file))?);
        }
        let stdout = self.run_checked(host, &format!("sha256sum {}", quote(path)))?;
        stdout
            .split_whitespace()
            .next()
            .map(ToString::to_string)
            .with_context(|| format!("No digest for {} on {}", path.display(), host))
    }

    fn download(&self, host: &Host, url: &str, dest: &Path) -> Result<()> {
        if host.is_local() {
            return self.fetch(url, dest);
        }
        self.run_checked(
            host,
            &format!("curl -fsSL --create-dirs -o {} '{}'", quote(dest), url),
        )
        .map(|_| ())
    }

    fn extract(&self, host: &Host, archive: &Path, dest_dir: &Path) -> Result<()> {
        if host.is_local() {
            return Self::unpack(archive, dest_dir)
                .with_context(|| format!("Failed to extract {}", archive.display()));
        }
        let unpack = match ArchiveFormat::detect(archive)? {
            ArchiveFormat::TarGz => format!("tar -xzf {} -C {}", quote(archive), quote(dest_dir)),
            ArchiveFormat::Tar => format!("tar -xf {} -C {}", quote(archive), quote(dest_dir)),
            ArchiveFormat::Zip => format!("unzip -oq {} -d {}", quote(archive), quote(dest_dir)),
        };
        self.run_checked(host, &format!("mkdir -p {} && {}", quote(dest_dir), unpack))
            .map(|_| ())
    }

    fn run(&self, host: &Host, cmd: &str) -> Result<CommandOutput> {
        log::trace!("[{}] {}", host, cmd);
        if host.is_local() {
            let mut local = Command::new("sh");
            local.arg("-c").arg(cmd);
            return Self::output(local, cmd);
        }
        let mut remote = Self::ssh(host);
        remote.arg(cmd);
        Self::output(remote, cmd)
    }

    fn upload(&self, host: &Host, local: &Path, remote: &Path) -> Result<()> {
        if host.is_local() {
            if let Some(parent) = remote.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(local, remote).with_context(|| {
                format!("Failed to copy {} to {}", local.display(), remote.display())
            })?;
            return Ok(());
        }

        let mut scp = Command::new("scp");
        scp.args(["-q", "-o", "BatchMode=yes"]);
        if let Some(port) = host.port {
            scp.arg("-P").arg(port.to_string());
        }
        scp.arg(local)
            .arg(format!("{}:{}", host.destination(), remote.display()));
        let output = Self::output(scp, "scp")?;
        if !output.success {
            bail!(
                "Upload of {} to {} failed: {}",
                local.display(),
                host,
                output.stderr_str().trim()
            );
        }
        Ok(())
    }

    fn write_file(&self, host: &Host, content: &[u8], dest: &Path, mode: u32) -> Result<()> {
        if host.is_local() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(dest, content)
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            return Self::set_mode(dest, mode);
        }

        let mut cmd = Self::ssh(host);
        cmd.arg(format!(
            "cat > {path} && chmod {mode:o} {path}",
            path = quote(dest)
        ))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to connect to {host}"))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "Failed to write {} on {}: {}",
                dest.display(),
                host,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

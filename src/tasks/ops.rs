//! Operations run on target hosts, and PKI generation on the control node.

use anyhow::{Context, Result};
use execgraph::context::{quote, quote_str};
use execgraph::digest::sha256_hex;
use execgraph::{ExecContext, Host, Operation, ServiceAction};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Where uploaded artifacts land before installation.
pub const STAGING_DIR: &str = "/var/lib/clusterforge/staging";

/// Where applied service revisions are recorded.
pub const STATE_DIR: &str = "/var/lib/clusterforge/state";

/// Remote staging path for a file of `component`.
pub fn staging_path(component: &str, file_name: &str) -> PathBuf {
    Path::new(STAGING_DIR).join(component).join(file_name)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("/"))
}

// ============================================================================
// Upload
// ============================================================================

/// One file copied from the control node to a target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub local: PathBuf,
    pub remote: PathBuf,
}

/// Copy control-node artifacts into the host's staging area.
#[derive(Debug, Clone)]
pub struct UploadFiles {
    pub control: Host,
    pub files: Vec<Transfer>,
}

impl Operation for UploadFiles {
    fn kind(&self) -> &'static str {
        "upload"
    }

    fn describe(&self) -> String {
        format!("Upload {} file(s)", self.files.len())
    }

    fn fingerprint(&self) -> String {
        self.files
            .iter()
            .map(|t| format!("{} -> {}", t.local.display(), t.remote.display()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        for transfer in &self.files {
            if !ctx.connector.exists(host, &transfer.remote)? {
                return Ok(false);
            }
            let remote = ctx.connector.sha256(host, &transfer.remote)?;
            let local = ctx.connector.sha256(&self.control, &transfer.local)?;
            if remote != local {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        for transfer in &self.files {
            ctx.connector
                .mkdir_all(host, parent_dir(&transfer.remote))?;
            ctx.connector
                .upload(host, &transfer.local, &transfer.remote)
                .with_context(|| format!("Failed to upload {}", transfer.local.display()))?;
        }
        Ok(())
    }

    fn rollback(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        for transfer in &self.files {
            ctx.connector.remove(host, &transfer.remote)?;
        }
        Ok(())
    }
}

// ============================================================================
// Install
// ============================================================================

/// One staged file placed at its final location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Install {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub mode: u32,
}

/// Move staged files into place with their final modes.
#[derive(Debug, Clone)]
pub struct InstallFiles {
    pub files: Vec<Install>,
}

impl Operation for InstallFiles {
    fn kind(&self) -> &'static str {
        "install"
    }

    fn describe(&self) -> String {
        let targets: Vec<_> = self
            .files
            .iter()
            .map(|f| f.dest.display().to_string())
            .collect();
        format!("Install {}", targets.join(", "))
    }

    fn fingerprint(&self) -> String {
        self.files
            .iter()
            .map(|f| format!("{} -> {} ({:o})", f.source.display(), f.dest.display(), f.mode))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        for file in &self.files {
            if !ctx.connector.exists(host, &file.dest)? {
                return Ok(false);
            }
            if ctx.connector.exists(host, &file.source)?
                && ctx.connector.sha256(host, &file.source)? != ctx.connector.sha256(host, &file.dest)?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        for file in &self.files {
            ctx.connector.mkdir_all(host, parent_dir(&file.dest))?;
            ctx.connector.copy(host, &file.source, &file.dest)?;
            ctx.connector.chmod(host, &file.dest, file.mode)?;
        }
        Ok(())
    }

    fn rollback(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        for file in &self.files {
            ctx.connector.remove(host, &file.dest)?;
        }
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// A configuration file rendered while planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub dest: PathBuf,
    pub content: String,
    pub mode: u32,
}

impl RenderedFile {
    pub fn new(dest: impl Into<PathBuf>, content: String) -> Self {
        Self {
            dest: dest.into(),
            content,
            mode: 0o644,
        }
    }

    pub fn digest(&self) -> String {
        sha256_hex(self.content.as_bytes())
    }
}

/// Write rendered configuration files on a host.
#[derive(Debug, Clone)]
pub struct RenderFiles {
    pub files: Vec<RenderedFile>,
}

impl Operation for RenderFiles {
    fn kind(&self) -> &'static str {
        "configure"
    }

    fn describe(&self) -> String {
        let targets: Vec<_> = self
            .files
            .iter()
            .map(|f| f.dest.display().to_string())
            .collect();
        format!("Write {}", targets.join(", "))
    }

    fn fingerprint(&self) -> String {
        self.files
            .iter()
            .map(|f| format!("{}@{}", f.dest.display(), f.digest()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        for file in &self.files {
            if !ctx.connector.exists(host, &file.dest)?
                || ctx.connector.sha256(host, &file.dest)? != file.digest()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        for file in &self.files {
            ctx.connector.mkdir_all(host, parent_dir(&file.dest))?;
            ctx.connector
                .write_file(host, file.content.as_bytes(), &file.dest, file.mode)
                .with_context(|| format!("Failed to write {}", file.dest.display()))?;
        }
        Ok(())
    }

    fn rollback(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        for file in &self.files {
            ctx.connector.remove(host, &file.dest)?;
        }
        Ok(())
    }
}

// ============================================================================
// Service
// ============================================================================

/// Enable and (re)start a systemd unit once per revision.
///
/// The revision summarizes everything the unit runs with. It is recorded
/// on the host after a successful restart, so a changed binary or
/// configuration restarts the unit and an unchanged one leaves it alone.
#[derive(Debug, Clone)]
pub struct EnableService {
    pub unit: String,
    pub revision: String,
}

impl EnableService {
    fn marker(&self) -> PathBuf {
        Path::new(STATE_DIR).join(format!("{}.revision", self.unit))
    }
}

impl Operation for EnableService {
    fn kind(&self) -> &'static str {
        "service"
    }

    fn describe(&self) -> String {
        format!("Enable and start {}", self.unit)
    }

    fn fingerprint(&self) -> String {
        format!("{}@{}", self.unit, self.revision)
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        let marker = self.marker();
        if !ctx.connector.exists(host, &marker)?
            || ctx.connector.sha256(host, &marker)? != sha256_hex(self.revision.as_bytes())
        {
            return Ok(false);
        }
        ctx.connector.service_active(host, &self.unit)
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector
            .service(host, &self.unit, ServiceAction::DaemonReload)?;
        ctx.connector.service(host, &self.unit, ServiceAction::Enable)?;
        ctx.connector
            .service(host, &self.unit, ServiceAction::Restart)
            .with_context(|| format!("Failed to start {} on {}", self.unit, host))?;
        ctx.connector.mkdir_all(host, Path::new(STATE_DIR))?;
        ctx.connector
            .write_file(host, self.revision.as_bytes(), &self.marker(), 0o644)
    }

    fn rollback(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector.service(host, &self.unit, ServiceAction::Stop)?;
        ctx.connector.remove(host, &self.marker())
    }
}

// ============================================================================
// PKI
// ============================================================================

const CERT_DAYS: u32 = 3650;

/// `-subj` argument naming `common_name`, quoted for the shell.
fn subject(common_name: &str) -> String {
    quote_str(&format!("/CN={common_name}"))
}

/// Create a self-signed certificate authority on the control node.
#[derive(Debug, Clone)]
pub struct GenerateCa {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub common_name: String,
}

impl Operation for GenerateCa {
    fn kind(&self) -> &'static str {
        "ca"
    }

    fn describe(&self) -> String {
        format!("Generate CA {}", self.common_name)
    }

    fn fingerprint(&self) -> String {
        format!("{} {}", self.common_name, self.cert.display())
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        Ok(ctx.connector.exists(host, &self.cert)? && ctx.connector.exists(host, &self.key)?)
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector.mkdir_all(host, parent_dir(&self.cert))?;
        let cmd = format!(
            "umask 077 && openssl req -x509 -newkey rsa:2048 -nodes -keyout {} -out {} -days {} -subj {}",
            quote(&self.key),
            quote(&self.cert),
            CERT_DAYS,
            subject(&self.common_name)
        );
        ctx.connector
            .run_checked(host, &cmd)
            .with_context(|| format!("Failed to generate CA {}", self.common_name))
            .map(|_| ())
    }

    fn rollback(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector.remove(host, &self.cert)?;
        ctx.connector.remove(host, &self.key)
    }
}

/// Issue a certificate signed by a CA on the control node.
#[derive(Debug, Clone)]
pub struct GenerateCert {
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub common_name: String,
    /// DNS names and IP addresses the certificate is valid for
    pub sans: Vec<String>,
    /// Reissue even when a certificate exists (the CA is being replaced)
    pub force: bool,
}

impl GenerateCert {
    fn extensions(&self) -> String {
        let names: Vec<String> = self
            .sans
            .iter()
            .map(|san| match san.parse::<IpAddr>() {
                Ok(_) => format!("IP:{san}"),
                Err(_) => format!("DNS:{san}"),
            })
            .collect();
        format!(
            "subjectAltName = {}\nextendedKeyUsage = serverAuth, clientAuth\n",
            names.join(", ")
        )
    }

    fn scratch(&self, extension: &str) -> PathBuf {
        self.cert.with_extension(extension)
    }
}

impl Operation for GenerateCert {
    fn kind(&self) -> &'static str {
        "cert"
    }

    fn describe(&self) -> String {
        format!("Issue certificate {}", self.common_name)
    }

    fn fingerprint(&self) -> String {
        format!(
            "{} {} [{}] force={}",
            self.common_name,
            self.cert.display(),
            self.sans.join(","),
            self.force
        )
    }

    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool> {
        if self.force {
            return Ok(false);
        }
        Ok(ctx.connector.exists(host, &self.cert)? && ctx.connector.exists(host, &self.key)?)
    }

    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        let csr = self.scratch("csr");
        let ext = self.scratch("ext");
        ctx.connector.mkdir_all(host, parent_dir(&self.cert))?;
        ctx.connector
            .write_file(host, self.extensions().as_bytes(), &ext, 0o644)?;

        let request = format!(
            "umask 077 && openssl req -new -newkey rsa:2048 -nodes -keyout {} -out {} -subj {}",
            quote(&self.key),
            quote(&csr),
            subject(&self.common_name)
        );
        let sign = format!(
            "openssl x509 -req -in {} -CA {} -CAkey {} -CAcreateserial -out {} -days {} -extfile {}",
            quote(&csr),
            quote(&self.ca_cert),
            quote(&self.ca_key),
            quote(&self.cert),
            CERT_DAYS,
            quote(&ext)
        );
        ctx.connector
            .run_checked(host, &request)
            .and_then(|_| ctx.connector.run_checked(host, &sign))
            .with_context(|| format!("Failed to issue certificate {}", self.common_name))?;
        ctx.connector.remove(host, &csr)?;
        ctx.connector.remove(host, &ext)
    }

    fn rollback(&self, ctx: &ExecContext, host: &Host) -> Result<()> {
        ctx.connector.remove(host, &self.cert)?;
        ctx.connector.remove(host, &self.key)
    }
}

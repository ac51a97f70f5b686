//! # artifacts
//!
//! Acquisition planning for cluster component artifacts.
//!
//! This crate turns "make etcd 3.5.9 available for amd64" into an
//! [`execgraph::Fragment`] that downloads, extracts and finalizes the
//! binary on the control node, or into the empty fragment when the
//! artifact is already there.
//!
//! - Deterministic cache paths derived from [`ResourceIdentity`]
//! - An injectable [`ComponentRegistry`] of download templates
//! - Optional sha256 verification of downloads
//! - Platform normalization (`x86_64` to `amd64`, `aarch64` to `arm64`)
//!
//! ## Example
//!
//! ```ignore
//! use artifacts::{ArtifactRequest, Handle, PlanningSession, ResourceHandle};
//! use execgraph::Host;
//!
//! let session = PlanningSession::new("/var/lib/clusterforge", "demo", Host::local("control"), connector);
//! let etcd = Handle::remote(
//!     &session,
//!     &ArtifactRequest::new("etcd", "3.5.9").arch("amd64").binary("etcd"),
//! )?;
//!
//! // /var/lib/clusterforge/demo/etcd/3.5.9/amd64/extracted_etcd-3.5.9-linux-amd64/etcd
//! println!("{}", etcd.path().unwrap().display());
//!
//! let fragment = etcd.ensure_plan(&session)?;
//! ```
//!
//! ## Cache Layout
//!
//! ```text
//! <work_dir>/<cluster>/
//! ├── <component>/<version>/<arch>/
//! │   ├── <downloaded file>
//! │   └── extracted_<archive basename>/
//! │       ├── .extracted          (archive sha256)
//! │       └── <binary key>
//! └── certs/<component>/<name>.pem
//! ```

pub mod checksum;
pub mod error;
pub mod handle;
pub mod identity;
pub mod ops;
pub mod platform;
pub mod registry;
pub mod session;

pub use checksum::{Checksum, ChecksumAlgorithm};
pub use error::{Error, ErrorCategory, Result};
pub use handle::{
    ArtifactRequest, Handle, LocalCertificate, Placement, RemoteArchive, RemoteBinary,
    RemoteImage, ResourceHandle,
};
pub use identity::ResourceIdentity;
pub use ops::ImageRuntime;
pub use platform::Platform;
pub use registry::{ComponentRegistry, ComponentSpec, SourceKind};
pub use session::PlanningSession;

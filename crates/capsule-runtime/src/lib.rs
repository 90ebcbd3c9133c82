//! Filesystem layer of the capsule launcher.
//!
//! This crate stages container root filesystems on the host: overlay
//! layers (`OverlayItem`) and their composition on top of a root directory
//! (`OverlaySet`), FUSE mounts of squashfs and extfs images, root image
//! preparation (`ImagePreparer`: kernel mount pass-through, FUSE mount or
//! extraction to a temporary sandbox) and the host cleanup hooks run once the
//! container has started or exited. Kernel and tool capability probes live
//! here too, behind traits so callers can substitute them.

pub mod fuse;
pub mod host;
pub mod image;
pub mod overlay;
pub mod prepare;
pub mod prereq;
pub mod probe;
pub mod sys;

pub use host::HostCleanup;
pub use image::{HeaderProbe, ImageInspector, PartitionKind, RootfsPartition};
pub use overlay::{MountStrategy, OverlayItem, OverlayKind, OverlaySet};
pub use prepare::{HostStager, ImagePreparer, PrepareContext, PreparedImage, PreparedKind, Stager};
pub use prereq::{check_launch_prereqs, find_bin, format_missing, MissingPrereq};
pub use probe::{FixedSupport, KernelProbe, OverlaySupport};

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} does not exist")]
    NotFound(PathBuf),
    #[error("{path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },
    #[error("missing overlay dir {0}")]
    MissingDir(PathBuf),
    #[error("{tool} is required {purpose} but was not found on PATH")]
    MissingTool { tool: String, purpose: String },
    #[error("failed to mount {target}: {reason}")]
    MountFailed { target: PathBuf, reason: String },
    #[error("failed to unmount {target}: {reason}")]
    UnmountFailed { target: PathBuf, reason: String },
    #[error(
        "could not prepare {0}; if using an overlay image ensure it contains 'upper' and 'work' directories"
    )]
    OverlayDirMissing(PathBuf),
    #[error(
        "only one writable overlay is allowed; {first} is already writable, use '--overlay {second}:ro' instead"
    )]
    TooManyWritable { first: PathBuf, second: PathBuf },
    #[error("duplicate overlays detected: {}", join_paths(.0))]
    DuplicateOverlay(Vec<PathBuf>),
    #[error("root filesystem extraction failed: {0}")]
    ExtractionFailed(String),
    #[error(
        "image {0} must be extracted to a temporary sandbox, which is disabled by 'tmp-sandbox = false'"
    )]
    TmpSandboxProhibited(PathBuf),
    #[error("encrypted image {0} can only be used with a kernel mount from the setuid starter")]
    EncryptionRequiresKernelMount(PathBuf),
    #[error("ext3 image {path} can neither be kernel mounted nor mounted with FUSE: {reason}")]
    UnsupportedExtfsMount { path: PathBuf, reason: String },
    #[error("unsupported root filesystem type '{kind}' in {path}")]
    UnsupportedRootfs { path: PathBuf, kind: String },
    #[error("{0}")]
    Teardown(TeardownErrors),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Every error collected while tearing a mount stack down.
#[derive(Debug)]
pub struct TeardownErrors(Vec<RuntimeError>);

impl TeardownErrors {
    pub fn first(&self) -> &RuntimeError {
        &self.0[0]
    }

    pub fn all(&self) -> &[RuntimeError] {
        &self.0
    }
}

impl fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.first())?;
        if self.0.len() > 1 {
            write!(f, " (and {} more teardown errors)", self.0.len() - 1)?;
        }
        Ok(())
    }
}

impl RuntimeError {
    /// Collapse collected teardown errors: `Ok` when empty, the error itself
    /// when there is exactly one, a `Teardown` composite otherwise.
    pub fn from_teardown(mut errors: Vec<RuntimeError>) -> Result<(), RuntimeError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RuntimeError::Teardown(TeardownErrors(errors))),
        }
    }
}

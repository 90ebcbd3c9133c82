//! Overlay layers and their composition over a container root.

mod item;
mod set;

pub use item::{OverlayItem, OverlayKind};
pub use set::{MountStrategy, OverlaySet};

use crate::{sys, RuntimeError};
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use tracing::debug;

/// Make sure `dir` exists, creating it with `mode` when `create` is set.
pub fn ensure_overlay_dir(dir: &Path, create: bool, mode: u32) -> Result<(), RuntimeError> {
    match dir.metadata() {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if !create {
                return Err(RuntimeError::MissingDir(dir.to_path_buf()));
            }
            DirBuilder::new().mode(mode).create(dir)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Lazily detach whatever is mounted on `dir`.
pub fn detach_mount(dir: &Path) -> Result<(), RuntimeError> {
    debug!("detaching {}", dir.display());
    sys::umount_detach(dir).map_err(|e| RuntimeError::UnmountFailed {
        target: dir.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn ensure_existing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        ensure_overlay_dir(dir.path(), false, 0o755).unwrap();
    }

    #[test]
    fn ensure_missing_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("upper");
        let err = ensure_overlay_dir(&missing, false, 0o755).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingDir(p) if p == missing));
    }

    #[test]
    fn ensure_creates_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        ensure_overlay_dir(&work, true, 0o700).unwrap();
        let mode = work.metadata().unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}

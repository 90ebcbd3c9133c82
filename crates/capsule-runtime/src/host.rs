//! Host side cleanup of a prepared root image.
//!
//! A FUSE mounted image can be detached lazily as soon as the container
//! holds it open (`post_start_host`); whatever remains is removed after the
//! container exits (`cleanup_host`). Both hooks may run more than once and
//! do nothing when there is nothing left to clean.

use crate::fuse::unmount_with_fuse_lazy;
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCleanup {
    /// Mount point of a FUSE mounted root image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_fuse: Option<PathBuf>,
    /// Temporary directory holding the mount point or extracted sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

fn unescape_mountinfo(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let esc = rest.get(pos + 1..pos + 4);
        match esc.and_then(|e| u8::from_str_radix(e, 8).ok()) {
            Some(b) => {
                out.push(char::from(b));
                rest = &rest[pos + 4..];
            }
            None => {
                out.push('\\');
                rest = &rest[pos + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Whether `path` is a mount point according to `mountinfo` content.
pub fn listed_in_mountinfo(mountinfo: &str, path: &Path) -> bool {
    mountinfo
        .lines()
        .filter_map(|l| l.split_whitespace().nth(4))
        .any(|mp| Path::new(&unescape_mountinfo(mp)) == path)
}

/// Mountinfo lists resolved paths, so `path` is canonicalized first.
fn is_mountpoint(path: &Path) -> bool {
    let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    fs::read_to_string("/proc/self/mountinfo")
        .map(|info| listed_in_mountinfo(&info, &path))
        .unwrap_or(false)
}

impl HostCleanup {
    pub fn is_empty(&self) -> bool {
        self.image_fuse.is_none() && self.temp_dir.is_none()
    }

    /// Run once the container process is up.
    pub fn post_start_host(&self) -> Result<(), RuntimeError> {
        if self.image_fuse.is_some() && self.temp_dir.is_some() {
            return self.clean_fuse_temp_dir();
        }
        Ok(())
    }

    /// Run after the container exits, or when it never started.
    pub fn cleanup_host(&self) -> Result<(), RuntimeError> {
        if self.image_fuse.is_some() {
            return self.clean_fuse_temp_dir();
        }
        if let Some(tmp) = &self.temp_dir {
            if tmp.is_dir() {
                info!("removing image temporary directory {}", tmp.display());
                fs::remove_dir_all(tmp)?;
            }
        }
        Ok(())
    }

    fn clean_fuse_temp_dir(&self) -> Result<(), RuntimeError> {
        if let Some(mp) = &self.image_fuse {
            if is_mountpoint(mp) {
                debug!("lazily unmounting FUSE image at {}", mp.display());
                unmount_with_fuse_lazy(mp)?;
            }
            // fails on a mount still in place, so the image is never walked
            if mp.is_dir() {
                fs::remove_dir(mp)?;
            }
        }
        if let Some(tmp) = &self.temp_dir {
            if tmp.is_dir() {
                debug!("removing image temporary directory {}", tmp.display());
                fs::remove_dir_all(tmp)?;
            }
        }
        Ok(())
    }
}

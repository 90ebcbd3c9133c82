use super::{detach_mount, ensure_overlay_dir};
use crate::fuse::{unmount_with_fuse, FuseFs, ImageMount};
use crate::image::{HeaderProbe, ImageInspector, PartitionKind};
use crate::{sys, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayKind {
    Directory,
    Squashfs,
    Ext3,
}

/// One overlay layer: a directory, or a squashfs/ext3 image staged through FUSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayItem {
    kind: OverlayKind,
    writable: bool,
    source: PathBuf,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    pub allow_setuid: bool,
    #[serde(default)]
    pub allow_dev: bool,
    #[serde(skip)]
    staging_dir: Option<PathBuf>,
    #[serde(skip)]
    parent_dir: Option<PathBuf>,
    #[serde(skip)]
    owns_parent: bool,
}

impl OverlayItem {
    /// Parse `path[:ro]`, classifying the source with the header probe.
    pub fn from_spec(spec: &str) -> Result<Self, RuntimeError> {
        Self::from_spec_with(spec, &HeaderProbe)
    }

    pub fn from_spec_with(spec: &str, inspector: &dyn ImageInspector) -> Result<Self, RuntimeError> {
        let (path, suffix) = match spec.split_once(':') {
            Some((p, s)) => (p, Some(s)),
            None => (spec, None),
        };
        let mut writable = true;
        match suffix {
            Some("ro") => writable = false,
            Some(other) => warn!("ignoring unknown overlay option '{other}' in {spec}"),
            None => {}
        }

        let source = std::path::absolute(path)?;
        let meta = match source.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RuntimeError::NotFound(source));
            }
            Err(e) => return Err(e.into()),
        };

        let (kind, offset) = if meta.is_dir() {
            (OverlayKind::Directory, 0)
        } else {
            let part = inspector.rootfs_partition(&source)?;
            match part.kind {
                PartitionKind::Squashfs => {
                    writable = false;
                    (OverlayKind::Squashfs, part.offset)
                }
                PartitionKind::Ext3 => (OverlayKind::Ext3, part.offset),
                other => {
                    return Err(RuntimeError::UnsupportedFormat {
                        path: source,
                        reason: format!(
                            "{} images are not supported as overlay",
                            other.name()
                        ),
                    });
                }
            }
        };

        Ok(Self {
            kind,
            writable,
            source,
            offset,
            allow_setuid: false,
            allow_dev: false,
            staging_dir: None,
            parent_dir: None,
            owns_parent: false,
        })
    }

    pub fn kind(&self) -> OverlayKind {
        self.kind
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Where the item is staged; `None` until `mount` succeeds.
    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging_dir.as_deref()
    }

    /// Directory under which FUSE mount points are created.
    pub fn set_parent_dir(&mut self, dir: impl Into<PathBuf>) {
        self.parent_dir = Some(dir.into());
        self.owns_parent = false;
    }

    fn parent_dir(&mut self) -> Result<PathBuf, RuntimeError> {
        if let Some(d) = &self.parent_dir {
            return Ok(d.clone());
        }
        let dir = tempfile::Builder::new()
            .prefix("overlay-parent-")
            .tempdir()?
            .keep();
        self.parent_dir = Some(dir.clone());
        self.owns_parent = true;
        Ok(dir)
    }

    fn base(&self) -> &Path {
        self.staging_dir.as_deref().unwrap_or(&self.source)
    }

    pub fn upper(&self) -> PathBuf {
        self.base().join("upper")
    }

    pub fn work(&self) -> PathBuf {
        self.base().join("work")
    }

    /// The directory this layer contributes to `lowerdir`/`upperdir`.
    pub fn mount_dir(&self) -> PathBuf {
        match self.kind {
            OverlayKind::Squashfs => self.base().to_path_buf(),
            OverlayKind::Directory | OverlayKind::Ext3 => {
                let upper = self.upper();
                if self.writable || upper.is_dir() {
                    upper
                } else {
                    self.base().to_path_buf()
                }
            }
        }
    }

    pub fn mount(&mut self) -> Result<(), RuntimeError> {
        match self.kind {
            OverlayKind::Directory => self.mount_dir_bind()?,
            OverlayKind::Squashfs => self.mount_fuse(FuseFs::Squashfs)?,
            OverlayKind::Ext3 => self.mount_fuse(FuseFs::Ext3)?,
        }
        if self.writable {
            if let Err(e) = self.prepare_writable() {
                debug!("releasing staged overlay {} after failure", self.source.display());
                if let Err(ue) = self.unmount() {
                    warn!("could not release staged overlay {}: {ue}", self.source.display());
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn mount_dir_bind(&mut self) -> Result<(), RuntimeError> {
        let dir = self.source.clone();
        ensure_overlay_dir(&dir, false, 0)?;

        debug!("performing identity bind mount of {}", dir.display());
        let dir_str = dir.to_string_lossy();
        sys::mount(&dir_str, &dir, "", sys::MS_BIND, "").map_err(|e| {
            RuntimeError::MountFailed {
                target: dir.clone(),
                reason: format!("bind: {e}"),
            }
        })?;

        let mut flags = sys::MS_REMOUNT | sys::MS_BIND;
        if !self.writable {
            flags |= sys::MS_RDONLY;
        }
        if !self.allow_dev {
            flags |= sys::MS_NODEV;
        }
        if !self.allow_setuid {
            flags |= sys::MS_NOSUID;
        }
        debug!("remounting {} with flags {flags:#x}", dir.display());
        if let Err(e) = sys::mount("", &dir, "", flags, "") {
            debug!("remount failed, detaching {}", dir.display());
            let _ = sys::umount_detach(&dir);
            return Err(RuntimeError::MountFailed {
                target: dir,
                reason: format!("remount: {e}"),
            });
        }

        self.staging_dir = Some(dir);
        Ok(())
    }

    fn mount_fuse(&mut self, fs: FuseFs) -> Result<(), RuntimeError> {
        let parent = self.parent_dir()?;
        let mut im = ImageMount::new(fs, &self.source, parent);
        im.readonly = !self.writable;
        im.allow_setuid = self.allow_setuid;
        im.allow_dev = self.allow_dev;
        if self.offset != 0 {
            im.extra_opts.push(format!("offset={}", self.offset));
        }
        let mountpoint = im.mount()?.to_path_buf();
        self.staging_dir = Some(mountpoint);
        Ok(())
    }

    fn prepare_writable(&mut self) -> Result<(), RuntimeError> {
        if self.kind == OverlayKind::Squashfs {
            return Err(RuntimeError::UnsupportedFormat {
                path: self.source.clone(),
                reason: "squashfs overlays are read-only".to_owned(),
            });
        }
        let upper = self.upper();
        let work = self.work();
        debug!("ensuring {} exists", upper.display());
        if let Err(e) = ensure_overlay_dir(&upper, true, 0o755) {
            error!("could not create overlay upper dir: {e}");
            return Err(RuntimeError::OverlayDirMissing(upper));
        }
        debug!("ensuring {} exists", work.display());
        if let Err(e) = ensure_overlay_dir(&work, true, 0o700) {
            error!("could not create overlay work dir: {e}");
            return Err(RuntimeError::OverlayDirMissing(work));
        }
        Ok(())
    }

    /// Release the staging mount. A no-op when the item was never staged.
    pub fn unmount(&mut self) -> Result<(), RuntimeError> {
        let Some(staging) = self.staging_dir.take() else {
            return Ok(());
        };
        let result = match self.kind {
            OverlayKind::Directory => detach_mount(&staging),
            OverlayKind::Squashfs | OverlayKind::Ext3 => {
                let r = unmount_with_fuse(&staging);
                let _ = fs::remove_dir(&staging);
                r
            }
        };
        if self.owns_parent {
            if let Some(parent) = self.parent_dir.take() {
                let _ = fs::remove_dir(parent);
            }
            self.owns_parent = false;
        }
        result
    }
}

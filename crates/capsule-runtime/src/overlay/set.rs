use super::{detach_mount, OverlayItem, OverlayKind};
use crate::fuse::unmount_with_fuse;
use crate::prereq::{require_bin, require_fusermount};
use crate::probe::OverlaySupport;
use crate::{sys, RuntimeError};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error};

/// How the composed overlay was mounted, so it can be undone the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStrategy {
    Kernel,
    FuseOverlayfs,
}

/// Read-only layers in precedence order plus at most one writable layer.
#[derive(Debug, Default)]
pub struct OverlaySet {
    pub readonly: Vec<OverlayItem>,
    pub writable: Option<OverlayItem>,
    strategy: Option<MountStrategy>,
}

impl OverlaySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from `--overlay` specs. Writable specs become the upper
    /// layer; a second writable spec is rejected.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self, RuntimeError> {
        let mut set = Self::new();
        for spec in specs {
            set.add(OverlayItem::from_spec(spec.as_ref())?)?;
        }
        Ok(set)
    }

    pub fn add(&mut self, item: OverlayItem) -> Result<(), RuntimeError> {
        if !item.writable() {
            self.readonly.push(item);
            return Ok(());
        }
        if let Some(existing) = &self.writable {
            return Err(RuntimeError::TooManyWritable {
                first: existing.source().to_path_buf(),
                second: item.source().to_path_buf(),
            });
        }
        self.writable = Some(item);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.readonly.is_empty() && self.writable.is_none()
    }

    /// The strategy used by the last successful `mount`, if still mounted.
    pub fn mount_strategy(&self) -> Option<MountStrategy> {
        self.strategy
    }

    fn items(&self) -> impl Iterator<Item = &OverlayItem> {
        self.readonly.iter().chain(self.writable.iter())
    }

    /// Sources that appear more than once, compared after canonicalization.
    pub fn duplicates(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut dups = Vec::new();
        for item in self.items() {
            let key = fs::canonicalize(item.source()).unwrap_or_else(|_| item.source().to_path_buf());
            if !seen.insert(key.clone()) && !dups.contains(&key) {
                dups.push(key);
            }
        }
        dups
    }

    /// The overlay mount options, with `root` as the lowest layer.
    pub fn options(&self, root: &Path) -> String {
        let lower: Vec<String> = self
            .readonly
            .iter()
            .map(|o| o.mount_dir().display().to_string())
            .chain(std::iter::once(root.display().to_string()))
            .collect();
        let mut opts = format!("lowerdir={}", lower.join(":"));
        if let Some(w) = &self.writable {
            opts.push_str(&format!(
                ",upperdir={},workdir={}",
                w.upper().display(),
                w.work().display()
            ));
        }
        opts
    }

    fn has_writable_ext3(&self) -> bool {
        self.writable
            .as_ref()
            .is_some_and(|w| w.kind() == OverlayKind::Ext3)
    }

    /// Kernel overlay when allowed, unless the upper layer is an ext3 image.
    pub fn choose_strategy(&self, support: &dyn OverlaySupport) -> MountStrategy {
        if support.kernel_overlay_usable() && !self.has_writable_ext3() {
            MountStrategy::Kernel
        } else {
            MountStrategy::FuseOverlayfs
        }
    }

    /// Stage every item, then mount the composed overlay on `root`.
    ///
    /// Duplicate sources fail the call before anything is staged. A staging
    /// failure is returned as is; already staged items stay mounted until
    /// `unmount` is called.
    pub fn mount(&mut self, root: &Path, support: &dyn OverlaySupport) -> Result<(), RuntimeError> {
        match root.metadata() {
            Ok(m) if m.is_dir() => {}
            Ok(_) => return Err(RuntimeError::MissingDir(root.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RuntimeError::NotFound(root.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        let dups = self.duplicates();
        if !dups.is_empty() {
            return Err(RuntimeError::DuplicateOverlay(dups));
        }

        for item in &mut self.readonly {
            item.mount()?;
        }
        if let Some(w) = &mut self.writable {
            w.mount()?;
        }

        let strategy = self.choose_strategy(support);
        let options = self.options(root);
        match strategy {
            MountStrategy::Kernel => mount_kernel(root, &options)?,
            MountStrategy::FuseOverlayfs => mount_fuse_overlayfs(root, &options)?,
        }
        self.strategy = Some(strategy);
        Ok(())
    }

    /// Detach the composed overlay, then every staged item.
    ///
    /// Every step is attempted. Errors are logged and returned together.
    pub fn unmount(&mut self, root: &Path) -> Result<(), RuntimeError> {
        let mut errors = Vec::new();

        match self.strategy.take() {
            Some(MountStrategy::Kernel) => {
                if let Err(e) = detach_mount(root) {
                    error!("error detaching overlay from {}: {e}", root.display());
                    errors.push(e);
                }
            }
            Some(MountStrategy::FuseOverlayfs) => {
                if let Err(e) = unmount_with_fuse(root) {
                    error!("error unmounting fuse-overlayfs from {}: {e}", root.display());
                    errors.push(e);
                }
            }
            None => debug!("overlay on {} was never mounted", root.display()),
        }

        let items = self.readonly.iter_mut().chain(self.writable.iter_mut());
        for item in items {
            if let Err(e) = item.unmount() {
                error!("error detaching overlay item {}: {e}", item.source().display());
                errors.push(e);
            }
        }

        RuntimeError::from_teardown(errors)
    }
}

fn mount_kernel(root: &Path, options: &str) -> Result<(), RuntimeError> {
    let with_xino = format!("{options},xino=on");
    debug!(
        "mounting overlay (via syscall) on {} with options {with_xino}",
        root.display()
    );
    let mut result = sys::mount("overlay", root, "overlay", sys::MS_NODEV, &with_xino);
    if matches!(&result, Err(e) if e.raw_os_error() == Some(libc::EINVAL)) {
        debug!("mounting with 'xino=on' failed, trying again with options {options}");
        result = sys::mount("overlay", root, "overlay", sys::MS_NODEV, options);
    }
    result.map_err(|e| RuntimeError::MountFailed {
        target: root.to_path_buf(),
        reason: format!("overlay: {e}"),
    })
}

fn mount_fuse_overlayfs(root: &Path, options: &str) -> Result<(), RuntimeError> {
    let purpose = "for this overlay specification";
    let tool = require_bin("fuse-overlayfs", purpose)?;
    require_fusermount(purpose)?;

    debug!(
        "mounting overlay (via fuse-overlayfs) on {} with options {options}",
        root.display()
    );
    let out = Command::new(&tool)
        .args(["-o", options])
        .arg(root)
        .output()
        .map_err(|e| RuntimeError::MountFailed {
            target: root.to_path_buf(),
            reason: format!("could not run fuse-overlayfs: {e}"),
        })?;
    if !out.status.success() {
        return Err(RuntimeError::MountFailed {
            target: root.to_path_buf(),
            reason: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
        });
    }
    Ok(())
}

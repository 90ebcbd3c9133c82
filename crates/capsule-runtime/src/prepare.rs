//! Turning a root image into a directory the starter can use.
//!
//! Depending on the root partition type and the privilege context an image
//! is passed through untouched (the starter kernel-mounts it), mounted with
//! FUSE, or extracted into a temporary sandbox:
//!
//! | partition           | kernel mount usable | otherwise                        |
//! |---------------------|---------------------|----------------------------------|
//! | sandbox             | n/a                 | used in place                    |
//! | squashfs            | pass-through        | FUSE, then extraction            |
//! | encrypted squashfs  | pass-through (suid) | error                            |
//! | ext3                | pass-through        | FUSE, never extracted            |

use crate::fuse::{FuseFs, ImageMount};
use crate::host::HostCleanup;
use crate::image::{HeaderProbe, ImageInspector, PartitionKind, RootfsPartition};
use crate::prereq::require_bin;
use crate::RuntimeError;
use std::env;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, warn};

/// Facts about the launch that decide how an image may be staged.
#[derive(Debug, Clone, Default)]
pub struct PrepareContext {
    pub inside_user_ns: bool,
    pub user_ns_requested: bool,
    pub tmp_sandbox_requested: bool,
    pub writable_requested: bool,
    pub fuse_requested: bool,
    pub fakeroot: bool,
    /// The setuid starter will run the container.
    pub use_suid: bool,
    pub kernel_squashfs_allowed: bool,
    pub kernel_extfs_allowed: bool,
    pub tmp_sandbox_allowed: bool,
    /// Where temporary sandboxes are created; the system temp dir when unset.
    pub tmp_dir: Option<PathBuf>,
}

impl PrepareContext {
    /// Any of these rule out handing the image to a kernel mount.
    fn avoid_kernel_mount(&self) -> bool {
        self.tmp_sandbox_requested || self.inside_user_ns || self.user_ns_requested || self.fuse_requested
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedKind {
    /// Already a directory, used in place.
    Sandbox,
    /// Left for the starter to mount; nothing to clean here.
    KernelMount(RootfsPartition),
    Fuse { temp_dir: PathBuf },
    Extracted { temp_dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    /// The container root: the image itself for pass-through, else a directory.
    pub root: PathBuf,
    pub kind: PreparedKind,
}

impl PreparedImage {
    pub fn is_fuse(&self) -> bool {
        matches!(self.kind, PreparedKind::Fuse { .. })
    }

    pub fn cleanup(&self) -> HostCleanup {
        match &self.kind {
            PreparedKind::Fuse { temp_dir } => HostCleanup {
                image_fuse: Some(self.root.clone()),
                temp_dir: Some(temp_dir.clone()),
            },
            PreparedKind::Extracted { temp_dir } => HostCleanup {
                image_fuse: None,
                temp_dir: Some(temp_dir.clone()),
            },
            PreparedKind::Sandbox | PreparedKind::KernelMount(_) => HostCleanup::default(),
        }
    }
}

/// The two ways of materialising an image without a kernel mount.
pub trait Stager {
    fn fuse_mount(
        &self,
        image: &Path,
        part: &RootfsPartition,
        target: &Path,
        readonly: bool,
    ) -> Result<(), RuntimeError>;

    fn extract(&self, image: &Path, part: &RootfsPartition, target: &Path) -> Result<(), RuntimeError>;
}

/// `squashfuse`/`fuse2fs` mounts and `unsquashfs` extraction.
#[derive(Debug, Clone, Default)]
pub struct HostStager {
    pub unsquashfs: Option<PathBuf>,
}

impl Stager for HostStager {
    fn fuse_mount(
        &self,
        image: &Path,
        part: &RootfsPartition,
        target: &Path,
        readonly: bool,
    ) -> Result<(), RuntimeError> {
        let fs = match part.kind {
            PartitionKind::Squashfs => FuseFs::Squashfs,
            PartitionKind::Ext3 => FuseFs::Ext3,
            ref other => {
                return Err(RuntimeError::UnsupportedFormat {
                    path: image.to_path_buf(),
                    reason: format!("{} cannot be mounted with FUSE", other.name()),
                });
            }
        };
        info!("mounting {} with FUSE", image.display());
        let enclosing = target.parent().unwrap_or(target);
        let mut im = ImageMount::new(fs, image, enclosing).at(target);
        im.readonly = readonly;
        if part.offset != 0 {
            im.extra_opts.push(format!("offset={}", part.offset));
        }
        im.mount()?;
        Ok(())
    }

    fn extract(&self, image: &Path, part: &RootfsPartition, target: &Path) -> Result<(), RuntimeError> {
        if part.kind != PartitionKind::Squashfs {
            return Err(RuntimeError::ExtractionFailed(format!(
                "{} root filesystems cannot be extracted",
                part.kind.name()
            )));
        }
        let unsquashfs = match &self.unsquashfs {
            Some(p) => p.clone(),
            None => require_bin("unsquashfs", "to extract images to a temporary sandbox")?,
        };
        info!("converting {} to a temporary sandbox", image.display());
        let out = Command::new(&unsquashfs)
            .args(["-f", "-no-progress", "-d"])
            .arg(target)
            .args(["-o", &part.offset.to_string()])
            .arg(image)
            .output()
            .map_err(|e| {
                RuntimeError::ExtractionFailed(format!("could not run {}: {e}", unsquashfs.display()))
            })?;
        if !out.status.success() {
            return Err(RuntimeError::ExtractionFailed(
                String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            ));
        }
        Ok(())
    }
}

/// Create `<tmp>/rootfs-XXXX/root`. The outer directory keeps its private
/// mode whatever extraction does to the inner one.
pub fn mk_container_dirs(tmp_dir: Option<&Path>) -> Result<(PathBuf, PathBuf), RuntimeError> {
    // cleanup compares against mountinfo, which holds resolved paths
    let base = fs::canonicalize(tmp_dir.map_or_else(env::temp_dir, Path::to_path_buf))?;
    let temp_dir = tempfile::Builder::new()
        .prefix("rootfs-")
        .tempdir_in(&base)?
        .keep();
    let root = temp_dir.join("root");
    if let Err(e) = DirBuilder::new().mode(0o755).create(&root) {
        let _ = fs::remove_dir_all(&temp_dir);
        return Err(e.into());
    }
    Ok((temp_dir, root))
}

pub struct ImagePreparer {
    inspector: Box<dyn ImageInspector>,
    stager: Box<dyn Stager>,
}

impl Default for ImagePreparer {
    fn default() -> Self {
        Self::new(Box::new(HeaderProbe), Box::new(HostStager::default()))
    }
}

impl ImagePreparer {
    pub fn new(inspector: Box<dyn ImageInspector>, stager: Box<dyn Stager>) -> Self {
        Self { inspector, stager }
    }

    pub fn inspector(&self) -> &dyn ImageInspector {
        self.inspector.as_ref()
    }

    pub fn prepare(&self, image: &Path, ctx: &PrepareContext) -> Result<PreparedImage, RuntimeError> {
        let part = self.inspector.rootfs_partition(image)?;
        debug!(
            "root filesystem of {} is {} at offset {}",
            image.display(),
            part.kind.name(),
            part.offset
        );

        match part.kind {
            PartitionKind::Sandbox => Ok(PreparedImage {
                root: image.to_path_buf(),
                kind: PreparedKind::Sandbox,
            }),
            PartitionKind::Squashfs => {
                if ctx.kernel_squashfs_allowed && !ctx.avoid_kernel_mount() {
                    return Ok(pass_through(image, part));
                }
                self.fuse_or_extract(image, &part, ctx)
            }
            PartitionKind::EncryptedSquashfs => {
                if ctx.kernel_squashfs_allowed && !ctx.avoid_kernel_mount() && ctx.use_suid {
                    return Ok(pass_through(image, part));
                }
                Err(RuntimeError::EncryptionRequiresKernelMount(image.to_path_buf()))
            }
            PartitionKind::Ext3 => {
                if ctx.kernel_extfs_allowed && !ctx.avoid_kernel_mount() {
                    return Ok(pass_through(image, part));
                }
                self.fuse_ext3(image, &part, ctx)
            }
            PartitionKind::Unknown(kind) => Err(RuntimeError::UnsupportedRootfs {
                path: image.to_path_buf(),
                kind,
            }),
        }
    }

    fn fuse_or_extract(
        &self,
        image: &Path,
        part: &RootfsPartition,
        ctx: &PrepareContext,
    ) -> Result<PreparedImage, RuntimeError> {
        let try_fuse = !ctx.writable_requested && !ctx.tmp_sandbox_requested && !ctx.fakeroot;
        let mut dirs = None;

        if try_fuse {
            let (temp_dir, root) = mk_container_dirs(ctx.tmp_dir.as_deref())?;
            match self.stager.fuse_mount(image, part, &root, true) {
                Ok(()) => {
                    return Ok(PreparedImage {
                        root,
                        kind: PreparedKind::Fuse { temp_dir },
                    });
                }
                Err(e) => warn!("squashfuse mount failed, falling back to extraction: {e}"),
            }
            dirs = Some((temp_dir, root));
        }

        if !ctx.tmp_sandbox_allowed {
            if let Some((temp_dir, _)) = dirs {
                let _ = fs::remove_dir_all(temp_dir);
            }
            return Err(RuntimeError::TmpSandboxProhibited(image.to_path_buf()));
        }

        let (temp_dir, root) = match dirs {
            Some(d) => d,
            None => mk_container_dirs(ctx.tmp_dir.as_deref())?,
        };
        if let Err(e) = self.stager.extract(image, part, &root) {
            if let Err(rm) = fs::remove_dir_all(&temp_dir) {
                error!("could not remove temporary directory {}: {rm}", temp_dir.display());
            }
            return Err(match e {
                RuntimeError::ExtractionFailed(_) => e,
                other => RuntimeError::ExtractionFailed(other.to_string()),
            });
        }
        Ok(PreparedImage {
            root,
            kind: PreparedKind::Extracted { temp_dir },
        })
    }

    fn fuse_ext3(
        &self,
        image: &Path,
        part: &RootfsPartition,
        ctx: &PrepareContext,
    ) -> Result<PreparedImage, RuntimeError> {
        let unsupported = |reason: String| RuntimeError::UnsupportedExtfsMount {
            path: image.to_path_buf(),
            reason,
        };
        if ctx.fakeroot {
            return Err(unsupported(
                "FUSE image mounts are not supported with fakeroot".to_owned(),
            ));
        }
        let (temp_dir, root) = mk_container_dirs(ctx.tmp_dir.as_deref())?;
        match self
            .stager
            .fuse_mount(image, part, &root, !ctx.writable_requested)
        {
            Ok(()) => Ok(PreparedImage {
                root,
                kind: PreparedKind::Fuse { temp_dir },
            }),
            Err(e) => {
                let _ = fs::remove_dir_all(&temp_dir);
                Err(unsupported(e.to_string()))
            }
        }
    }
}

fn pass_through(image: &Path, part: RootfsPartition) -> PreparedImage {
    debug!("leaving {} to a kernel mount", image.display());
    PreparedImage {
        root: image.to_path_buf(),
        kind: PreparedKind::KernelMount(part),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct FixedImage(PartitionKind);

    impl ImageInspector for FixedImage {
        fn rootfs_partition(&self, _: &Path) -> Result<RootfsPartition, RuntimeError> {
            Ok(RootfsPartition {
                kind: self.0.clone(),
                offset: 0,
            })
        }
    }

    #[derive(Default)]
    struct Calls {
        fuse: usize,
        extract: usize,
    }

    struct FakeStager {
        fuse_ok: bool,
        extract_ok: bool,
        calls: Rc<RefCell<Calls>>,
    }

    impl Stager for FakeStager {
        fn fuse_mount(&self, _: &Path, _: &RootfsPartition, _: &Path, _: bool) -> Result<(), RuntimeError> {
            self.calls.borrow_mut().fuse += 1;
            if self.fuse_ok {
                Ok(())
            } else {
                Err(RuntimeError::MountFailed {
                    target: PathBuf::from("/x"),
                    reason: "fuse: device not found".to_owned(),
                })
            }
        }

        fn extract(&self, _: &Path, _: &RootfsPartition, target: &Path) -> Result<(), RuntimeError> {
            self.calls.borrow_mut().extract += 1;
            if self.extract_ok {
                fs::create_dir(target.join("bin"))?;
                Ok(())
            } else {
                Err(RuntimeError::ExtractionFailed("corrupt".to_owned()))
            }
        }
    }

    fn preparer(kind: PartitionKind, fuse_ok: bool, extract_ok: bool) -> (ImagePreparer, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let p = ImagePreparer::new(
            Box::new(FixedImage(kind)),
            Box::new(FakeStager {
                fuse_ok,
                extract_ok,
                calls: calls.clone(),
            }),
        );
        (p, calls)
    }

    fn unprivileged(tmp: &Path) -> PrepareContext {
        PrepareContext {
            user_ns_requested: true,
            kernel_squashfs_allowed: true,
            kernel_extfs_allowed: true,
            tmp_sandbox_allowed: true,
            tmp_dir: Some(tmp.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn sandbox_is_used_in_place() {
        let (p, calls) = preparer(PartitionKind::Sandbox, false, false);
        let out = p.prepare(Path::new("/img"), &PrepareContext::default()).unwrap();
        assert_eq!(out.root, PathBuf::from("/img"));
        assert_eq!(out.kind, PreparedKind::Sandbox);
        assert!(out.cleanup().is_empty());
        assert_eq!(calls.borrow().fuse, 0);
    }

    #[test]
    fn privileged_squashfs_passes_through() {
        let (p, calls) = preparer(PartitionKind::Squashfs, true, true);
        let ctx = PrepareContext {
            kernel_squashfs_allowed: true,
            ..Default::default()
        };
        let out = p.prepare(Path::new("/img.sif"), &ctx).unwrap();
        assert!(matches!(out.kind, PreparedKind::KernelMount(_)));
        assert_eq!(calls.borrow().fuse + calls.borrow().extract, 0);
    }

    #[test]
    fn unprivileged_squashfs_uses_fuse() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, calls) = preparer(PartitionKind::Squashfs, true, true);
        let out = p.prepare(Path::new("/img.sif"), &unprivileged(tmp.path())).unwrap();
        assert!(out.is_fuse());
        assert!(out.root.ends_with("root"));
        assert_eq!(calls.borrow().extract, 0);
        let cleanup = out.cleanup();
        assert_eq!(cleanup.image_fuse.as_deref(), Some(out.root.as_path()));
    }

    #[test]
    fn fuse_failure_falls_back_to_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, calls) = preparer(PartitionKind::Squashfs, false, true);
        let out = p.prepare(Path::new("/img.sif"), &unprivileged(tmp.path())).unwrap();
        let PreparedKind::Extracted { ref temp_dir } = out.kind else {
            panic!("expected extraction, got {:?}", out.kind);
        };
        assert!(out.root.join("bin").is_dir());
        assert_eq!(out.root, temp_dir.join("root"));
        assert_eq!(calls.borrow().fuse, 1);
        assert_eq!(calls.borrow().extract, 1);
    }

    #[test]
    fn fuse_failure_with_sandbox_prohibited_is_recognisable() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, calls) = preparer(PartitionKind::Squashfs, false, true);
        let ctx = PrepareContext {
            tmp_sandbox_allowed: false,
            ..unprivileged(tmp.path())
        };
        let err = p.prepare(Path::new("/img.sif"), &ctx).unwrap_err();
        assert!(matches!(err, RuntimeError::TmpSandboxProhibited(_)));
        assert_eq!(calls.borrow().extract, 0);
        // the temporary dirs made for the FUSE attempt are gone
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn writable_skips_fuse() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, calls) = preparer(PartitionKind::Squashfs, true, true);
        let ctx = PrepareContext {
            writable_requested: true,
            ..unprivileged(tmp.path())
        };
        let out = p.prepare(Path::new("/img.sif"), &ctx).unwrap();
        assert!(matches!(out.kind, PreparedKind::Extracted { .. }));
        assert_eq!(calls.borrow().fuse, 0);
    }

    #[test]
    fn tmp_sandbox_request_forces_extraction_even_when_privileged() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, calls) = preparer(PartitionKind::Squashfs, true, true);
        let ctx = PrepareContext {
            tmp_sandbox_requested: true,
            kernel_squashfs_allowed: true,
            tmp_sandbox_allowed: true,
            tmp_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let out = p.prepare(Path::new("/img.sif"), &ctx).unwrap();
        assert!(matches!(out.kind, PreparedKind::Extracted { .. }));
        assert_eq!(calls.borrow().fuse, 0);
    }

    #[test]
    fn extraction_failure_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, _) = preparer(PartitionKind::Squashfs, false, false);
        let err = p.prepare(Path::new("/img.sif"), &unprivileged(tmp.path())).unwrap_err();
        assert!(matches!(err, RuntimeError::ExtractionFailed(_)));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn kernel_squashfs_disabled_by_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, calls) = preparer(PartitionKind::Squashfs, true, true);
        let ctx = PrepareContext {
            kernel_squashfs_allowed: false,
            tmp_sandbox_allowed: true,
            tmp_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        assert!(p.prepare(Path::new("/i"), &ctx).unwrap().is_fuse());
        assert_eq!(calls.borrow().fuse, 1);
    }

    #[test]
    fn encrypted_needs_suid_kernel_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, calls) = preparer(PartitionKind::EncryptedSquashfs, true, true);
        let err = p.prepare(Path::new("/enc.sif"), &unprivileged(tmp.path())).unwrap_err();
        assert!(matches!(err, RuntimeError::EncryptionRequiresKernelMount(_)));
        assert_eq!(calls.borrow().fuse + calls.borrow().extract, 0);

        let ctx = PrepareContext {
            kernel_squashfs_allowed: true,
            use_suid: true,
            ..Default::default()
        };
        let out = p.prepare(Path::new("/enc.sif"), &ctx).unwrap();
        assert!(matches!(out.kind, PreparedKind::KernelMount(_)));

        let no_suid = PrepareContext {
            kernel_squashfs_allowed: true,
            ..Default::default()
        };
        assert!(p.prepare(Path::new("/enc.sif"), &no_suid).is_err());
    }

    #[test]
    fn ext3_is_never_extracted() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, calls) = preparer(PartitionKind::Ext3, false, true);
        let err = p.prepare(Path::new("/old.img"), &unprivileged(tmp.path())).unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedExtfsMount { .. }));
        assert_eq!(calls.borrow().extract, 0);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn ext3_fuse_when_unprivileged() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, _) = preparer(PartitionKind::Ext3, true, true);
        assert!(p
            .prepare(Path::new("/old.img"), &unprivileged(tmp.path()))
            .unwrap()
            .is_fuse());
    }

    #[test]
    fn ext3_refused_with_fakeroot() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, calls) = preparer(PartitionKind::Ext3, true, true);
        let ctx = PrepareContext {
            fakeroot: true,
            ..unprivileged(tmp.path())
        };
        assert!(p.prepare(Path::new("/old.img"), &ctx).is_err());
        assert_eq!(calls.borrow().fuse, 0);
    }

    #[test]
    fn unknown_partition_is_unsupported() {
        let (p, _) = preparer(PartitionKind::Unknown("btrfs".to_owned()), true, true);
        let err = p.prepare(Path::new("/x"), &PrepareContext::default()).unwrap_err();
        assert!(err.to_string().contains("btrfs"));
    }

    #[test]
    fn container_dirs_nest_root() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let (outer, root) = mk_container_dirs(Some(tmp.path())).unwrap();
        assert_eq!(root, outer.join("root"));
        let outer_mode = outer.metadata().unwrap().permissions().mode() & 0o777;
        assert_eq!(outer_mode, 0o700);
        assert!(root.is_dir());
    }

    #[test]
    fn container_dirs_resolve_symlinked_base() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let (outer, root) = mk_container_dirs(Some(&link)).unwrap();
        assert!(outer.starts_with(fs::canonicalize(&real).unwrap()));
        assert_eq!(root, outer.join("root"));
    }
}

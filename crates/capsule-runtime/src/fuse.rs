use crate::prereq::{require_bin, require_fusermount};
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Options derived from the mount flags; callers cannot override them.
const RESERVED_OPTS: &[&str] = &[
    "ro", "rw", "dev", "nodev", "suid", "nosuid", "allow_other", "uid", "gid",
];

/// Image filesystems that can be mounted with a FUSE helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuseFs {
    Squashfs,
    Ext3,
}

impl FuseFs {
    pub fn tool(self) -> &'static str {
        match self {
            Self::Squashfs => "squashfuse",
            Self::Ext3 => "fuse2fs",
        }
    }
}

/// One image mounted through `squashfuse` or `fuse2fs`.
#[derive(Debug, Clone)]
pub struct ImageMount {
    pub fs: FuseFs,
    pub readonly: bool,
    pub source: PathBuf,
    /// Directory under which a fresh mount point is created when none is set.
    pub enclosing_dir: PathBuf,
    pub allow_setuid: bool,
    pub allow_dev: bool,
    pub allow_other: bool,
    pub extra_opts: Vec<String>,
    mountpoint: Option<PathBuf>,
}

impl ImageMount {
    pub fn new(fs: FuseFs, source: impl Into<PathBuf>, enclosing_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            readonly: fs == FuseFs::Squashfs,
            source: source.into(),
            enclosing_dir: enclosing_dir.into(),
            allow_setuid: false,
            allow_dev: false,
            allow_other: false,
            extra_opts: Vec::new(),
            mountpoint: None,
        }
    }

    /// Mount onto an existing directory instead of a fresh one.
    #[must_use]
    pub fn at(mut self, mountpoint: impl Into<PathBuf>) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref()
    }

    /// Value of the `-o` argument handed to the FUSE helper.
    pub fn options(&self) -> String {
        let mut opts = vec!["uid=0".to_owned(), "gid=0".to_owned()];
        // squashfs cannot be written whatever was asked
        if self.readonly || self.fs == FuseFs::Squashfs {
            opts.push("ro".to_owned());
        }
        if self.allow_dev {
            opts.push("dev".to_owned());
        }
        if self.allow_setuid {
            opts.push("suid".to_owned());
        }
        if self.allow_other {
            opts.push("allow_other".to_owned());
        }
        for extra in &self.extra_opts {
            let key = extra.split_once('=').map_or(extra.as_str(), |(k, _)| k);
            if RESERVED_OPTS.contains(&key) {
                debug!("dropping reserved FUSE option '{extra}'");
                continue;
            }
            opts.push(extra.clone());
        }
        opts.join(",")
    }

    /// Run the FUSE helper. On failure a mount point created here is removed.
    pub fn mount(&mut self) -> Result<&Path, RuntimeError> {
        let purpose = format!("to mount {} with FUSE", self.source.display());
        let tool = require_bin(self.fs.tool(), &purpose)?;
        require_fusermount(&purpose)?;

        let created = self.mountpoint.is_none();
        let mountpoint = match self.mountpoint.take() {
            Some(m) => m,
            None => tempfile::Builder::new()
                .prefix("mountpoint-")
                .tempdir_in(&self.enclosing_dir)?
                .keep(),
        };

        let opts = self.options();
        debug!(
            "executing FUSE mount command: {} -o {opts} {} {}",
            tool.display(),
            self.source.display(),
            mountpoint.display()
        );
        let result = Command::new(&tool)
            .args(["-o", &opts])
            .arg(&self.source)
            .arg(&mountpoint)
            .output();

        let failure = match result {
            Ok(out) if out.status.success() => None,
            Ok(out) => Some(format!(
                "{} exited with {}: {}",
                self.fs.tool(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )),
            Err(e) => Some(format!("could not run {}: {e}", tool.display())),
        };

        if let Some(reason) = failure {
            if created {
                debug!(
                    "FUSE mount of {} failed, removing {}",
                    self.source.display(),
                    mountpoint.display()
                );
                let _ = fs::remove_dir(&mountpoint);
            } else {
                self.mountpoint = Some(mountpoint.clone());
            }
            return Err(RuntimeError::MountFailed {
                target: mountpoint,
                reason,
            });
        }

        let mountpoint: &Path = self.mountpoint.insert(mountpoint);
        Ok(mountpoint)
    }
}

fn run_fusermount(dir: &Path, lazy: bool) -> Result<(), RuntimeError> {
    let fusermount = require_fusermount("to unmount FUSE mounts")?;
    let flag = if lazy { "-uz" } else { "-u" };
    debug!(
        "executing FUSE unmount command: {} {flag} {}",
        fusermount.display(),
        dir.display()
    );
    let out = Command::new(&fusermount)
        .arg(flag)
        .arg(dir)
        .output()
        .map_err(|e| RuntimeError::UnmountFailed {
            target: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
    if out.status.success() {
        Ok(())
    } else {
        Err(RuntimeError::UnmountFailed {
            target: dir.to_path_buf(),
            reason: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
        })
    }
}

pub fn unmount_with_fuse(dir: &Path) -> Result<(), RuntimeError> {
    run_fusermount(dir, false)
}

/// Lazy variant: detaches now, releases once the last user is gone.
pub fn unmount_with_fuse_lazy(dir: &Path) -> Result<(), RuntimeError> {
    run_fusermount(dir, true)
}

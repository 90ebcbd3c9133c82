use crate::RuntimeError;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

/// Directories searched after `$PATH`; privileged helpers often live in sbin.
const FALLBACK_DIRS: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve `name` to an executable, searching `$PATH` then the sbin dirs.
pub fn find_bin(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH").unwrap_or_default();
    env::split_paths(&path_var)
        .chain(FALLBACK_DIRS.iter().map(PathBuf::from))
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Like `find_bin`, but a missing tool is an error naming what it was for.
pub fn require_bin(name: &str, purpose: &str) -> Result<PathBuf, RuntimeError> {
    find_bin(name).ok_or_else(|| RuntimeError::MissingTool {
        tool: name.to_owned(),
        purpose: purpose.to_owned(),
    })
}

/// `fusermount3` is preferred; older systems only ship `fusermount`.
pub fn find_fusermount() -> Option<PathBuf> {
    find_bin("fusermount3").or_else(|| find_bin("fusermount"))
}

pub fn require_fusermount(purpose: &str) -> Result<PathBuf, RuntimeError> {
    find_fusermount().ok_or_else(|| RuntimeError::MissingTool {
        tool: "fusermount".to_owned(),
        purpose: purpose.to_owned(),
    })
}

/// Check the optional tools used by unprivileged launches.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_launch_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if find_fusermount().is_none() {
        missing.push(MissingPrereq {
            name: "fusermount",
            purpose: "unmounting FUSE image and overlay mounts",
            install_hint: "zypper install fuse3 | apt install fuse3 | dnf install fuse3 | pacman -S fuse3",
        });
    }

    if find_bin("squashfuse").is_none() {
        missing.push(MissingPrereq {
            name: "squashfuse",
            purpose: "mounting squashfs images without privileges",
            install_hint: "zypper install squashfuse | apt install squashfuse | dnf install squashfuse | pacman -S squashfuse",
        });
    }

    if find_bin("fuse2fs").is_none() {
        missing.push(MissingPrereq {
            name: "fuse2fs",
            purpose: "mounting ext3 overlay images without privileges",
            install_hint: "part of e2fsprogs (apt install fuse2fs on Debian/Ubuntu)",
        });
    }

    if find_bin("fuse-overlayfs").is_none() {
        missing.push(MissingPrereq {
            name: "fuse-overlayfs",
            purpose: "overlay filesystem when the kernel refuses unprivileged overlays",
            install_hint: "zypper install fuse-overlayfs | apt install fuse-overlayfs | dnf install fuse-overlayfs | pacman -S fuse-overlayfs",
        });
    }

    if find_bin("unsquashfs").is_none() {
        missing.push(MissingPrereq {
            name: "unsquashfs",
            purpose: "extracting images into a temporary sandbox",
            install_hint: "zypper install squashfs | apt install squashfs-tools | dnf install squashfs-tools | pacman -S squashfs-tools",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nUnprivileged image and overlay mounts fall back to these tools.");
    msg
}

//! Host capability probes.
//!
//! `OverlaySupport` answers the two questions the overlay code asks before
//! choosing between a kernel overlay mount and `fuse-overlayfs`. The
//! unprivileged overlay check is expensive (it mounts an overlay inside a
//! throwaway user namespace) so `KernelProbe` runs it at most once.

use crate::prereq::find_bin;
use crate::sys;
use std::fs;
use std::process::Command;
use std::sync::OnceLock;
use tracing::debug;

pub trait OverlaySupport: Send + Sync {
    /// Whether the invoking user is root on the host.
    fn host_is_root(&self) -> bool;
    /// Whether the kernel accepts overlay mounts inside a user namespace.
    fn unprivileged_overlays(&self) -> bool;

    fn kernel_overlay_usable(&self) -> bool {
        self.host_is_root() || self.unprivileged_overlays()
    }
}

pub struct KernelProbe {
    check: fn() -> bool,
    unprivileged: OnceLock<bool>,
}

impl KernelProbe {
    pub fn new() -> Self {
        Self::with_check(check_rootless_overlay)
    }

    /// Use a custom unprivileged overlay check. It still runs at most once.
    pub fn with_check(check: fn() -> bool) -> Self {
        Self {
            check,
            unprivileged: OnceLock::new(),
        }
    }
}

impl Default for KernelProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlaySupport for KernelProbe {
    fn host_is_root(&self) -> bool {
        sys::current_uid() == 0
    }

    fn unprivileged_overlays(&self) -> bool {
        *self.unprivileged.get_or_init(self.check)
    }
}

/// Fixed answers, for tests and for callers that already know.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSupport {
    pub root: bool,
    pub unprivileged: bool,
}

impl OverlaySupport for FixedSupport {
    fn host_is_root(&self) -> bool {
        self.root
    }

    fn unprivileged_overlays(&self) -> bool {
        self.unprivileged
    }
}

/// Try an overlay mount with `userxattr` in a fresh user + mount namespace.
pub fn check_rootless_overlay() -> bool {
    let (Some(unshare), Some(mount)) = (find_bin("unshare"), find_bin("mount")) else {
        debug!("unshare or mount not found, assuming no rootless overlay support");
        return false;
    };
    let tmp = match tempfile::Builder::new().prefix("check-overlay").tempdir() {
        Ok(t) => t,
        Err(e) => {
            debug!("could not create overlay probe dirs: {e}");
            return false;
        }
    };
    let dirs: Vec<_> = ["l", "u", "w", "m"]
        .iter()
        .map(|d| tmp.path().join(d))
        .collect();
    for d in &dirs {
        if let Err(e) = fs::create_dir(d) {
            debug!("could not create overlay probe dir {}: {e}", d.display());
            return false;
        }
    }
    let opts = format!(
        "lowerdir={},upperdir={},workdir={},userxattr",
        dirs[0].display(),
        dirs[1].display(),
        dirs[2].display()
    );

    let out = Command::new(unshare)
        .args(["--user", "--map-root-user", "--mount"])
        .arg(mount)
        .args(["-t", "overlay", "-o", &opts, "none"])
        .arg(&dirs[3])
        .output();
    match out {
        Ok(o) if o.status.success() => {
            debug!("rootless overlay appears supported on this system");
            true
        }
        Ok(o) => {
            debug!(
                "rootless overlay not supported on this system: {}",
                String::from_utf8_lossy(&o.stderr).trim()
            );
            false
        }
        Err(e) => {
            debug!("rootless overlay probe failed to run: {e}");
            false
        }
    }
}

/// A `uid_map` covering the full 32-bit range means the host namespace.
pub fn uid_map_is_host(content: &str) -> bool {
    content.lines().any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        matches!(fields.as_slice(), ["0", "0", size] if *size == "4294967295")
    })
}

/// Whether process `pid` runs inside a (non-initial) user namespace.
pub fn inside_user_namespace(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/uid_map")) {
        Ok(content) => !uid_map_is_host(&content),
        Err(_) => false,
    }
}

const CAP_SYS_ADMIN: u32 = 21;

/// Extract the effective capability set from a `/proc/<pid>/status` dump.
pub fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}

pub fn has_cap_sys_admin() -> bool {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| parse_cap_eff(&s))
        .is_some_and(|caps| caps & (1 << CAP_SYS_ADMIN) != 0)
}

pub fn cgroup2_unified() -> bool {
    std::path::Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

//! Thin safe wrappers over the few libc calls the mount code needs.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub use libc::{MS_BIND, MS_NODEV, MS_NOSUID, MS_RDONLY, MS_REMOUNT};

fn cstr(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn path_cstr(path: &Path) -> io::Result<CString> {
    cstr(path.as_os_str().as_bytes())
}

/// mount(2). Empty `source`, `fstype` or `data` are passed as NULL.
#[allow(unsafe_code)]
pub fn mount(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: libc::c_ulong,
    data: &str,
) -> io::Result<()> {
    let source = (!source.is_empty())
        .then(|| cstr(source.as_bytes()))
        .transpose()?;
    let fstype = (!fstype.is_empty())
        .then(|| cstr(fstype.as_bytes()))
        .transpose()?;
    let data = (!data.is_empty()).then(|| cstr(data.as_bytes())).transpose()?;
    let target = path_cstr(target)?;

    // SAFETY: every pointer is either NULL or points into a CString that
    // outlives the call; mount(2) does not retain them.
    let rc = unsafe {
        libc::mount(
            source.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            target.as_ptr(),
            fstype.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            data.as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr().cast::<libc::c_void>()),
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Lazy unmount (`MNT_DETACH`): succeeds even when the target is busy.
#[allow(unsafe_code)]
pub fn umount_detach(target: &Path) -> io::Result<()> {
    let target = path_cstr(target)?;
    // SAFETY: target is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Safe wrapper around libc::getuid().
#[allow(unsafe_code)]
pub fn current_uid() -> u32 {
    // SAFETY: getuid() takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

/// Safe wrapper around libc::getgid().
#[allow(unsafe_code)]
pub fn current_gid() -> u32 {
    // SAFETY: getgid() takes no arguments and cannot fail.
    unsafe { libc::getgid() }
}

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid() takes no arguments and cannot fail.
    unsafe { libc::geteuid() }
}

/// Read the process umask. umask(2) can only be read by setting it, so the
/// value is written straight back.
#[allow(unsafe_code)]
pub fn current_umask() -> u32 {
    // SAFETY: umask() cannot fail; the original mask is restored immediately.
    let mask = unsafe { libc::umask(0o022) };
    // SAFETY: as above.
    unsafe { libc::umask(mask) };
    mask
}

/// Soft and hard `RLIMIT_STACK`.
#[allow(unsafe_code)]
pub fn stack_rlimit() -> io::Result<(u64, u64)> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: lim is a valid, writable rlimit for the duration of the call.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut lim) };
    if rc == 0 {
        Ok((lim.rlim_cur, lim.rlim_max))
    } else {
        Err(io::Error::last_os_error())
    }
}

/// kill(2). Signal 0 only checks that the process exists.
#[allow(unsafe_code)]
pub fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: kill() takes plain integers and does not touch our memory.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub fn process_alive(pid: u32) -> bool {
    match send_signal(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

pub use libc::{SIGKILL, SIGTERM};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umask_read_is_stable() {
        assert_eq!(current_umask(), current_umask());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(stack_rlimit().is_ok());
    }

    #[test]
    fn interior_nul_is_invalid_input() {
        let err = mount("a\0b", Path::new("/tmp"), "", 0, "").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn detach_of_non_mountpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(umount_detach(dir.path()).is_err());
    }

    #[test]
    fn uid_is_stable() {
        assert_eq!(current_uid(), current_uid());
    }
}

//! GPU library and binary discovery for `--nv` / `--rocm`.
//!
//! A liblist file names one library or binary per line. Libraries (anything
//! containing `.so`) are resolved through the dynamic linker cache, binaries
//! through `PATH`.

use capsule_runtime::find_bin;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Socket of the NVIDIA persistence daemon, bound when present.
pub const NVIDIA_PERSISTENCED_SOCKET: &str = "/var/run/nvidia-persistenced/socket";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuPaths {
    pub libs: Vec<PathBuf>,
    pub bins: Vec<PathBuf>,
}

/// Split a liblist file into library names and binary names.
pub fn parse_liblist(content: &str) -> (Vec<String>, Vec<String>) {
    let mut libs = Vec::new();
    let mut bins = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.contains(".so") {
            libs.push(line.to_owned());
        } else {
            bins.push(line.to_owned());
        }
    }
    (libs, bins)
}

/// Pick the cached paths of `wanted` libraries from `ldconfig -p` output.
/// Only the first entry per soname is kept.
pub fn match_ld_cache(ld_cache: &str, wanted: &[String]) -> Vec<PathBuf> {
    let mut seen: Vec<&str> = Vec::new();
    let mut out = Vec::new();
    for line in ld_cache.lines() {
        let Some((head, path)) = line.split_once("=>") else {
            continue;
        };
        let Some(soname) = head.split_whitespace().next() else {
            continue;
        };
        if seen.contains(&soname) {
            continue;
        }
        if wanted.iter().any(|w| soname.starts_with(w.as_str())) {
            seen.push(soname);
            out.push(PathBuf::from(path.trim()));
        }
    }
    out
}

fn ld_cache() -> io::Result<String> {
    let ldconfig = find_bin("ldconfig").unwrap_or_else(|| PathBuf::from("/sbin/ldconfig"));
    let out = Command::new(ldconfig).arg("-p").output()?;
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Resolve every entry of the liblist at `conf` on this host.
pub fn gpu_paths(conf: &Path) -> io::Result<GpuPaths> {
    let content = fs::read_to_string(conf)?;
    let (lib_names, bin_names) = parse_liblist(&content);
    let libs = if lib_names.is_empty() {
        Vec::new()
    } else {
        match_ld_cache(&ld_cache()?, &lib_names)
    };
    let bins = bin_names
        .iter()
        .filter_map(|b| {
            let found = find_bin(b);
            if found.is_none() {
                debug!("GPU binary {b} not found on this host");
            }
            found
        })
        .collect();
    Ok(GpuPaths { libs, bins })
}

pub fn nvidia_ipcs() -> Vec<String> {
    if Path::new(NVIDIA_PERSISTENCED_SOCKET).exists() {
        vec![NVIDIA_PERSISTENCED_SOCKET.to_owned()]
    } else {
        Vec::new()
    }
}

/// Bind entries for GPU binaries (to `/usr/bin/<name>`) followed by IPC
/// sockets (bound in place).
pub fn gpu_file_binds(bins: &[PathBuf], ipcs: &[String]) -> Vec<String> {
    bins.iter()
        .map(|b| {
            let name = b.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            format!("{}:/usr/bin/{name}", b.display())
        })
        .chain(ipcs.iter().cloned())
        .collect()
}

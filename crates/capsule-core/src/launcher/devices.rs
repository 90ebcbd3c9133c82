//! NVIDIA and ROCm GPU setup.

use super::{Context, Resolution};
use crate::config::GpuMode;
use crate::gpu::{gpu_file_binds, gpu_paths, nvidia_ipcs, GpuPaths};
use crate::LaunchError;
use std::path::Path;
use tracing::{debug, info};

pub fn set_gpu(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    let mut nv = r.opts.nvidia || r.opts.nvccli;
    if ctx.conf.always_use_nv && !r.opts.no_nvidia {
        debug!("'always-use-nv = yes', enabling NVIDIA GPU support");
        nv = true;
    }
    let mut rocm = r.opts.rocm;
    if ctx.conf.always_use_rocm && !r.opts.no_rocm {
        debug!("'always-use-rocm = yes', enabling ROCm GPU support");
        rocm = true;
    }
    if nv && rocm {
        r.warn("--nv and --rocm cannot be used together. Only --nv will be applied.");
    }

    if nv {
        if !(ctx.conf.use_nvidia_container_cli || r.opts.nvccli) {
            return Ok(legacy(r, &ctx.conf.nvliblist, nvidia_ipcs(), "nv", GpuMode::NvLegacy));
        }
        if r.opts.fakeroot && ctx.conf.allow_setuid && ctx.conf.suid_install {
            return Err(LaunchError::Gpu(
                "--fakeroot does not support --nvccli in set-uid installations".to_owned(),
            ));
        }
        return nvccli(r);
    }
    if rocm {
        return Ok(legacy(r, &ctx.conf.rocmliblist, Vec::new(), "rocm", GpuMode::Rocm));
    }
    Ok(r)
}

/// Bind host GPU libraries, binaries and IPC sockets listed in `liblist`.
fn legacy(
    mut r: Resolution,
    liblist: &Path,
    ipcs: Vec<String>,
    label: &str,
    mode: GpuMode,
) -> Resolution {
    let paths = gpu_paths(liblist).unwrap_or_else(|e| {
        r.warn(format!("While finding {label} bind points: {e}"));
        GpuPaths::default()
    });
    let files = gpu_file_binds(&paths.bins, &ipcs);

    if files.is_empty() {
        r.warn(format!("Could not find any {label} files on this host!"));
    } else {
        if r.opts.writable {
            r.warn(format!("{label} files may not be bound with --writable"));
        }
        r.config.files_path.extend(files);
    }
    if paths.libs.is_empty() {
        r.warn(format!("Could not find any {label} libraries on this host!"));
    } else {
        r.config.libraries_path.extend(paths.libs);
    }
    r.config.gpu = mode;
    r
}

/// Leave GPU setup to nvidia-container-cli, run by the starter.
fn nvccli(mut r: Resolution) -> Result<Resolution, LaunchError> {
    debug!("using nvidia-container-cli for GPU setup");
    let visible = r
        .host_env
        .get("NVIDIA_VISIBLE_DEVICES")
        .is_some_and(|v| !v.is_empty());
    if !visible {
        if r.opts.contained() {
            r.warn(
                "When using nvidia-container-cli with --contain NVIDIA_VISIBLE_DEVICES must be set or no GPUs will be available in container.",
            );
        } else {
            info!("Setting 'NVIDIA_VISIBLE_DEVICES=all' to emulate legacy GPU binding.");
            r.host_env
                .insert("NVIDIA_VISIBLE_DEVICES".to_owned(), "all".to_owned());
        }
    }
    r.config.nvccli_env = r
        .host_env
        .iter()
        .filter(|(k, _)| k.starts_with("NVIDIA_"))
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    if r.opts.namespaces.user && !r.opts.writable {
        return Err(LaunchError::Gpu(
            "nvidia-container-cli requires --writable with user namespace/fakeroot".to_owned(),
        ));
    }
    if !r.opts.writable && !r.opts.writable_tmpfs {
        r.warn("Setting --writable-tmpfs (required by nvidia-container-cli)");
        r.opts.writable_tmpfs = true;
    }
    r.config.gpu = GpuMode::NvCcli;
    Ok(r)
}

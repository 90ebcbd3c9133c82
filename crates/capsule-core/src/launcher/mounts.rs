//! Bind, FUSE and home mounts, and the mounts the user switched off.

use super::{Context, Resolution};
use crate::LaunchError;
use capsule_schema::{parse_bind_paths, parse_data_bind, parse_mount_string};
use std::path::Path;
use tracing::debug;

const FUSE_MOUNT_TYPES: &[&str] = &["container", "host", "container-daemon", "host-daemon"];

pub fn set_binds(mut r: Resolution, _ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    let joined = r.opts.mounts.binds.join(",");
    let mut binds = parse_bind_paths(&joined)?;
    for spec in &r.opts.mounts.mounts {
        binds.extend(parse_mount_string(spec)?);
    }
    if !joined.is_empty() {
        r.config.process.set_env("CAPSULE_BIND", joined);
    }
    r.config.binds = binds;
    r.config.data_binds = r
        .opts
        .mounts
        .data_binds
        .iter()
        .map(|d| parse_data_bind(d))
        .collect::<Result<_, _>>()?;
    Ok(r)
}

/// Check one `<type>:<command> <mountpoint>` entry.
fn check_fuse_mount(spec: &str) -> Result<(), LaunchError> {
    let invalid = |why: &str| LaunchError::InvalidOption(format!("--fusemount '{spec}': {why}"));
    let (kind, rest) = spec
        .split_once(':')
        .ok_or_else(|| invalid("expected <type>:<command> <mountpoint>"))?;
    if !FUSE_MOUNT_TYPES.contains(&kind) {
        return Err(invalid("type must be one of container, host, container-daemon, host-daemon"));
    }
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        [_, .., mountpoint] if Path::new(mountpoint).is_absolute() => Ok(()),
        [_, .., _] => Err(invalid("mountpoint must be an absolute path")),
        _ => Err(invalid("a command and a mountpoint are required")),
    }
}

/// FUSE mounts run their driver inside the container's PID namespace.
pub fn set_fuse_mounts(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    if r.opts.mounts.fuse_mounts.is_empty() {
        return Ok(r);
    }
    if !ctx.conf.enable_fusemount {
        return Err(LaunchError::InvalidOption(
            "--fusemount is disabled by 'enable-fusemount = false'".to_owned(),
        ));
    }
    for spec in &r.opts.mounts.fuse_mounts {
        check_fuse_mount(spec)?;
    }
    r.config.fuse_mounts.clone_from(&r.opts.mounts.fuse_mounts);
    r.opts.namespaces.pid = true;
    Ok(r)
}

/// Resolve `--home src[:dst]`, fakeroot's `/root` and target-uid homes.
pub fn set_home(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    let (mut home, custom) = match r.opts.home.clone() {
        Some(h) => (h, true),
        None => (ctx.host.home_dir().display().to_string(), false),
    };
    r.config.custom_home = custom;

    if !custom {
        if r.opts.fakeroot {
            home = format!("{home}:/root");
        } else if let Some(uid) = r.config.target_uid.filter(|u| *u != 0) {
            match ctx.host.passwd_home(uid).filter(|_| uid > 500) {
                Some(dir) => {
                    debug!("using home {} of target uid {uid}", dir.display());
                    home = dir.display().to_string();
                    r.config.custom_home = true;
                }
                None => {
                    debug!("no usable home for target uid {uid}, disabling home mount");
                    home = "/".to_owned();
                    r.config.no_home = true;
                }
            }
        }
    }

    let parts: Vec<&str> = home.split(':').collect();
    let (source, dest) = match parts.as_slice() {
        [src] => (*src, *src),
        [src, dst] => (*src, *dst),
        _ => {
            return Err(LaunchError::InvalidOption(
                "home argument has incorrect number of elements".to_owned(),
            ));
        }
    };
    r.config.home_source = source.to_owned();
    r.config.home_dest = dest.to_owned();
    r.config.no_home |= r.opts.no_home;
    Ok(r)
}

pub fn set_no_mount(mut r: Resolution, _ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    for name in r.opts.mounts.no_mount.clone() {
        let nm = &mut r.config.no_mount;
        match name.as_str() {
            "proc" => nm.proc = true,
            "sys" => nm.sys = true,
            "dev" => nm.dev = true,
            "devpts" => nm.devpts = true,
            "home" => nm.home = true,
            "tmp" => nm.tmp = true,
            "hostfs" => nm.hostfs = true,
            "cwd" => nm.cwd = true,
            "bind-paths" => r.config.skip_binds.push("*".to_owned()),
            p if Path::new(p).is_absolute() => r.config.skip_binds.push(name.clone()),
            other => r.warn(format!("Ignoring unknown mount type '{other}'")),
        }
    }
    Ok(r)
}

pub fn resolve_writable_tmpfs(
    mut r: Resolution,
    _ctx: &Context<'_>,
) -> Result<Resolution, LaunchError> {
    if r.opts.writable && r.opts.writable_tmpfs {
        r.warn("Disabling --writable-tmpfs flag, mutually exclusive with --writable");
        r.opts.writable_tmpfs = false;
    }
    r.config.writable_tmpfs = r.opts.writable_tmpfs;
    Ok(r)
}

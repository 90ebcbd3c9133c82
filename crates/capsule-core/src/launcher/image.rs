//! The container image: which one, its overlays, its key, and how its root
//! filesystem reaches the starter.

use super::{Context, Resolution};
use crate::config::NamespaceKind;
use crate::instance::instance_name;
use crate::LaunchError;
use capsule_runtime::{OverlayItem, OverlaySet, PrepareContext, RuntimeError};
use std::path::Path;
use tracing::{debug, error, info};

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Either join a running instance or resolve the image path.
pub fn set_image_or_instance(
    mut r: Resolution,
    ctx: &Context<'_>,
) -> Result<Resolution, LaunchError> {
    if let Some(name) = instance_name(&r.image).map(str::to_owned) {
        if r.instance_name.is_some() {
            return Err(LaunchError::InvalidOption(
                "starting an instance from another is not allowed".to_owned(),
            ));
        }
        let record = ctx.registry.get(&name)?;
        if record.cgroup && r.uid != 0 && !ctx.conf.systemd_cgroups {
            return Err(LaunchError::InvalidOption(
                "joining non-root instance with cgroups requires systemd as cgroups manager"
                    .to_owned(),
            ));
        }
        debug!("joining instance {name} (pid {})", record.pid);
        r.opts.namespaces.user = record.user_ns;
        let image = record.image.display().to_string();
        r.config.process.set_env("CAPSULE_CONTAINER", image.clone());
        r.config.process.set_env("CAPSULE_NAME", base_name(&image));
        r.config.process.set_env("CAPSULE_INSTANCE", name);
        r.config.image = r.image.clone().into();
        r.config.instance_join = true;
        r.joined = Some(record);
        return Ok(r);
    }

    let abs = std::path::absolute(&r.image)?;
    let image = abs.display().to_string();
    r.config.process.set_env("CAPSULE_CONTAINER", image.clone());
    r.config.process.set_env("CAPSULE_NAME", base_name(&image));
    r.config.image = abs;
    Ok(r)
}

/// Validate `--overlay` specs now so a bad layer fails before any mount.
pub fn set_overlays(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    r.config.writable_image = r.opts.writable;
    if r.opts.mounts.overlays.is_empty() {
        return Ok(r);
    }
    let mut set = OverlaySet::new();
    for spec in &r.opts.mounts.overlays {
        set.add(OverlayItem::from_spec_with(spec, ctx.preparer.inspector())?)?;
    }
    let dups = set.duplicates();
    if !dups.is_empty() {
        return Err(RuntimeError::DuplicateOverlay(dups).into());
    }
    r.config.overlays.clone_from(&r.opts.mounts.overlays);
    Ok(r)
}

/// An encrypted root filesystem needs its key before the starter runs.
pub fn check_encryption_key(
    mut r: Resolution,
    ctx: &Context<'_>,
) -> Result<Resolution, LaunchError> {
    if r.config.instance_join {
        return Ok(r);
    }
    if !ctx.preparer.inspector().has_encrypted_rootfs(&r.config.image)? {
        return Ok(r);
    }
    let Some(key) = r.opts.key_info.clone() else {
        return Err(LaunchError::Encryption(
            "no key was provided, cannot access encrypted container".to_owned(),
        ));
    };
    match ctx.keys.plaintext_key(&key, &r.config.image) {
        Ok(plaintext) => {
            r.config.encryption_key = Some(plaintext);
            Ok(r)
        }
        Err(e) => {
            error!("Please check you are providing the correct key for decryption");
            Err(e)
        }
    }
}

/// Turn the image into a root directory the starter can use.
pub fn prepare_image(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    if r.config.instance_join {
        return Ok(r);
    }
    let inside = ctx.host.inside_user_ns();
    let user_ns = r.config.has_namespace(NamespaceKind::User);
    if r.opts.sif_fuse && !(user_ns || inside) {
        r.warn("--sif-fuse is not supported without user namespace, ignoring.");
    }
    let fuse_requested = (r.opts.sif_fuse || ctx.conf.sif_fuse) && (user_ns || inside);

    let pctx = PrepareContext {
        inside_user_ns: inside,
        user_ns_requested: user_ns,
        tmp_sandbox_requested: r.opts.tmp_sandbox,
        writable_requested: r.opts.writable,
        fuse_requested,
        fakeroot: r.config.fakeroot,
        use_suid: r.config.use_suid,
        kernel_squashfs_allowed: ctx.conf.allow_kernel_squashfs,
        kernel_extfs_allowed: ctx.conf.allow_kernel_extfs,
        tmp_sandbox_allowed: ctx.conf.tmp_sandbox && !r.opts.no_tmp_sandbox,
        tmp_dir: r.opts.tmp_dir.clone(),
    };
    let prepared = ctx.preparer.prepare(&r.config.image, &pctx)?;
    if prepared.root != r.config.image {
        info!(
            "using {} as root filesystem of {}",
            prepared.root.display(),
            r.config.image.display()
        );
        r.config
            .process
            .set_env("CAPSULE_CONTAINER", prepared.root.display().to_string());
        r.config.image = prepared.root.clone();
    }
    r.config.cleanup = prepared.cleanup();
    Ok(r)
}

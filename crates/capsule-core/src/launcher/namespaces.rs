//! Namespaces, networking, cgroups, containment and instance mode.

use super::{Context, Resolution};
use crate::cgroups::{plan_cgroups, CgroupFacts};
use crate::config::{IdMap, NamespaceKind};
use crate::instance::validate_instance_name;
use crate::LaunchError;
use tracing::{debug, info};

const BOOT_DROP_CAPS: &str = "CAP_SYS_BOOT,CAP_SYS_RAWIO";

/// Libraries, scratch, workdir, network and hostname.
pub fn set_container_options(
    mut r: Resolution,
    _ctx: &Context<'_>,
) -> Result<Resolution, LaunchError> {
    r.config
        .libraries_path
        .extend(r.opts.contain_libs.iter().cloned());
    r.config.scratch_dirs.clone_from(&r.opts.mounts.scratch_dirs);
    r.config.work_dir.clone_from(&r.opts.work_dir);
    r.config.network.clone_from(&r.opts.network);
    r.config.network_args.clone_from(&r.opts.network_args);
    r.config.dns.clone_from(&r.opts.dns);
    r.config.net_ns_path.clone_from(&r.opts.namespaces.net_path);

    if let Some(hostname) = r.opts.hostname.clone() {
        // boot instances get a UTS namespace later in resolution
        let boot_instance = r.opts.boot && r.instance_name.is_some();
        if !r.opts.namespaces.uts && !boot_instance {
            return Err(LaunchError::InvalidOption(
                "--hostname requires the UTS namespace (--uts)".to_owned(),
            ));
        }
        r.config.hostname = Some(hostname);
    }
    Ok(r)
}

pub fn set_cgroups(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    let facts = CgroupFacts {
        uid: r.uid,
        instance: r.instance_name.is_some(),
        cgroup2_unified: ctx.host.cgroup2_unified(),
        systemd_cgroups: ctx.conf.systemd_cgroups,
    };
    let plan = plan_cgroups(facts, r.opts.cgroups_json.as_deref(), &r.host_env)?;
    r.config.cgroups_json = plan.cgroups_json;
    r.config.xdg_runtime_dir = plan.xdg_runtime_dir;
    r.config.dbus_session_bus_address = plan.dbus_session_bus_address;
    Ok(r)
}

/// `--contain`, `--containall` and `--boot` all contain; `--containall`
/// also isolates IPC and the environment. Both it and `--boot` imply a PID
/// namespace.
pub fn set_containment(mut r: Resolution, _ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    if r.opts.contained() || r.opts.boot {
        r.config.contain = true;
    }
    if r.opts.boot {
        r.opts.namespaces.pid = true;
    }
    if r.opts.contain_all {
        r.opts.namespaces.pid = true;
        r.opts.namespaces.ipc = true;
        r.opts.clean_env = true;
    }
    Ok(r)
}

pub fn set_instance(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    let Some(name) = r.instance_name.clone() else {
        return Ok(r);
    };
    validate_instance_name(&name)?;
    if ctx.registry.exists(&name) {
        return Err(LaunchError::InstanceExists(name));
    }
    r.config.process.set_env("CAPSULE_INSTANCE", name.clone());
    r.opts.namespaces.pid = true;
    r.config.instance = true;
    r.config.boot_instance = r.opts.boot;

    if r.opts.boot {
        r.opts.namespaces.uts = true;
        r.opts.namespaces.net = true;
        if r.config.hostname.is_none() {
            r.config.hostname = Some(name);
        }
        if !r.opts.keep_privs {
            r.config.drop_caps = Some(match r.config.drop_caps.take() {
                Some(caps) if !caps.is_empty() => format!("{caps},{BOOT_DROP_CAPS}"),
                _ => BOOT_DROP_CAPS.to_owned(),
            });
        }
        r.config.process.args = vec!["/sbin/init".to_owned()];
    }
    Ok(r)
}

pub fn set_namespaces(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    let ns = r.opts.namespaces.clone();

    if ns.net {
        let network = r.config.network.clone().unwrap_or_default();
        let fakeroot_net_allowed = ctx.conf.suid_install && ctx.conf.allow_setuid;
        if r.opts.fakeroot && network != "none" && !fakeroot_net_allowed {
            r.warn("fakeroot with unprivileged installation or 'allow setuid = no' could not use 'fakeroot' network, fallback to 'none' network");
            r.config.network = Some("none".to_owned());
        }
        r.config.namespaces.insert(NamespaceKind::Net);
    }
    if ns.uts {
        r.config.namespaces.insert(NamespaceKind::Uts);
    }
    if ns.pid {
        let required = r.config.instance || !r.config.fuse_mounts.is_empty();
        if ns.no_pid && !required {
            debug!("--no-pid, not creating a PID namespace");
        } else {
            r.config.namespaces.insert(NamespaceKind::Pid);
        }
    }
    if ns.ipc {
        r.config.namespaces.insert(NamespaceKind::Ipc);
    }
    if ns.user {
        r.config.namespaces.insert(NamespaceKind::User);
        if !r.opts.fakeroot {
            info!("mapping uid {} and gid {} into the user namespace", r.uid, r.gid);
            r.config.uid_mappings = vec![IdMap {
                container_id: r.uid,
                host_id: r.uid,
                size: 1,
            }];
            r.config.gid_mappings = vec![IdMap {
                container_id: r.gid,
                host_id: r.gid,
                size: 1,
            }];
        }
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Fixture;
    use super::*;
    use crate::instance::{now_rfc3339, InstanceRecord};
    use capsule_schema::LaunchOptions;
    use std::path::PathBuf;

    fn instance_res(fx: &Fixture, opts: LaunchOptions, name: &str) -> Resolution {
        let mut r = fx.res(opts);
        r.instance_name = Some(name.to_owned());
        r
    }

    #[test]
    fn hostname_needs_uts() {
        let fx = Fixture::user();
        let opts = LaunchOptions {
            hostname: Some("box".to_owned()),
            ..Default::default()
        };
        assert!(set_container_options(fx.res(opts.clone()), &fx.ctx()).is_err());

        let mut opts = opts;
        opts.namespaces.uts = true;
        let r = set_container_options(fx.res(opts), &fx.ctx()).unwrap();
        assert_eq!(r.config.hostname.as_deref(), Some("box"));
    }

    #[test]
    fn contain_libs_join_library_path() {
        let fx = Fixture::user();
        let opts = LaunchOptions {
            contain_libs: vec!["/opt/lib/libfoo.so".into()],
            network: Some("bridge".to_owned()),
            ..Default::default()
        };
        let mut r = fx.res(opts);
        r.config.libraries_path.push("/usr/lib/libnv.so".into());
        let r = set_container_options(r, &fx.ctx()).unwrap();
        assert_eq!(r.config.libraries_path.len(), 2);
        assert_eq!(r.config.network.as_deref(), Some("bridge"));
    }

    #[test]
    fn containall_implies_pid_ipc_cleanenv() {
        let fx = Fixture::user();
        let opts = LaunchOptions {
            contain_all: true,
            ..Default::default()
        };
        let r = set_containment(fx.res(opts), &fx.ctx()).unwrap();
        assert!(r.config.contain);
        assert!(r.opts.namespaces.pid && r.opts.namespaces.ipc && r.opts.clean_env);

        let opts = LaunchOptions {
            contain: true,
            ..Default::default()
        };
        let r = set_containment(fx.res(opts), &fx.ctx()).unwrap();
        assert!(r.config.contain);
        assert!(!r.opts.namespaces.pid);
    }

    #[test]
    fn boot_implies_pid_namespace() {
        let fx = Fixture::root();
        let opts = LaunchOptions {
            boot: true,
            ..Default::default()
        };
        let r = set_containment(fx.res(opts), &fx.ctx()).unwrap();
        assert!(r.config.contain);
        let r = set_namespaces(r, &fx.ctx()).unwrap();
        assert!(r.config.has_namespace(NamespaceKind::Pid));
    }

    #[test]
    fn boot_instance_accepts_hostname_without_uts() {
        let fx = Fixture::root();
        let opts = LaunchOptions {
            boot: true,
            hostname: Some("box".to_owned()),
            ..Default::default()
        };
        let r = set_container_options(instance_res(&fx, opts.clone(), "vm"), &fx.ctx()).unwrap();
        let r = set_instance(r, &fx.ctx()).unwrap();
        assert_eq!(r.config.hostname.as_deref(), Some("box"));
        assert!(r.opts.namespaces.uts);

        // outside an instance, --boot does not bring UTS with it
        assert!(set_container_options(fx.res(opts), &fx.ctx()).is_err());
    }

    #[test]
    fn instance_implies_pid_and_checks_registry() {
        let fx = Fixture::user();
        let r = set_instance(instance_res(&fx, LaunchOptions::default(), "web"), &fx.ctx()).unwrap();
        assert!(r.config.instance);
        assert!(r.opts.namespaces.pid);
        assert_eq!(r.config.process.env["CAPSULE_INSTANCE"], "web");

        let lock = fx.registry.lock().unwrap();
        let record = InstanceRecord {
            name: "web".to_owned(),
            pid: 1,
            image: PathBuf::from("/i.sif"),
            user_ns: false,
            cgroup: false,
            log_out: PathBuf::from("/o"),
            log_err: PathBuf::from("/e"),
            started_at: now_rfc3339(),
        };
        fx.registry.put(&record, &lock).unwrap();
        let err = set_instance(instance_res(&fx, LaunchOptions::default(), "web"), &fx.ctx())
            .unwrap_err();
        assert_eq!(err.to_string(), "instance web already exists");
    }

    #[test]
    fn boot_instance_runs_init() {
        let fx = Fixture::root();
        let opts = LaunchOptions {
            boot: true,
            ..Default::default()
        };
        let r = set_instance(instance_res(&fx, opts, "vm"), &fx.ctx()).unwrap();
        assert!(r.config.boot_instance);
        assert!(r.opts.namespaces.uts && r.opts.namespaces.net);
        assert_eq!(r.config.hostname.as_deref(), Some("vm"));
        assert_eq!(r.config.drop_caps.as_deref(), Some(BOOT_DROP_CAPS));
        assert_eq!(r.config.process.args, vec!["/sbin/init"]);

        let opts = LaunchOptions {
            boot: true,
            keep_privs: true,
            ..Default::default()
        };
        let r = set_instance(instance_res(&fx, opts, "vm"), &fx.ctx()).unwrap();
        assert!(r.config.drop_caps.is_none());
    }

    #[test]
    fn invalid_instance_name_is_refused() {
        let fx = Fixture::user();
        let err = set_instance(instance_res(&fx, LaunchOptions::default(), "a/b"), &fx.ctx())
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn fakeroot_network_falls_back_to_none() {
        let mut fx = Fixture::user();
        fx.conf.allow_setuid = false;
        let mut opts = LaunchOptions {
            fakeroot: true,
            ..Default::default()
        };
        opts.namespaces.net = true;
        opts.namespaces.user = true;
        let mut r = fx.res(opts);
        r.config.network = Some("bridge".to_owned());
        let r = set_namespaces(r, &fx.ctx()).unwrap();
        assert_eq!(r.config.network.as_deref(), Some("none"));
        assert!(r.config.has_namespace(NamespaceKind::Net));
        assert!(r.config.warnings[0].contains("fallback to 'none' network"));
        // fakeroot brings its own mappings
        assert!(r.config.uid_mappings.is_empty());
    }

    #[test]
    fn plain_user_namespace_maps_caller() {
        let fx = Fixture::user();
        let mut opts = LaunchOptions::default();
        opts.namespaces.user = true;
        let r = set_namespaces(fx.res(opts), &fx.ctx()).unwrap();
        assert_eq!(
            r.config.uid_mappings,
            vec![IdMap {
                container_id: 1000,
                host_id: 1000,
                size: 1
            }]
        );
        assert_eq!(r.config.gid_mappings.len(), 1);
    }

    #[test]
    fn no_pid_cannot_undo_instance_pid() {
        let fx = Fixture::user();
        let mut opts = LaunchOptions::default();
        opts.namespaces.pid = true;
        opts.namespaces.no_pid = true;
        let r = set_namespaces(fx.res(opts.clone()), &fx.ctx()).unwrap();
        assert!(!r.config.has_namespace(NamespaceKind::Pid));

        let mut r = fx.res(opts);
        r.config.instance = true;
        let r = set_namespaces(r, &fx.ctx()).unwrap();
        assert!(r.config.has_namespace(NamespaceKind::Pid));
    }

    #[test]
    fn cgroups_for_root_instance() {
        let fx = Fixture::root();
        let r = set_cgroups(instance_res(&fx, LaunchOptions::default(), "web"), &fx.ctx()).unwrap();
        assert_eq!(r.config.cgroups_json.as_deref(), Some("{}"));
        let r = set_cgroups(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert!(r.config.cgroups_json.is_none());
    }
}

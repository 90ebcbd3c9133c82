//! Who the container runs as and how the starter gets its privileges.

use super::{Context, Resolution};
use crate::config::Rlimit;
use crate::LaunchError;
use capsule_schema::get_param;
use tracing::debug;

/// Refuse privilege-raising requests from non-root callers before anything
/// else is looked at.
pub fn gate_privileges(r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    if ctx.host.uid() == 0 {
        return Ok(r);
    }
    let denied = [
        (r.opts.allow_setuid, "--allow-setuid"),
        (r.opts.keep_privs, "--keep-privs"),
        (r.opts.boot, "--boot"),
        (get_param(&r.opts.security, "uid").is_some(), "--security uid:"),
        (get_param(&r.opts.security, "gid").is_some(), "--security gid:"),
    ];
    match denied.iter().find(|(set, _)| *set) {
        Some((_, flag)) => Err(LaunchError::PrivilegeRequired((*flag).to_owned())),
        None => Ok(r),
    }
}

/// Resolve `--security uid:N` and `--security gid:N[:M...]`.
pub fn set_target_ids(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    if let Some(uid) = get_param(&r.opts.security, "uid") {
        if ctx.host.uid() != 0 {
            return Err(LaunchError::PrivilegeRequired("uid security feature".to_owned()));
        }
        let uid = uid.parse::<u32>().map_err(|_| {
            LaunchError::InvalidOption(format!("failed to parse provided UID '{uid}'"))
        })?;
        r.config.target_uid = Some(uid);
    }
    if let Some(gids) = get_param(&r.opts.security, "gid") {
        if ctx.host.uid() != 0 {
            return Err(LaunchError::PrivilegeRequired("gid security feature".to_owned()));
        }
        r.config.target_gids = gids
            .split(':')
            .map(|g| {
                g.parse::<u32>().map_err(|_| {
                    LaunchError::InvalidOption(format!("failed to parse provided GID '{g}'"))
                })
            })
            .collect::<Result<_, _>>()?;
    }
    if let Some(uid) = r.config.target_uid {
        r.uid = uid;
    }
    if let Some(&gid) = r.config.target_gids.first() {
        r.gid = gid;
    }
    Ok(r)
}

/// Decide between the setuid starter and a user namespace. The decision can
/// only ever turn the user namespace on.
pub fn set_privilege_mode(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    let uid = ctx.host.uid();
    let mut use_suid = true;

    if !ctx.conf.suid_install {
        use_suid = false;
        if !r.opts.namespaces.user && uid != 0 {
            debug!("no setuid starter installed, using a user namespace");
            r.opts.namespaces.user = true;
        }
    }

    if uid == 0 || ctx.host.inside_user_ns() || r.opts.namespaces.user || !ctx.conf.allow_setuid {
        use_suid = false;
        if uid != 0 && ctx.conf.suid_install && !ctx.conf.allow_setuid {
            debug!("'allow-setuid = false', using a user namespace");
            r.opts.namespaces.user = true;
        } else if uid == 0 && !r.opts.namespaces.user && !ctx.host.has_cap_sys_admin() {
            debug!("root without CAP_SYS_ADMIN, using a user namespace");
            r.opts.namespaces.user = true;
        }
    }

    if use_suid {
        // the setuid starter resets RLIMIT_STACK, keep the caller's
        match ctx.host.stack_rlimit() {
            Some((soft, hard)) => r.config.process.rlimits.push(Rlimit {
                kind: "RLIMIT_STACK".to_owned(),
                hard,
                soft,
            }),
            None => r.warn("can't retrieve stack size limit"),
        }
    }

    r.config.use_suid = use_suid;
    Ok(r)
}

/// Capabilities, setuid, `--no-privs`, security options and shell.
pub fn set_capabilities(mut r: Resolution, _ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    r.config.add_caps = r.opts.add_caps.clone();
    r.config.drop_caps = r.opts.drop_caps.clone();
    r.config.allow_setuid = r.opts.allow_setuid;
    r.config.keep_privs = r.opts.keep_privs;
    r.config.no_privs = r.opts.no_privs;
    r.config.security = r.opts.security.clone();
    if let Some(shell) = r.opts.shell.clone() {
        r.config
            .process
            .set_env("CAPSULE_SHELL", shell.display().to_string());
        r.config.shell = Some(shell);
    }
    Ok(r)
}

pub fn set_fakeroot(mut r: Resolution, _ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    if r.opts.fakeroot {
        r.opts.namespaces.user = true;
        r.config.fakeroot = true;
        r.config.no_setgroups = r.opts.no_setgroups;
    } else if r.opts.no_setgroups {
        r.warn("--no-setgroups only applies to --fakeroot mode");
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Fixture;
    use super::*;
    use crate::host::StaticHost;
    use capsule_schema::LaunchOptions;

    fn security(opts: &[&str]) -> LaunchOptions {
        LaunchOptions {
            security: opts.iter().map(|s| (*s).to_owned()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn gate_lets_root_through() {
        let fx = Fixture::root();
        let opts = LaunchOptions {
            allow_setuid: true,
            keep_privs: true,
            boot: true,
            ..Default::default()
        };
        assert!(gate_privileges(fx.res(opts), &fx.ctx()).is_ok());
    }

    #[test]
    fn gate_names_the_flag() {
        let fx = Fixture::user();
        let err = gate_privileges(fx.res(security(&["gid:10"])), &fx.ctx()).unwrap_err();
        assert_eq!(err.to_string(), "--security gid: requires root privileges");
        assert!(err.is_config_error());
    }

    #[test]
    fn target_ids_apply_to_effective_ids() {
        let fx = Fixture::root();
        let r = set_target_ids(fx.res(security(&["uid:1001", "gid:100:200"])), &fx.ctx()).unwrap();
        assert_eq!(r.config.target_uid, Some(1001));
        assert_eq!(r.config.target_gids, vec![100, 200]);
        assert_eq!((r.uid, r.gid), (1001, 100));
    }

    #[test]
    fn target_uid_must_parse() {
        let fx = Fixture::root();
        let err = set_target_ids(fx.res(security(&["uid:abc"])), &fx.ctx()).unwrap_err();
        assert!(err.to_string().contains("failed to parse provided UID"));
    }

    #[test]
    fn setuid_flow_captures_stack_limit() {
        let fx = Fixture::user();
        let r = set_privilege_mode(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert!(r.config.use_suid);
        assert!(!r.opts.namespaces.user);
        assert_eq!(r.config.process.rlimits[0].kind, "RLIMIT_STACK");
        assert_eq!(r.config.process.rlimits[0].soft, 8 << 20);
    }

    #[test]
    fn missing_stack_limit_is_a_warning() {
        let fx = Fixture::new(StaticHost {
            stack_rlimit: None,
            ..StaticHost::user(1000)
        });
        let r = set_privilege_mode(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert!(r.config.use_suid);
        assert_eq!(r.config.warnings, vec!["can't retrieve stack size limit"]);
    }

    #[test]
    fn no_suid_install_forces_user_namespace() {
        let mut fx = Fixture::user();
        fx.conf.suid_install = false;
        let r = set_privilege_mode(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert!(!r.config.use_suid);
        assert!(r.opts.namespaces.user);
        assert!(r.config.process.rlimits.is_empty());
    }

    #[test]
    fn setuid_disallowed_forces_user_namespace() {
        let mut fx = Fixture::user();
        fx.conf.allow_setuid = false;
        let r = set_privilege_mode(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert!(!r.config.use_suid);
        assert!(r.opts.namespaces.user);
    }

    #[test]
    fn explicit_user_namespace_skips_suid_and_stays_on() {
        let fx = Fixture::user();
        let mut opts = LaunchOptions::default();
        opts.namespaces.user = true;
        let r = set_privilege_mode(fx.res(opts), &fx.ctx()).unwrap();
        assert!(!r.config.use_suid);
        assert!(r.opts.namespaces.user);
    }

    #[test]
    fn root_with_cap_sys_admin_needs_nothing() {
        let fx = Fixture::root();
        let r = set_privilege_mode(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert!(!r.config.use_suid);
        assert!(!r.opts.namespaces.user);
    }

    #[test]
    fn inside_user_namespace_never_uses_suid() {
        let fx = Fixture::new(StaticHost {
            inside_user_ns: true,
            ..StaticHost::user(1000)
        });
        let r = set_privilege_mode(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert!(!r.config.use_suid);
        assert!(!r.opts.namespaces.user);
    }

    #[test]
    fn shell_goes_to_process_env() {
        let fx = Fixture::user();
        let opts = LaunchOptions {
            shell: Some("/bin/zsh".into()),
            drop_caps: Some("CAP_NET_RAW".to_owned()),
            ..Default::default()
        };
        let r = set_capabilities(fx.res(opts), &fx.ctx()).unwrap();
        assert_eq!(r.config.process.env["CAPSULE_SHELL"], "/bin/zsh");
        assert_eq!(r.config.drop_caps.as_deref(), Some("CAP_NET_RAW"));
    }

    #[test]
    fn no_setgroups_without_fakeroot_warns() {
        let fx = Fixture::user();
        let opts = LaunchOptions {
            no_setgroups: true,
            ..Default::default()
        };
        let r = set_fakeroot(fx.res(opts), &fx.ctx()).unwrap();
        assert!(!r.config.no_setgroups);
        assert_eq!(
            r.config.warnings,
            vec!["--no-setgroups only applies to --fakeroot mode"]
        );

        let opts = LaunchOptions {
            fakeroot: true,
            no_setgroups: true,
            ..Default::default()
        };
        let r = set_fakeroot(fx.res(opts), &fx.ctx()).unwrap();
        assert!(r.config.fakeroot && r.config.no_setgroups);
        assert!(r.opts.namespaces.user);
    }
}

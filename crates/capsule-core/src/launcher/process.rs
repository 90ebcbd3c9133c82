//! The container process: arguments, umask, environment and working dir.

use super::{Context, Resolution};
use crate::env::{container_env, is_readonly_shell_var, parse_env_file, CAPSULE_ENV_PREFIX};
use crate::LaunchError;
use std::fs;
use tracing::{debug, warn};

pub fn set_process(mut r: Resolution, _ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    if r.config.process.args.first().filter(|a| !a.is_empty()).is_none() {
        return Err(LaunchError::InvalidOption(
            "no process to run in the container".to_owned(),
        ));
    }
    if r.opts.no_eval {
        r.config.no_eval = true;
        r.config.process.set_env("CAPSULE_NO_EVAL", "1");
    }
    Ok(r)
}

pub fn set_umask(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    if r.opts.no_umask {
        debug!("--no-umask, the container starts with umask 0022");
    } else {
        r.config.umask = Some(ctx.host.umask());
    }
    Ok(r)
}

/// Merge env files and `--env`, then build the container environment.
pub fn set_env(mut r: Resolution, _ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    let cli = r.opts.env.clone();
    let mut merged = cli.clone();

    for path in r.opts.env_files.clone() {
        let content = fs::read_to_string(&path).map_err(|e| {
            LaunchError::InvalidOption(format!(
                "could not read environment file {}: {e}",
                path.display()
            ))
        })?;
        let (vars, ignored) = parse_env_file(&content);
        for line in ignored {
            r.warn(format!(
                "Ignored line {line:?} in {}: expected KEY=VALUE",
                path.display()
            ));
        }
        for (key, value) in vars {
            if is_readonly_shell_var(&key) {
                debug!("skipping readonly variable {key} from {}", path.display());
            } else if cli.contains_key(&key) {
                r.warn(format!(
                    "Ignored environment variable {key} from {}: override from --env",
                    path.display()
                ));
            } else {
                merged.insert(key, value);
            }
        }
    }

    for (key, value) in merged {
        if key.is_empty() {
            r.warn(format!("Ignored environment variable with empty name (value {value:?})"));
            continue;
        }
        if is_readonly_shell_var(&key) {
            r.warn(format!("Ignored readonly environment variable {key}"));
            continue;
        }
        r.host_env.insert(format!("{CAPSULE_ENV_PREFIX}{key}"), value);
    }

    let built = container_env(&r.host_env, r.opts.clean_env, &r.config.home_dest);
    r.config.process.env.extend(built.process);
    r.config.user_env = built.user;
    r.config.warnings.extend(built.warnings);
    Ok(r)
}

/// Engine cwd is the host cwd; the process starts in `--pwd`, else the
/// home directory for contained launches, else the host cwd.
pub fn set_cwd(mut r: Resolution, ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    let host_cwd = ctx.host.cwd();
    if host_cwd.is_none() {
        warn!("can't determine current working directory");
    }
    r.config.cwd.clone_from(&host_cwd);
    r.config.process.cwd = if let Some(pwd) = r.opts.cwd.clone() {
        Some(pwd)
    } else if r.config.contain {
        Some(r.config.home_dest.clone().into())
    } else {
        host_cwd
    };
    Ok(r)
}

pub fn set_app_name(mut r: Resolution, _ctx: &Context<'_>) -> Result<Resolution, LaunchError> {
    if let Some(app) = r.opts.app_name.clone() {
        r.config.process.set_env("CAPSULE_APPNAME", app);
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Fixture;
    use super::*;
    use crate::env::env_pairs;
    use crate::host::StaticHost;
    use capsule_schema::LaunchOptions;
    use std::path::{Path, PathBuf};

    #[test]
    fn empty_process_is_rejected() {
        let fx = Fixture::user();
        let mut r = fx.res(LaunchOptions::default());
        r.config.process.args = vec![String::new()];
        assert!(set_process(r, &fx.ctx()).is_err());
    }

    #[test]
    fn no_eval_is_flagged() {
        let fx = Fixture::user();
        let opts = LaunchOptions {
            no_eval: true,
            ..Default::default()
        };
        let r = set_process(fx.res(opts), &fx.ctx()).unwrap();
        assert!(r.config.no_eval);
        assert_eq!(r.config.process.env["CAPSULE_NO_EVAL"], "1");
    }

    #[test]
    fn umask_is_captured_unless_disabled() {
        let fx = Fixture::new(StaticHost {
            umask: 0o077,
            ..StaticHost::user(1000)
        });
        let r = set_umask(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert_eq!(r.config.umask, Some(0o077));
        let opts = LaunchOptions {
            no_umask: true,
            ..Default::default()
        };
        let r = set_umask(fx.res(opts), &fx.ctx()).unwrap();
        assert_eq!(r.config.umask, None);
    }

    #[test]
    fn cli_env_wins_over_env_file() {
        let fx = Fixture::user();
        let file = fx.dir.path().join("vars.env");
        fs::write(&file, "A=from-file\nB=file-only\nUID=0\nbogus line\n").unwrap();
        let opts = LaunchOptions {
            env: env_pairs(["A=from-cli"]),
            env_files: vec![file.clone()],
            ..Default::default()
        };
        let mut r = fx.res(opts);
        r.config.home_dest = "/home/u1000".to_owned();
        let r = set_env(r, &fx.ctx()).unwrap();

        assert_eq!(r.config.user_env["A"], "from-cli");
        assert_eq!(r.config.user_env["B"], "file-only");
        assert!(!r.config.user_env.contains_key("UID"));
        assert!(r
            .config
            .warnings
            .iter()
            .any(|w| w.contains("Ignored environment variable A") && w.contains("--env")));
        assert!(r.config.warnings.iter().any(|w| w.contains("bogus line")));
        assert_eq!(r.config.process.env["HOME"], "/home/u1000");
    }

    #[test]
    fn later_env_file_wins() {
        let fx = Fixture::user();
        let first = fx.dir.path().join("1.env");
        let second = fx.dir.path().join("2.env");
        fs::write(&first, "X=1\n").unwrap();
        fs::write(&second, "X=2\n").unwrap();
        let opts = LaunchOptions {
            env_files: vec![first, second],
            ..Default::default()
        };
        let r = set_env(fx.res(opts), &fx.ctx()).unwrap();
        assert_eq!(r.config.user_env["X"], "2");
        assert!(r.config.warnings.is_empty());
    }

    #[test]
    fn unreadable_env_file_is_an_error() {
        let fx = Fixture::user();
        let opts = LaunchOptions {
            env_files: vec![PathBuf::from("/does/not/exist.env")],
            ..Default::default()
        };
        let err = set_env(fx.res(opts), &fx.ctx()).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn host_env_forwarded_unless_clean() {
        let fx = Fixture::new(StaticHost::user(1000).with_env("EDITOR", "vi"));
        let r = set_env(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert_eq!(r.config.process.env["EDITOR"], "vi");

        let opts = LaunchOptions {
            clean_env: true,
            ..Default::default()
        };
        let r = set_env(fx.res(opts), &fx.ctx()).unwrap();
        assert!(!r.config.process.env.contains_key("EDITOR"));
        assert_eq!(r.config.process.env["LANG"], "C");
    }

    #[test]
    fn earlier_capsule_entries_survive() {
        let fx = Fixture::user();
        let mut r = fx.res(LaunchOptions::default());
        r.config.process.set_env("CAPSULE_NAME", "img");
        let r = set_env(r, &fx.ctx()).unwrap();
        assert_eq!(r.config.process.env["CAPSULE_NAME"], "img");
    }

    #[test]
    fn cwd_precedence() {
        let fx = Fixture::user();
        let r = set_cwd(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert_eq!(r.config.process.cwd.as_deref(), Some(Path::new("/work")));
        assert_eq!(r.config.cwd.as_deref(), Some(Path::new("/work")));

        let mut r = fx.res(LaunchOptions::default());
        r.config.contain = true;
        r.config.home_dest = "/home/u1000".to_owned();
        let r = set_cwd(r, &fx.ctx()).unwrap();
        assert_eq!(r.config.process.cwd.as_deref(), Some(Path::new("/home/u1000")));

        let opts = LaunchOptions {
            cwd: Some("/data".into()),
            ..Default::default()
        };
        let mut r = fx.res(opts);
        r.config.contain = true;
        let r = set_cwd(r, &fx.ctx()).unwrap();
        assert_eq!(r.config.process.cwd.as_deref(), Some(Path::new("/data")));
    }

    #[test]
    fn app_name_only_when_given() {
        let fx = Fixture::user();
        let r = set_app_name(fx.res(LaunchOptions::default()), &fx.ctx()).unwrap();
        assert!(!r.config.process.env.contains_key("CAPSULE_APPNAME"));
        let opts = LaunchOptions {
            app_name: Some("web".to_owned()),
            ..Default::default()
        };
        let r = set_app_name(fx.res(opts), &fx.ctx()).unwrap();
        assert_eq!(r.config.process.env["CAPSULE_APPNAME"], "web");
    }
}

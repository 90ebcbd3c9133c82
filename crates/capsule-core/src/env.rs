//! Container environment assembly.
//!
//! The host environment is forwarded into the container process unless
//! `--cleanenv` is set. `CAPSULE_*` variables belong to the launcher and are
//! never forwarded; `CAPSULEENV_<KEY>` variables become `<KEY>` inside the
//! container and win over a host variable of the same name.

use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const CAPSULE_PREFIX: &str = "CAPSULE_";
pub const CAPSULE_ENV_PREFIX: &str = "CAPSULEENV_";

/// Forwarded even with `--cleanenv`.
const ALWAYS_PASS: &[&str] = &[
    "TERM",
    "http_proxy",
    "HTTP_PROXY",
    "https_proxy",
    "HTTPS_PROXY",
    "no_proxy",
    "NO_PROXY",
    "all_proxy",
    "ALL_PROXY",
    "ftp_proxy",
    "FTP_PROXY",
];

/// Never forwarded from the host. The flag says whether `CAPSULEENV_<KEY>`
/// may still set it.
const ALWAYS_OMIT: &[(&str, bool)] = &[
    ("HOME", false),
    ("PATH", false),
    ("CAPSULE_SHELL", false),
    ("CAPSULE_APPNAME", false),
    ("LD_LIBRARY_PATH", true),
];

fn omitted(key: &str) -> Option<bool> {
    ALWAYS_OMIT
        .iter()
        .find_map(|(k, permitted)| (*k == key).then_some(*permitted))
}

/// Whether host variable `key` reaches the container process.
pub fn add_host_env(key: &str, clean_env: bool) -> bool {
    if ALWAYS_PASS.contains(&key) {
        return true;
    }
    !(omitted(key).is_some() || clean_env)
}

/// The two environment sets handed to the starter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerEnv {
    /// Process environment at container start.
    pub process: BTreeMap<String, String>,
    /// Values injected after the container's own environment scripts run.
    pub user: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

pub fn container_env(
    host_env: &BTreeMap<String, String>,
    clean_env: bool,
    home_dest: &str,
) -> ContainerEnv {
    let mut out = ContainerEnv::default();
    if clean_env {
        out.process.insert("LANG".to_owned(), "C".to_owned());
    }

    for (key, value) in host_env {
        let Some(inner) = key.strip_prefix(CAPSULE_ENV_PREFIX) else {
            continue;
        };
        match inner {
            "" => {}
            "PREPEND_PATH" => {
                out.user
                    .insert("CAPSULE_USER_PREPEND_PATH".to_owned(), value.clone());
            }
            "APPEND_PATH" => {
                out.user
                    .insert("CAPSULE_USER_APPEND_PATH".to_owned(), value.clone());
            }
            "PATH" => {
                out.user.insert("CAPSULE_USER_PATH".to_owned(), value.clone());
            }
            _ if omitted(inner) == Some(false) => {
                let msg = format!("Overriding {inner} environment variable with {key} is not permitted");
                warn!("{msg}");
                out.warnings.push(msg);
            }
            _ => {
                debug!("forwarding {key} as {inner} environment variable");
                out.user.insert(inner.to_owned(), value.clone());
            }
        }
    }

    for (key, value) in host_env {
        if key.starts_with(CAPSULE_PREFIX) || key.starts_with(CAPSULE_ENV_PREFIX) {
            continue;
        }
        if out.user.contains_key(key) {
            debug!("skipping {key} environment variable, overridden by {CAPSULE_ENV_PREFIX}{key}");
        } else if add_host_env(key, clean_env) {
            out.process.insert(key.clone(), value.clone());
        }
    }

    out.process.insert("HOME".to_owned(), home_dest.to_owned());
    out.process.insert("PATH".to_owned(), DEFAULT_PATH.to_owned());
    out
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(q).and_then(|v| v.strip_suffix(q)) {
            return inner;
        }
    }
    value
}

/// Parse `KEY=VALUE` lines of an `--env-file`. Blank lines, comments and an
/// `export ` prefix are accepted; lines without `=` are reported back.
pub fn parse_env_file(content: &str) -> (Vec<(String, String)>, Vec<String>) {
    let mut vars = Vec::new();
    let mut ignored = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        match line.split_once('=') {
            Some((key, value)) => vars.push((key.trim().to_owned(), unquote(value.trim()).to_owned())),
            None => ignored.push(line.to_owned()),
        }
    }
    (vars, ignored)
}

/// `KEY=VALUE` pairs as a map, later entries winning.
pub fn env_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

/// Bash read-only variables an env file must not try to set.
pub fn is_readonly_shell_var(key: &str) -> bool {
    matches!(key, "UID" | "GID")
}

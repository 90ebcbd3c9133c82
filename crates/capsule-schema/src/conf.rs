use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONF_PATH: &str = "/etc/capsule/capsule.toml";

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid bind specification '{spec}': {reason}")]
    InvalidBind { spec: String, reason: String },
    #[error("invalid mount specification '{spec}': {reason}")]
    InvalidMount { spec: String, reason: String },
    #[error("invalid security option '{0}', expected '<name>:<value>'")]
    InvalidSecurityOpt(String),
}

/// System policy, as set by the administrator in `capsule.toml`.
///
/// Every key is optional. Missing keys fall back to the values in
/// `Default`, which match a stock setuid installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RuntimeConf {
    /// Whether unprivileged users may use the setuid starter.
    pub allow_setuid: bool,
    /// Whether the installation ships a setuid starter at all.
    pub suid_install: bool,
    pub allow_kernel_squashfs: bool,
    pub allow_kernel_extfs: bool,
    /// Whether images may be extracted into temporary sandbox directories.
    pub tmp_sandbox: bool,
    pub sif_fuse: bool,
    pub systemd_cgroups: bool,
    pub always_use_nv: bool,
    pub use_nvidia_container_cli: bool,
    pub always_use_rocm: bool,
    pub enable_fusemount: bool,
    pub bind_path: Vec<String>,
    pub nvliblist: PathBuf,
    pub rocmliblist: PathBuf,
    pub unsquashfs_path: Option<PathBuf>,
    pub starter_dir: PathBuf,
    pub instance_dir: Option<PathBuf>,
}

impl Default for RuntimeConf {
    fn default() -> Self {
        Self {
            allow_setuid: true,
            suid_install: true,
            allow_kernel_squashfs: true,
            allow_kernel_extfs: true,
            tmp_sandbox: true,
            sif_fuse: false,
            systemd_cgroups: true,
            always_use_nv: false,
            use_nvidia_container_cli: false,
            always_use_rocm: false,
            enable_fusemount: true,
            bind_path: vec!["/etc/localtime".to_owned(), "/etc/hosts".to_owned()],
            nvliblist: PathBuf::from("/etc/capsule/nvliblist.conf"),
            rocmliblist: PathBuf::from("/etc/capsule/rocmliblist.conf"),
            unsquashfs_path: None,
            starter_dir: PathBuf::from("/usr/libexec/capsule/bin"),
            instance_dir: None,
        }
    }
}

pub fn parse_conf_str(input: &str) -> Result<RuntimeConf, ConfError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_conf_file(path: impl AsRef<Path>) -> Result<RuntimeConf, ConfError> {
    let content = fs::read_to_string(path)?;
    parse_conf_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let conf = parse_conf_str("").unwrap();
        assert_eq!(conf, RuntimeConf::default());
        assert!(conf.allow_setuid);
        assert!(conf.tmp_sandbox);
        assert!(!conf.sif_fuse);
    }

    #[test]
    fn kebab_case_keys_override_defaults() {
        let conf = parse_conf_str(
            r#"
allow-setuid = false
allow-kernel-squashfs = false
tmp-sandbox = false
use-nvidia-container-cli = true
bind-path = ["/etc/hosts"]
starter-dir = "/opt/capsule/bin"
"#,
        )
        .unwrap();
        assert!(!conf.allow_setuid);
        assert!(!conf.allow_kernel_squashfs);
        assert!(!conf.tmp_sandbox);
        assert!(conf.use_nvidia_container_cli);
        assert_eq!(conf.bind_path, vec!["/etc/hosts".to_owned()]);
        assert_eq!(conf.starter_dir, PathBuf::from("/opt/capsule/bin"));
        // untouched keys keep their defaults
        assert!(conf.allow_kernel_extfs);
    }

    #[test]
    fn unknown_keys_rejected() {
        let result = parse_conf_str("allow-everything = true\n");
        assert!(matches!(result, Err(ConfError::ParseToml(_))));
    }

    #[test]
    fn wrong_type_rejected() {
        assert!(parse_conf_str("allow-setuid = \"maybe\"\n").is_err());
    }

    #[test]
    fn parse_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capsule.toml");
        fs::write(&path, "sif-fuse = true\n").unwrap();
        let conf = parse_conf_file(&path).unwrap();
        assert!(conf.sif_fuse);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = parse_conf_file(dir.path().join("nope.toml"));
        assert!(matches!(result, Err(ConfError::Io(_))));
    }
}

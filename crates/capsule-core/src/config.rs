//! The resolved launch configuration handed to the starter.
//!
//! `LaunchConfig` is the engine side (namespaces, mounts, privileges, image)
//! and `ProcessSpec` describes the process started inside the container. Both
//! are serialized to JSON for the starter.

use capsule_runtime::HostCleanup;
use capsule_schema::BindPath;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    User,
    Uts,
    Pid,
    Ipc,
    Net,
}

/// One line of a uid or gid map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    pub kind: String,
    pub hard: u64,
    pub soft: u64,
}

/// System mounts disabled with `--no-mount`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoMount {
    pub proc: bool,
    pub sys: bool,
    pub dev: bool,
    pub devpts: bool,
    pub home: bool,
    pub tmp: bool,
    pub hostfs: bool,
    pub cwd: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuMode {
    #[default]
    None,
    /// Bind the libraries and binaries listed in `nvliblist.conf`.
    NvLegacy,
    /// Let `nvidia-container-cli` set the container up.
    NvCcli,
    Rocm,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,
}

impl ProcessSpec {
    pub fn set_env(&mut self, key: &str, value: impl Into<String>) {
        self.env.insert(key.to_owned(), value.into());
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Root image, or the prepared directory that replaced it.
    pub image: PathBuf,
    pub instance: bool,
    pub instance_join: bool,
    pub boot_instance: bool,
    pub process: ProcessSpec,
    /// `CAPSULEENV_*`, `--env` and `--env-file` values, applied in the
    /// container after its own environment is sourced.
    pub user_env: BTreeMap<String, String>,
    pub no_eval: bool,

    /// Umask to restore in the container, unless `--no-umask`.
    pub umask: Option<u32>,
    pub target_uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_gids: Vec<u32>,
    pub namespaces: BTreeSet<NamespaceKind>,
    pub net_ns_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMap>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMap>,

    pub binds: Vec<BindPath>,
    pub data_binds: Vec<BindPath>,
    pub fuse_mounts: Vec<String>,
    pub overlays: Vec<String>,
    pub writable_image: bool,
    pub writable_tmpfs: bool,
    pub no_mount: NoMount,
    /// `bind-path` entries to skip; `*` skips all of them.
    pub skip_binds: Vec<String>,
    pub scratch_dirs: Vec<String>,
    pub work_dir: Option<PathBuf>,

    pub custom_home: bool,
    pub no_home: bool,
    pub home_source: String,
    pub home_dest: String,

    pub gpu: GpuMode,
    /// `NVIDIA_*` variables turned into `nvidia-container-cli` options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nvccli_env: Vec<String>,
    pub libraries_path: Vec<PathBuf>,
    pub files_path: Vec<String>,

    pub add_caps: Option<String>,
    pub drop_caps: Option<String>,
    pub allow_setuid: bool,
    pub keep_privs: bool,
    pub no_privs: bool,
    pub security: Vec<String>,
    pub fakeroot: bool,
    pub no_setgroups: bool,
    pub contain: bool,
    pub shell: Option<PathBuf>,

    pub hostname: Option<String>,
    pub network: Option<String>,
    pub network_args: Vec<String>,
    pub dns: Option<String>,

    pub cgroups_json: Option<String>,
    pub xdg_runtime_dir: Option<String>,
    pub dbus_session_bus_address: Option<String>,

    /// Plaintext key for an encrypted root filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<Vec<u8>>,
    /// Host working directory at launch.
    pub cwd: Option<PathBuf>,
    /// Whether the setuid starter runs the container.
    pub use_suid: bool,
    /// FUSE mount and temporary directory to remove on the host.
    pub cleanup: HostCleanup,

    /// Every warning emitted while resolving this configuration.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl LaunchConfig {
    pub fn has_namespace(&self, ns: NamespaceKind) -> bool {
        self.namespaces.contains(&ns)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_serialize_lowercase_and_sorted() {
        let mut cfg = LaunchConfig::default();
        cfg.namespaces.insert(NamespaceKind::Pid);
        cfg.namespaces.insert(NamespaceKind::User);
        let json = cfg.to_json().unwrap();
        assert!(json.contains(r#""namespaces":["user","pid"]"#), "{json}");
    }

    #[test]
    fn warnings_and_empty_key_are_not_serialized() {
        let cfg = LaunchConfig {
            warnings: vec!["w".to_owned()],
            ..Default::default()
        };
        let json = cfg.to_json().unwrap();
        assert!(!json.contains("warnings"));
        assert!(!json.contains("encryption_key"));
        let back: LaunchConfig = serde_json::from_str(&json).unwrap();
        assert!(back.warnings.is_empty());
    }

    #[test]
    fn gpu_mode_names() {
        assert_eq!(serde_json::to_string(&GpuMode::NvCcli).unwrap(), "\"nv-ccli\"");
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Namespaces explicitly requested by the user. The mount namespace is
/// always used and has no flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
    pub user: bool,
    pub uts: bool,
    pub pid: bool,
    pub ipc: bool,
    pub net: bool,
    /// Disable the PID namespace implied by `--contain`/`--boot`/instances.
    pub no_pid: bool,
    /// Join an existing network namespace instead of creating one.
    pub net_path: Option<PathBuf>,
}

/// Raw, unparsed mount requests as given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpecs {
    /// `--bind src[:dst[:opts]]` entries, each possibly comma separated.
    pub binds: Vec<String>,
    /// `--mount type=bind,...` entries.
    pub mounts: Vec<String>,
    /// `--data image:dest` entries.
    pub data_binds: Vec<String>,
    /// `--fusemount <type>:<command> <mountpoint>` entries.
    pub fuse_mounts: Vec<String>,
    /// `--overlay path[:ro]` entries, in precedence order.
    pub overlays: Vec<String>,
    /// `--no-mount` names or absolute paths.
    pub no_mount: Vec<String>,
    pub scratch_dirs: Vec<String>,
}

/// Source of the plaintext key for an encrypted root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum KeyInfo {
    Passphrase(String),
    PemFile(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuRequest {
    #[default]
    None,
    Nvidia,
    Rocm,
}

/// Everything a user can ask of a single launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchOptions {
    pub writable: bool,
    pub writable_tmpfs: bool,
    pub mounts: MountSpecs,
    pub work_dir: Option<PathBuf>,
    /// `--home src[:dst]`.
    pub home: Option<String>,
    pub no_home: bool,

    pub nvidia: bool,
    pub nvccli: bool,
    pub no_nvidia: bool,
    pub rocm: bool,
    pub no_rocm: bool,
    pub contain_libs: Vec<PathBuf>,

    pub env: BTreeMap<String, String>,
    pub env_files: Vec<PathBuf>,
    pub clean_env: bool,
    pub no_eval: bool,

    pub namespaces: Namespaces,
    pub network: Option<String>,
    pub network_args: Vec<String>,
    pub hostname: Option<String>,
    pub dns: Option<String>,

    pub add_caps: Option<String>,
    pub drop_caps: Option<String>,
    pub allow_setuid: bool,
    pub keep_privs: bool,
    pub no_privs: bool,
    pub security: Vec<String>,
    pub no_umask: bool,
    pub cgroups_json: Option<String>,

    pub shell: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub fakeroot: bool,
    pub no_setgroups: bool,
    pub boot: bool,
    pub contain: bool,
    pub contain_all: bool,
    pub app_name: Option<String>,
    pub key_info: Option<KeyInfo>,

    pub sif_fuse: bool,
    pub tmp_sandbox: bool,
    pub no_tmp_sandbox: bool,
    pub tmp_dir: Option<PathBuf>,
}

impl LaunchOptions {
    /// `--containall` implies `--contain`, `--cleanenv`, `--ipc` and `--pid`.
    pub fn contained(&self) -> bool {
        self.contain || self.contain_all
    }

    pub fn gpu_request(&self) -> GpuRequest {
        if self.nvidia || self.nvccli {
            GpuRequest::Nvidia
        } else if self.rocm {
            GpuRequest::Rocm
        } else {
            GpuRequest::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_request_nothing() {
        let opts = LaunchOptions::default();
        assert!(!opts.writable);
        assert!(!opts.contained());
        assert_eq!(opts.gpu_request(), GpuRequest::None);
        assert!(opts.mounts.overlays.is_empty());
    }

    #[test]
    fn nvccli_counts_as_nvidia() {
        let opts = LaunchOptions {
            nvccli: true,
            ..Default::default()
        };
        assert_eq!(opts.gpu_request(), GpuRequest::Nvidia);
    }

    #[test]
    fn key_info_serializes_tagged() {
        let k = KeyInfo::PemFile(PathBuf::from("/k.pem"));
        let json = serde_json::to_string(&k).unwrap();
        assert!(json.contains("pem-file"));
        let back: KeyInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, k);
    }
}

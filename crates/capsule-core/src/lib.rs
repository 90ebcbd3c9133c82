//! Launch orchestration for capsule.
//!
//! This crate turns user `LaunchOptions` and the system `RuntimeConf` into a
//! single `LaunchConfig` for the starter. Resolution runs as an ordered
//! pipeline (`LaunchConfigBuilder`) over facts about the host (`HostContext`),
//! ending with root image preparation. It also owns the instance registry and
//! the `StarterInvoker` that hands the configuration to the starter binary.

pub mod cgroups;
pub mod config;
pub mod env;
pub mod gpu;
pub mod host;
pub mod instance;
pub mod keys;
pub mod launcher;
pub mod starter;

pub use config::{GpuMode, IdMap, LaunchConfig, NamespaceKind, NoMount, ProcessSpec, Rlimit};
pub use host::{HostContext, StaticHost, SystemHost};
pub use instance::{InstanceRecord, InstanceRegistry, RegistryLock};
pub use keys::{KeyProvider, PassphraseKeyProvider};
pub use launcher::{LaunchConfigBuilder, Resolution};
pub use starter::{BinaryStarter, Starter, StarterInvoker, StarterOptions};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("configuration error: {0}")]
    Conf(#[from] capsule_schema::ConfError),
    #[error("runtime error: {0}")]
    Runtime(#[from] capsule_runtime::RuntimeError),
    #[error("{0} requires root privileges")]
    PrivilegeRequired(String),
    #[error("{0}")]
    InvalidOption(String),
    #[error("GPU configuration: {0}")]
    Gpu(String),
    #[error("container encryption: {0}")]
    Encryption(String),
    #[error("instance {0} already exists")]
    InstanceExists(String),
    #[error("no instance found with name {0}")]
    InstanceNotFound(String),
    #[error("instance error: {0}")]
    Instance(String),
    #[error("starter error: {0}")]
    Starter(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LaunchError {
    /// Bad flag combinations and missing privileges, detected before any
    /// side effect.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Conf(_)
                | Self::PrivilegeRequired(_)
                | Self::InvalidOption(_)
                | Self::Gpu(_)
                | Self::Encryption(_)
        )
    }

    pub fn is_runtime_error(&self) -> bool {
        matches!(self, Self::Runtime(_))
    }
}

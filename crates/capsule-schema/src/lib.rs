//! Configuration and option schema for capsule.
//!
//! This crate is the data layer of the launcher: the system policy file
//! (`RuntimeConf`, parsed from TOML), the user-facing launch options
//! (`LaunchOptions`), bind / `--mount` specification parsing (`BindPath`) and
//! `--security` option lookup. Nothing in here touches the host.

pub mod bind;
pub mod conf;
pub mod options;
pub mod security;

pub use bind::{parse_bind_paths, parse_data_bind, parse_mount_string, BindOption, BindPath};
pub use conf::{parse_conf_file, parse_conf_str, ConfError, RuntimeConf, DEFAULT_CONF_PATH};
pub use options::{GpuRequest, KeyInfo, LaunchOptions, MountSpecs, Namespaces};
pub use security::{get_param, SecurityOpt};

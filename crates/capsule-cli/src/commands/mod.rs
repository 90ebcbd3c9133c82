pub mod completions;
pub mod doctor;
pub mod instance;
pub mod launch;

use capsule_core::{HostContext, InstanceRegistry, LaunchError, SystemHost};
use capsule_schema::{ConfError, RuntimeConf};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_RUNTIME_ERROR: u8 = 3;

/// An error message and the exit code it maps to.
#[derive(Debug)]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

impl Failure {
    pub fn config(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_CONFIG_ERROR,
            message: message.into(),
        }
    }
}

impl From<LaunchError> for Failure {
    fn from(e: LaunchError) -> Self {
        let code = if e.is_config_error() {
            EXIT_CONFIG_ERROR
        } else if e.is_runtime_error() {
            EXIT_RUNTIME_ERROR
        } else {
            EXIT_FAILURE
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<ConfError> for Failure {
    fn from(e: ConfError) -> Self {
        Self::config(e.to_string())
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self {
            code: EXIT_FAILURE,
            message,
        }
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "running" => Style::new().green().apply_to(state).to_string(),
        "stale" => Style::new().yellow().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

/// The instance registry configured for the invoking user.
pub fn registry(conf: &RuntimeConf) -> InstanceRegistry {
    InstanceRegistry::new(InstanceRegistry::default_dir(
        conf.instance_dir.as_deref(),
        &SystemHost.home_dir(),
    ))
}

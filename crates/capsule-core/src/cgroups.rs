//! Whether a launch gets a cgroup, and with which resource limits.

use crate::LaunchError;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Resource limits applied to an instance cgroup created only for stats.
pub const EMPTY_CGROUP_CONFIG: &str = "{}";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupPlan {
    pub cgroups_json: Option<String>,
    pub xdg_runtime_dir: Option<String>,
    pub dbus_session_bus_address: Option<String>,
    /// Why an instance runs without a cgroup.
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CgroupFacts {
    pub uid: u32,
    pub instance: bool,
    pub cgroup2_unified: bool,
    pub systemd_cgroups: bool,
}

pub fn plan_cgroups(
    facts: CgroupFacts,
    explicit_json: Option<&str>,
    host_env: &BTreeMap<String, String>,
) -> Result<CgroupPlan, LaunchError> {
    let mut plan = CgroupPlan::default();
    // non-root talks to the systemd user instance for cgroup operations
    if facts.uid != 0 {
        debug!("recording rootless XDG_RUNTIME_DIR / DBUS_SESSION_BUS_ADDRESS");
        plan.xdg_runtime_dir = host_env.get("XDG_RUNTIME_DIR").cloned();
        plan.dbus_session_bus_address = host_env.get("DBUS_SESSION_BUS_ADDRESS").cloned();
    }

    if let Some(json) = explicit_json {
        serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(json).map_err(|e| {
            LaunchError::InvalidOption(format!("cgroups configuration is not a JSON object: {e}"))
        })?;
        plan.cgroups_json = Some(json.to_owned());
        return Ok(plan);
    }

    if !facts.instance {
        return Ok(plan);
    }

    let use_cgroup = facts.uid == 0 || (facts.cgroup2_unified && facts.systemd_cgroups);
    if use_cgroup {
        plan.cgroups_json = Some(EMPTY_CGROUP_CONFIG.to_owned());
    } else {
        let note =
            "Instance stats will not be available - requires cgroups v2 with systemd as manager.";
        info!("{note}");
        plan.note = Some(note.to_owned());
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(uid: u32, instance: bool, unified: bool, systemd: bool) -> CgroupFacts {
        CgroupFacts {
            uid,
            instance,
            cgroup2_unified: unified,
            systemd_cgroups: systemd,
        }
    }

    #[test]
    fn plain_launch_gets_no_cgroup() {
        let plan = plan_cgroups(facts(0, false, true, true), None, &BTreeMap::new()).unwrap();
        assert!(plan.cgroups_json.is_none());
    }

    #[test]
    fn root_instance_always_gets_cgroup() {
        let plan = plan_cgroups(facts(0, true, false, false), None, &BTreeMap::new()).unwrap();
        assert_eq!(plan.cgroups_json.as_deref(), Some(EMPTY_CGROUP_CONFIG));
        assert!(plan.xdg_runtime_dir.is_none());
    }

    #[test]
    fn user_instance_needs_unified_systemd() {
        let env = BTreeMap::from([("XDG_RUNTIME_DIR".to_owned(), "/run/user/1000".to_owned())]);
        let with = plan_cgroups(facts(1000, true, true, true), None, &env).unwrap();
        assert!(with.cgroups_json.is_some());
        assert_eq!(with.xdg_runtime_dir.as_deref(), Some("/run/user/1000"));

        let without = plan_cgroups(facts(1000, true, false, true), None, &env).unwrap();
        assert!(without.cgroups_json.is_none());
        assert!(without.note.is_some());
    }

    #[test]
    fn explicit_json_is_validated_and_kept() {
        let json = r#"{"memory":{"limit":1024}}"#;
        let plan = plan_cgroups(facts(1000, false, false, false), Some(json), &BTreeMap::new())
            .unwrap();
        assert_eq!(plan.cgroups_json.as_deref(), Some(json));
        let err = plan_cgroups(facts(0, false, true, true), Some("[1]"), &BTreeMap::new())
            .unwrap_err();
        assert!(err.is_config_error());
    }
}

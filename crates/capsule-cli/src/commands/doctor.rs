use super::{Failure, EXIT_FAILURE, EXIT_SUCCESS};
use capsule_runtime::probe;
use capsule_runtime::{check_launch_prereqs, format_missing, KernelProbe, OverlaySupport};
use capsule_schema::{parse_conf_file, RuntimeConf};
use std::path::Path;

pub fn run(conf_path: &Path, json_output: bool) -> Result<u8, Failure> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let conf = check_conf(conf_path, &mut checks, &mut all_pass);
    if let Some(conf) = &conf {
        check_starters(conf, &mut checks, &mut all_pass);
    }
    check_prereqs(&mut checks);
    check_kernel(&mut checks);

    print_results(&checks, all_pass, json_output)
}

fn check_conf(path: &Path, checks: &mut Vec<Check>, all_pass: &mut bool) -> Option<RuntimeConf> {
    if !path.exists() {
        checks.push(Check::info(
            "config",
            &format!("{} not found, built-in defaults apply", path.display()),
        ));
        return Some(RuntimeConf::default());
    }
    match parse_conf_file(path) {
        Ok(conf) => {
            checks.push(Check::pass(
                "config",
                &format!("Configuration {} is valid", path.display()),
            ));
            Some(conf)
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("config", &format!("Configuration error: {e}")));
            None
        }
    }
}

fn check_starters(conf: &RuntimeConf, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let mut wanted = vec!["starter"];
    if conf.suid_install {
        wanted.push("starter-suid");
    }
    for name in wanted {
        let path = conf.starter_dir.join(name);
        if path.is_file() {
            checks.push(Check::pass(name, &format!("{} present", path.display())));
        } else {
            *all_pass = false;
            checks.push(Check::fail(name, &format!("{} is missing", path.display())));
        }
    }
}

fn check_prereqs(checks: &mut Vec<Check>) {
    let missing = check_launch_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass("launch_tools", "Optional launch tools found"));
    } else {
        // only unprivileged fallbacks need them
        checks.push(Check::warn("launch_tools", &format_missing(&missing)));
    }
}

fn check_kernel(checks: &mut Vec<Check>) {
    let overlay = KernelProbe::new();
    if overlay.kernel_overlay_usable() {
        checks.push(Check::pass(
            "kernel_overlay",
            "Kernel overlay mounts are usable",
        ));
    } else {
        checks.push(Check::warn(
            "kernel_overlay",
            "Kernel refuses unprivileged overlays, fuse-overlayfs will be used",
        ));
    }

    if probe::cgroup2_unified() {
        checks.push(Check::pass("cgroups", "Unified cgroup v2 hierarchy mounted"));
    } else {
        checks.push(Check::warn(
            "cgroups",
            "cgroup v2 not detected, --apply-cgroups may not work",
        ));
    }

    if probe::inside_user_namespace(std::process::id()) {
        checks.push(Check::info(
            "user_namespace",
            "Running inside a user namespace, the setuid starter is unavailable",
        ));
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, Failure> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Capsule Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: String,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &str, status: &'static str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

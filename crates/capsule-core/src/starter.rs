//! Handing a resolved `LaunchConfig` to the starter.
//!
//! The configuration is serialized to a private file whose path reaches the
//! starter through `CAPSULE_ENGINE_CONFIG`. Starter options travel as
//! `CAPSULE_STARTER_*` flags. Interactive launches replace the current
//! process; instances run the starter in the background with its output
//! going to the instance log files.

use crate::config::{LaunchConfig, NamespaceKind};
use crate::instance::{now_rfc3339, InstanceRecord, InstanceRegistry};
use crate::LaunchError;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const ENGINE_CONFIG_ENV: &str = "CAPSULE_ENGINE_CONFIG";

/// How long to wait for an instance to report early errors.
const INSTANCE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StarterOptions {
    pub use_suid: bool,
    pub load_overlay_module: bool,
    /// Run the host cleanup hook once the container exits.
    pub cleanup_host: bool,
    /// Run the host cleanup hook once the container has started.
    pub post_start_host: bool,
}

impl StarterOptions {
    pub fn for_config(config: &LaunchConfig, suid_install: bool) -> Self {
        Self {
            use_suid: config.use_suid,
            load_overlay_module: !config.has_namespace(NamespaceKind::User) && suid_install,
            cleanup_host: !config.cleanup.is_empty(),
            post_start_host: config.cleanup.image_fuse.is_some(),
        }
    }

    pub fn env_flags(&self) -> [(&'static str, &'static str); 4] {
        let flag = |b: bool| if b { "1" } else { "0" };
        [
            ("CAPSULE_STARTER_USE_SUID", flag(self.use_suid)),
            ("CAPSULE_STARTER_LOAD_OVERLAY", flag(self.load_overlay_module)),
            ("CAPSULE_STARTER_CLEANUP_HOST", flag(self.cleanup_host)),
            ("CAPSULE_STARTER_POST_START_HOST", flag(self.post_start_host)),
        ]
    }
}

pub trait Starter {
    /// Replace the current process with the starter. Only returns on failure
    /// (or, for starters that do not exec, once the container is done).
    fn exec(&self, name: &str, config: &LaunchConfig, opts: &StarterOptions) -> Result<(), LaunchError>;

    /// Start the starter in the background and return its pid.
    fn spawn(
        &self,
        name: &str,
        config: &LaunchConfig,
        opts: &StarterOptions,
        stdout: File,
        stderr: File,
    ) -> Result<u32, LaunchError>;
}

/// Runs `starter` / `starter-suid` from a directory.
#[derive(Debug, Clone)]
pub struct BinaryStarter {
    dir: PathBuf,
}

impl BinaryStarter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn binary(&self, use_suid: bool) -> PathBuf {
        self.dir
            .join(if use_suid { "starter-suid" } else { "starter" })
    }

    /// Write `config` to a 0600 temp file that outlives this process.
    pub fn write_config(config: &LaunchConfig) -> Result<PathBuf, LaunchError> {
        let mut file = tempfile::Builder::new()
            .prefix("capsule-engine-")
            .suffix(".json")
            .tempfile()?;
        file.write_all(config.to_json()?.as_bytes())?;
        file.as_file().sync_all()?;
        file.into_temp_path()
            .keep()
            .map_err(|e| LaunchError::Io(e.error))
    }

    fn command(&self, name: &str, config_path: &Path, opts: &StarterOptions) -> Result<Command, LaunchError> {
        let bin = self.binary(opts.use_suid);
        if !bin.is_file() {
            return Err(LaunchError::Starter(format!(
                "starter binary {} not found",
                bin.display()
            )));
        }
        let mut cmd = Command::new(&bin);
        cmd.arg0(name).env(ENGINE_CONFIG_ENV, config_path);
        for (k, v) in opts.env_flags() {
            cmd.env(k, v);
        }
        Ok(cmd)
    }
}

impl Starter for BinaryStarter {
    fn exec(&self, name: &str, config: &LaunchConfig, opts: &StarterOptions) -> Result<(), LaunchError> {
        let config_path = Self::write_config(config)?;
        let err = match self.command(name, &config_path, opts) {
            Ok(mut cmd) => {
                debug!("executing {}", self.binary(opts.use_suid).display());
                LaunchError::Starter(format!("exec failed: {}", cmd.exec()))
            }
            Err(e) => e,
        };
        let _ = fs::remove_file(&config_path);
        Err(err)
    }

    fn spawn(
        &self,
        name: &str,
        config: &LaunchConfig,
        opts: &StarterOptions,
        stdout: File,
        stderr: File,
    ) -> Result<u32, LaunchError> {
        let config_path = Self::write_config(config)?;
        let spawned = self.command(name, &config_path, opts).and_then(|mut cmd| {
            cmd.stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr)
                .spawn()
                .map_err(|e| LaunchError::Starter(format!("could not start starter: {e}")))
        });
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                let _ = fs::remove_file(&config_path);
                return Err(e);
            }
        };
        let pid = child.id();
        thread::sleep(INSTANCE_GRACE);
        if let Some(status) = child.try_wait()? {
            if !status.success() {
                let _ = fs::remove_file(&config_path);
                return Err(LaunchError::Starter(format!("starter exited with {status}")));
            }
        }
        Ok(pid)
    }
}

/// Outcome of starting an instance.
#[derive(Debug, Clone)]
pub struct InstanceStart {
    pub record: InstanceRecord,
    /// Whatever the instance wrote to stderr while it came up.
    pub early_stderr: String,
}

pub struct StarterInvoker {
    starter: Box<dyn Starter>,
    suid_install: bool,
}

impl StarterInvoker {
    pub fn new(starter: Box<dyn Starter>, suid_install: bool) -> Self {
        Self {
            starter,
            suid_install,
        }
    }

    fn cleanup_after_failure(config: &LaunchConfig) {
        if let Err(e) = config.cleanup.cleanup_host() {
            error!("host cleanup after failed start: {e}");
        }
    }

    /// Run the container in the foreground.
    pub fn interactive(&self, config: &LaunchConfig) -> Result<(), LaunchError> {
        let opts = StarterOptions::for_config(config, self.suid_install);
        let result = self.starter.exec("capsule runtime parent", config, &opts);
        if result.is_err() {
            Self::cleanup_after_failure(config);
        }
        result
    }

    /// Start the container as instance `name` and record it.
    pub fn instance(
        &self,
        name: &str,
        config: &LaunchConfig,
        registry: &InstanceRegistry,
    ) -> Result<InstanceStart, LaunchError> {
        let lock = registry.lock()?;
        if registry.exists(name) {
            return Err(LaunchError::InstanceExists(name.to_owned()));
        }
        let mut logs = registry.log_files(name)?;
        let start = logs.stderr.seek(SeekFrom::End(0)).unwrap_or_else(|e| {
            warn!("failed to get standard error stream offset: {e}");
            0
        });

        let opts = StarterOptions::for_config(config, self.suid_install);
        let procname = format!("capsule instance: {name}");
        let spawned = match (logs.stdout.try_clone(), logs.stderr.try_clone()) {
            (Ok(out), Ok(err)) => self.starter.spawn(&procname, config, &opts, out, err),
            (Err(e), _) | (_, Err(e)) => Err(e.into()),
        };

        thread::sleep(INSTANCE_GRACE);
        let early_stderr = read_from(&mut logs.stderr, start);

        let pid = match spawned {
            Ok(pid) => pid,
            Err(e) => {
                Self::cleanup_after_failure(config);
                return Err(LaunchError::Starter(format!("failed to start instance: {e}")));
            }
        };

        let record = InstanceRecord {
            name: name.to_owned(),
            pid,
            image: config.image.clone(),
            user_ns: config.has_namespace(NamespaceKind::User),
            cgroup: config.cgroups_json.is_some(),
            log_out: logs.out_path.clone(),
            log_err: logs.err_path.clone(),
            started_at: now_rfc3339(),
        };
        registry.put(&record, &lock)?;
        debug!("instance output in {}", logs.out_path.display());
        debug!("instance errors in {}", logs.err_path.display());
        info!("instance started successfully");
        Ok(InstanceStart {
            record,
            early_stderr,
        })
    }
}

fn read_from(file: &mut File, start: u64) -> String {
    let mut out = String::new();
    if file.seek(SeekFrom::Start(start)).is_ok() {
        if let Err(e) = file.read_to_string(&mut out) {
            warn!("failed to read instance error log: {e}");
        }
    }
    out
}

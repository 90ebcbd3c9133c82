//! Registry of running instances.
//!
//! Each instance is one JSON record under the registry directory, written
//! atomically while holding an exclusive lock on `<dir>/.lock`. Instance
//! output goes to `<dir>/logs/<name>.out` and `<name>.err`.

use crate::LaunchError;
use capsule_runtime::sys;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const INSTANCE_SCHEME: &str = "instance://";

/// `instance://name` → `name`.
pub fn instance_name(image: &str) -> Option<&str> {
    image.strip_prefix(INSTANCE_SCHEME)
}

pub fn validate_instance_name(name: &str) -> Result<(), LaunchError> {
    if name.is_empty() || name.len() > 128 {
        return Err(LaunchError::InvalidOption(
            "instance name must be 1-128 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        || name.starts_with('.')
    {
        return Err(LaunchError::InvalidOption(format!(
            "instance name {name} must match [a-zA-Z0-9._-] and not start with '.'"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub pid: u32,
    pub image: PathBuf,
    pub user_ns: bool,
    pub cgroup: bool,
    pub log_out: PathBuf,
    pub log_err: PathBuf,
    pub started_at: String,
}

impl InstanceRecord {
    pub fn is_alive(&self) -> bool {
        sys::process_alive(self.pid)
    }
}

/// Held for the duration of a registry mutation.
pub struct RegistryLock {
    file: File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    dir: PathBuf,
}

impl InstanceRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The configured `instance-dir`, else `~/.capsule/instances`.
    pub fn default_dir(configured: Option<&Path>, home: &Path) -> PathBuf {
        configured.map_or_else(|| home.join(".capsule/instances"), Path::to_path_buf)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn logs_dir(&self) -> PathBuf {
        self.dir.join("logs")
    }

    pub fn lock(&self) -> Result<RegistryLock, LaunchError> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(".lock"))?;
        file.lock_exclusive()?;
        Ok(RegistryLock { file })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).is_file()
    }

    pub fn get(&self, name: &str) -> Result<InstanceRecord, LaunchError> {
        let path = self.record_path(name);
        if !path.is_file() {
            return Err(LaunchError::InstanceNotFound(name.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write `record`, replacing any previous record of the same name.
    pub fn put(&self, record: &InstanceRecord, _lock: &RegistryLock) -> Result<(), LaunchError> {
        validate_instance_name(&record.name)?;
        let content = serde_json::to_string_pretty(record)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.record_path(&record.name))
            .map_err(|e| LaunchError::Io(e.error))?;
        debug!("recorded instance {} (pid {})", record.name, record.pid);
        Ok(())
    }

    pub fn remove(&self, name: &str, _lock: &RegistryLock) -> Result<(), LaunchError> {
        let path = self.record_path(name);
        if !path.is_file() {
            return Err(LaunchError::InstanceNotFound(name.to_owned()));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    /// All records, sorted by name. Unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<InstanceRecord>, LaunchError> {
        let mut records = Vec::new();
        if !self.dir.is_dir() {
            return Ok(records);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(LaunchError::from)
                .and_then(|c| serde_json::from_str::<InstanceRecord>(&c).map_err(LaunchError::from))
            {
                Ok(r) => records.push(r),
                Err(e) => warn!("skipping unreadable instance record {}: {e}", path.display()),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Open (appending) the stdout and stderr log files of `name`.
    pub fn log_files(&self, name: &str) -> Result<InstanceLogs, LaunchError> {
        validate_instance_name(name)?;
        let dir = self.logs_dir();
        fs::create_dir_all(&dir)?;
        let out_path = dir.join(format!("{name}.out"));
        let err_path = dir.join(format!("{name}.err"));
        let open = |p: &Path| OpenOptions::new().create(true).append(true).read(true).open(p);
        Ok(InstanceLogs {
            stdout: open(&out_path)?,
            stderr: open(&err_path)?,
            out_path,
            err_path,
        })
    }

    /// Signal the instance and drop its record. A record whose process is
    /// already gone is removed without signalling.
    pub fn stop(&self, name: &str, force: bool) -> Result<InstanceRecord, LaunchError> {
        let lock = self.lock()?;
        let record = self.get(name)?;
        if record.is_alive() {
            let signal = if force { sys::SIGKILL } else { sys::SIGTERM };
            sys::send_signal(record.pid, signal).map_err(|e| {
                LaunchError::Instance(format!("could not signal instance {name}: {e}"))
            })?;
            info!("sent signal {signal} to instance {name} (pid {})", record.pid);
        } else {
            info!("instance {name} is no longer running, removing its record");
        }
        self.remove(name, &lock)?;
        Ok(record)
    }
}

pub struct InstanceLogs {
    pub stdout: File,
    pub stderr: File,
    pub out_path: PathBuf,
    pub err_path: PathBuf,
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

//! Facts about the invoking process and host that steer launch resolution.

use capsule_runtime::{probe, sys};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub trait HostContext {
    fn uid(&self) -> u32;
    fn gid(&self) -> u32;
    fn inside_user_ns(&self) -> bool;
    fn has_cap_sys_admin(&self) -> bool;
    fn cgroup2_unified(&self) -> bool;
    fn umask(&self) -> u32;
    /// Soft and hard `RLIMIT_STACK`, if readable.
    fn stack_rlimit(&self) -> Option<(u64, u64)>;
    fn env(&self) -> BTreeMap<String, String>;
    fn cwd(&self) -> Option<PathBuf>;
    /// Home directory of the invoking user.
    fn home_dir(&self) -> PathBuf;
    /// Home directory of `uid` from the password database.
    fn passwd_home(&self, uid: u32) -> Option<PathBuf>;
}

/// Home field of the `/etc/passwd` entry for `uid`.
pub fn passwd_home_from(content: &str, uid: u32) -> Option<PathBuf> {
    content.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 || fields[2].parse::<u32>().ok()? != uid {
            return None;
        }
        Some(PathBuf::from(fields[5]))
    })
}

/// The live host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostContext for SystemHost {
    fn uid(&self) -> u32 {
        sys::current_uid()
    }

    fn gid(&self) -> u32 {
        sys::current_gid()
    }

    fn inside_user_ns(&self) -> bool {
        probe::inside_user_namespace(std::process::id())
    }

    fn has_cap_sys_admin(&self) -> bool {
        probe::has_cap_sys_admin()
    }

    fn cgroup2_unified(&self) -> bool {
        probe::cgroup2_unified()
    }

    fn umask(&self) -> u32 {
        sys::current_umask()
    }

    fn stack_rlimit(&self) -> Option<(u64, u64)> {
        sys::stack_rlimit().ok()
    }

    fn env(&self) -> BTreeMap<String, String> {
        env::vars().collect()
    }

    fn cwd(&self) -> Option<PathBuf> {
        env::current_dir().ok()
    }

    fn home_dir(&self) -> PathBuf {
        env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(|| self.passwd_home(self.uid()))
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn passwd_home(&self, uid: u32) -> Option<PathBuf> {
        let content = fs::read_to_string(Path::new("/etc/passwd")).ok()?;
        passwd_home_from(&content, uid)
    }
}

/// A host with fixed answers, for tests and dry runs.
#[derive(Debug, Clone)]
pub struct StaticHost {
    pub uid: u32,
    pub gid: u32,
    pub inside_user_ns: bool,
    pub cap_sys_admin: bool,
    pub cgroup2_unified: bool,
    pub umask: u32,
    pub stack_rlimit: Option<(u64, u64)>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub home: PathBuf,
    pub passwd: BTreeMap<u32, PathBuf>,
}

impl Default for StaticHost {
    fn default() -> Self {
        Self::user(1000)
    }
}

impl StaticHost {
    /// An unprivileged user on a cgroup v2 host.
    pub fn user(uid: u32) -> Self {
        let home = PathBuf::from(format!("/home/u{uid}"));
        Self {
            uid,
            gid: uid,
            inside_user_ns: false,
            cap_sys_admin: false,
            cgroup2_unified: true,
            umask: 0o022,
            stack_rlimit: Some((8 << 20, u64::MAX)),
            env: BTreeMap::new(),
            cwd: Some(PathBuf::from("/work")),
            home: home.clone(),
            passwd: BTreeMap::from([(uid, home)]),
        }
    }

    pub fn root() -> Self {
        Self {
            gid: 0,
            cap_sys_admin: true,
            home: PathBuf::from("/root"),
            passwd: BTreeMap::from([(0, PathBuf::from("/root"))]),
            ..Self::user(0)
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl HostContext for StaticHost {
    fn uid(&self) -> u32 {
        self.uid
    }

    fn gid(&self) -> u32 {
        self.gid
    }

    fn inside_user_ns(&self) -> bool {
        self.inside_user_ns
    }

    fn has_cap_sys_admin(&self) -> bool {
        self.cap_sys_admin
    }

    fn cgroup2_unified(&self) -> bool {
        self.cgroup2_unified
    }

    fn umask(&self) -> u32 {
        self.umask
    }

    fn stack_rlimit(&self) -> Option<(u64, u64)> {
        self.stack_rlimit
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.env.clone()
    }

    fn cwd(&self) -> Option<PathBuf> {
        self.cwd.clone()
    }

    fn home_dir(&self) -> PathBuf {
        self.home.clone()
    }

    fn passwd_home(&self, uid: u32) -> Option<PathBuf> {
        self.passwd.get(&uid).cloned()
    }
}

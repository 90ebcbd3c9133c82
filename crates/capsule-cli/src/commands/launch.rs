use super::{json_pretty, Failure, EXIT_SUCCESS};
use capsule_core::env::env_pairs;
use capsule_core::{BinaryStarter, LaunchConfig, LaunchConfigBuilder, StarterInvoker};
use capsule_schema::{KeyInfo, LaunchOptions, MountSpecs, Namespaces, RuntimeConf};
use clap::Args;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

pub const RUNSCRIPT: &str = "/.capsule.d/runscript";
pub const STARTSCRIPT: &str = "/.capsule.d/startscript";
const DEFAULT_SHELL: &str = "/bin/sh";
const PASSPHRASE_ENV: &str = "CAPSULE_ENCRYPTION_PASSPHRASE";

/// What to run in the container.
#[derive(Debug)]
pub enum Target {
    Exec(Vec<String>),
    Run(Vec<String>),
    Shell,
}

impl Target {
    fn process(self, opts: &LaunchOptions) -> (String, Vec<String>) {
        match self {
            Target::Exec(mut cmd) => {
                let process = if cmd.is_empty() {
                    String::new()
                } else {
                    cmd.remove(0)
                };
                (process, cmd)
            }
            Target::Run(args) => (RUNSCRIPT.to_owned(), args),
            Target::Shell => (
                opts.shell
                    .as_ref()
                    .map_or_else(|| DEFAULT_SHELL.to_owned(), |s| s.display().to_string()),
                Vec::new(),
            ),
        }
    }
}

#[derive(Debug, Args)]
pub struct LaunchArgs {
    /// Mount the image read-write (sandbox or ext3 images).
    #[arg(short, long)]
    writable: bool,
    /// Put a tmpfs overlay on top of the image.
    #[arg(long)]
    writable_tmpfs: bool,
    /// Bind mount src[:dst[:opts]], comma separated, repeatable.
    #[arg(short = 'B', long = "bind")]
    bind: Vec<String>,
    /// Docker style mount specification (type=bind,source=..,destination=..).
    #[arg(long)]
    mount: Vec<String>,
    /// Bind the root of a data image: <image>:<dest>.
    #[arg(long)]
    data: Vec<String>,
    /// FUSE mount: <container|host>[-daemon]:<command> <mountpoint>.
    #[arg(long)]
    fusemount: Vec<String>,
    /// Overlay layer path[:ro], repeatable, highest precedence first.
    #[arg(short = 'o', long)]
    overlay: Vec<String>,
    /// Disable default mounts (proc, sys, dev, devpts, home, tmp, hostfs, cwd, bind-paths) or a bind path.
    #[arg(long, value_delimiter = ',')]
    no_mount: Vec<String>,
    /// Host directory backing /tmp and /var/tmp and scratch dirs.
    #[arg(short = 'W', long)]
    workdir: Option<PathBuf>,
    /// Scratch directory created inside the container.
    #[arg(short = 'S', long)]
    scratch: Vec<String>,
    /// Home directory as src[:dst].
    #[arg(short = 'H', long)]
    home: Option<String>,
    #[arg(long)]
    no_home: bool,

    /// Enable NVIDIA GPU support.
    #[arg(long)]
    nv: bool,
    /// Set NVIDIA GPUs up with nvidia-container-cli.
    #[arg(long)]
    nvccli: bool,
    #[arg(long)]
    no_nv: bool,
    /// Enable ROCm GPU support.
    #[arg(long)]
    rocm: bool,
    #[arg(long)]
    no_rocm: bool,
    /// Host libraries to bind into the container library dir.
    #[arg(long)]
    contain_libs: Vec<PathBuf>,

    /// KEY=VALUE set in the container, repeatable.
    #[arg(long)]
    env: Vec<String>,
    /// File of KEY=VALUE lines set in the container.
    #[arg(long)]
    env_file: Vec<PathBuf>,
    /// Do not forward the host environment.
    #[arg(short = 'e', long)]
    cleanenv: bool,
    /// Do not shell-evaluate arguments and environment.
    #[arg(long)]
    no_eval: bool,

    #[arg(short = 'u', long)]
    userns: bool,
    #[arg(long)]
    uts: bool,
    #[arg(short = 'p', long)]
    pid: bool,
    #[arg(short = 'i', long)]
    ipc: bool,
    #[arg(short = 'n', long)]
    net: bool,
    /// Do not create the PID namespace implied by other options.
    #[arg(long)]
    no_pid: bool,
    /// Join the network namespace at this path.
    #[arg(long)]
    netns_path: Option<PathBuf>,
    #[arg(long)]
    network: Option<String>,
    #[arg(long)]
    network_args: Vec<String>,
    #[arg(long)]
    hostname: Option<String>,
    #[arg(long)]
    dns: Option<String>,

    #[arg(long)]
    add_caps: Option<String>,
    #[arg(long)]
    drop_caps: Option<String>,
    /// Honour setuid bits inside the container (root only).
    #[arg(long)]
    allow_setuid: bool,
    /// Keep all capabilities of root (root only).
    #[arg(long)]
    keep_privs: bool,
    #[arg(long)]
    no_privs: bool,
    /// Security option <name>:<value> (selinux, apparmor, seccomp, uid, gid).
    #[arg(long)]
    security: Vec<String>,
    #[arg(long)]
    no_umask: bool,
    /// JSON file of cgroup resource limits.
    #[arg(long)]
    apply_cgroups: Option<PathBuf>,

    /// Shell used by `capsule shell`.
    #[arg(long)]
    shell: Option<PathBuf>,
    /// Working directory inside the container.
    #[arg(long)]
    pwd: Option<PathBuf>,
    /// Run as root inside a user namespace.
    #[arg(short = 'f', long)]
    fakeroot: bool,
    #[arg(long)]
    no_setgroups: bool,
    /// Boot the image with /sbin/init (instances only, root only).
    #[arg(long)]
    boot: bool,
    #[arg(short = 'c', long)]
    contain: bool,
    /// Contain filesystems, PIDs, IPC and environment.
    #[arg(short = 'C', long)]
    containall: bool,
    /// Application to run from the image.
    #[arg(long)]
    app: Option<String>,

    /// Read the decryption passphrase from CAPSULE_ENCRYPTION_PASSPHRASE.
    #[arg(long)]
    passphrase: bool,
    /// PEM key file for encrypted images.
    #[arg(long)]
    pem_path: Option<PathBuf>,

    /// Mount SIF images with FUSE when unprivileged.
    #[arg(long)]
    sif_fuse: bool,
    /// Always extract the image to a temporary sandbox.
    #[arg(long)]
    tmp_sandbox: bool,
    /// Never extract the image to a temporary sandbox.
    #[arg(long)]
    no_tmp_sandbox: bool,
    /// Where temporary sandboxes and mount points are created.
    #[arg(long)]
    tmpdir: Option<PathBuf>,

    /// Print the resolved configuration instead of starting the container.
    #[arg(long)]
    dry_run: bool,
}

impl LaunchArgs {
    fn key_info(&self) -> Result<Option<KeyInfo>, Failure> {
        if self.passphrase {
            let pass = std::env::var(PASSPHRASE_ENV).map_err(|_| {
                Failure::config(format!("--passphrase requires {PASSPHRASE_ENV} to be set"))
            })?;
            return Ok(Some(KeyInfo::Passphrase(pass)));
        }
        Ok(self.pem_path.clone().map(KeyInfo::PemFile))
    }

    pub fn into_options(self) -> Result<LaunchOptions, Failure> {
        if let Some(bad) = self.env.iter().find(|e| !e.contains('=')) {
            return Err(Failure::config(format!(
                "invalid --env entry '{bad}', expected KEY=VALUE"
            )));
        }
        let cgroups_json = self
            .apply_cgroups
            .as_ref()
            .map(|p| {
                fs::read_to_string(p).map_err(|e| {
                    Failure::config(format!("could not read {}: {e}", p.display()))
                })
            })
            .transpose()?;
        let key_info = self.key_info()?;

        Ok(LaunchOptions {
            writable: self.writable,
            writable_tmpfs: self.writable_tmpfs,
            mounts: MountSpecs {
                binds: self.bind,
                mounts: self.mount,
                data_binds: self.data,
                fuse_mounts: self.fusemount,
                overlays: self.overlay,
                no_mount: self.no_mount,
                scratch_dirs: self.scratch,
            },
            work_dir: self.workdir,
            home: self.home,
            no_home: self.no_home,
            nvidia: self.nv,
            nvccli: self.nvccli,
            no_nvidia: self.no_nv,
            rocm: self.rocm,
            no_rocm: self.no_rocm,
            contain_libs: self.contain_libs,
            env: env_pairs(self.env.iter().map(String::as_str)),
            env_files: self.env_file,
            clean_env: self.cleanenv,
            no_eval: self.no_eval,
            namespaces: Namespaces {
                user: self.userns,
                uts: self.uts,
                pid: self.pid,
                ipc: self.ipc,
                net: self.net,
                no_pid: self.no_pid,
                net_path: self.netns_path,
            },
            network: self.network,
            network_args: self.network_args,
            hostname: self.hostname,
            dns: self.dns,
            add_caps: self.add_caps,
            drop_caps: self.drop_caps,
            allow_setuid: self.allow_setuid,
            keep_privs: self.keep_privs,
            no_privs: self.no_privs,
            security: self.security,
            no_umask: self.no_umask,
            cgroups_json,
            shell: self.shell,
            cwd: self.pwd,
            fakeroot: self.fakeroot,
            no_setgroups: self.no_setgroups,
            boot: self.boot,
            contain: self.contain,
            contain_all: self.containall,
            app_name: self.app,
            key_info,
            sif_fuse: self.sif_fuse,
            tmp_sandbox: self.tmp_sandbox,
            no_tmp_sandbox: self.no_tmp_sandbox,
            tmp_dir: self.tmpdir,
        })
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Print `config` as JSON, then undo any host mounts made for it.
pub fn print_config(config: &LaunchConfig) -> Result<u8, Failure> {
    let mut shown = config.clone();
    shown.encryption_key = None;
    println!("{}", json_pretty(&shown)?);
    if let Err(e) = config.cleanup.cleanup_host() {
        warn!("host cleanup after dry run: {e}");
    }
    Ok(EXIT_SUCCESS)
}

pub fn run(
    conf: &RuntimeConf,
    args: LaunchArgs,
    image: &str,
    target: Target,
) -> Result<u8, Failure> {
    let dry_run = args.dry_run();
    let opts = args.into_options()?;
    let (process, process_args) = target.process(&opts);
    let config =
        LaunchConfigBuilder::new(conf).build(opts, image, &process, &process_args, None)?;
    if dry_run {
        return print_config(&config);
    }

    let invoker = StarterInvoker::new(
        Box::new(BinaryStarter::new(conf.starter_dir.clone())),
        conf.suid_install,
    );
    invoker.interactive(&config)?;
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        launch: LaunchArgs,
    }

    fn parse(args: &[&str]) -> LaunchArgs {
        Harness::parse_from(std::iter::once("capsule").chain(args.iter().copied())).launch
    }

    #[test]
    fn flags_map_to_options() {
        let opts = parse(&[
            "-B",
            "/a:/b",
            "--no-mount",
            "tmp,home",
            "-C",
            "-f",
            "--env",
            "A=1",
            "--hostname",
            "box",
        ])
        .into_options()
        .unwrap();
        assert_eq!(opts.mounts.binds, vec!["/a:/b"]);
        assert_eq!(opts.mounts.no_mount, vec!["tmp", "home"]);
        assert!(opts.contain_all && opts.fakeroot);
        assert_eq!(opts.env["A"], "1");
        assert_eq!(opts.hostname.as_deref(), Some("box"));
    }

    #[test]
    fn env_entry_needs_equals() {
        let err = parse(&["--env", "NOPE"]).into_options().unwrap_err();
        assert_eq!(err.code, crate::commands::EXIT_CONFIG_ERROR);
    }

    #[test]
    fn cgroups_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.json");
        fs::write(&path, r#"{"pids":{"limit":10}}"#).unwrap();
        let opts = parse(&["--apply-cgroups", path.to_str().unwrap()])
            .into_options()
            .unwrap();
        assert!(opts.cgroups_json.unwrap().contains("pids"));
    }

    #[test]
    fn targets_pick_the_process() {
        let opts = LaunchOptions::default();
        let (p, a) = Target::Exec(vec!["ls".to_owned(), "-l".to_owned()]).process(&opts);
        assert_eq!((p.as_str(), a), ("ls", vec!["-l".to_owned()]));
        let (p, _) = Target::Run(Vec::new()).process(&opts);
        assert_eq!(p, RUNSCRIPT);
        let (p, _) = Target::Shell.process(&opts);
        assert_eq!(p, "/bin/sh");
    }
}

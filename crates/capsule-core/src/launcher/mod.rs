//! Launch configuration resolution.
//!
//! Options interact: a target uid changes the home directory, joining an
//! instance overrides the user namespace request, GPU setup can switch on
//! `--writable-tmpfs`, and image preparation depends on every namespace
//! decision. Resolution is therefore an ordered list of steps. Each step
//! takes the accumulated `Resolution` and returns it updated, or fails; a
//! step only reads what earlier steps settled.

mod devices;
mod image;
mod mounts;
mod namespaces;
mod privilege;
mod process;

use crate::config::LaunchConfig;
use crate::host::{HostContext, SystemHost};
use crate::instance::{InstanceRecord, InstanceRegistry};
use crate::keys::{KeyProvider, PassphraseKeyProvider};
use crate::LaunchError;
use capsule_runtime::{HeaderProbe, HostStager, ImagePreparer};
use capsule_schema::{LaunchOptions, RuntimeConf};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Collaborators every step may consult. None of them is mutated.
pub struct Context<'a> {
    pub conf: &'a RuntimeConf,
    pub host: &'a dyn HostContext,
    pub keys: &'a dyn KeyProvider,
    pub preparer: &'a ImagePreparer,
    pub registry: &'a InstanceRegistry,
}

/// The state threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The user request; steps may turn implied options on.
    pub opts: LaunchOptions,
    pub config: LaunchConfig,
    /// Image argument as given: a path or `instance://name`.
    pub image: String,
    /// Name of the instance being started, if any.
    pub instance_name: Option<String>,
    /// Effective uid/gid the container runs with.
    pub uid: u32,
    pub gid: u32,
    /// Environment the container environment is built from. Steps add to it
    /// instead of touching the process environment.
    pub host_env: BTreeMap<String, String>,
    /// The instance being joined.
    pub joined: Option<InstanceRecord>,
}

impl Resolution {
    pub fn new(
        opts: LaunchOptions,
        image: &str,
        process: &str,
        args: &[String],
        instance_name: Option<&str>,
    ) -> Self {
        let mut config = LaunchConfig::default();
        config.process.args = std::iter::once(process.to_owned())
            .chain(args.iter().cloned())
            .collect();
        Self {
            opts,
            config,
            image: image.to_owned(),
            instance_name: instance_name.map(str::to_owned),
            uid: 0,
            gid: 0,
            host_env: BTreeMap::new(),
            joined: None,
        }
    }

    /// Log a warning and keep it on the configuration.
    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!("{msg}");
        self.config.warnings.push(msg);
    }
}

pub type Step = fn(Resolution, &Context<'_>) -> Result<Resolution, LaunchError>;

/// Resolution order. Privilege checks come first so that nothing is read or
/// mounted for a request that cannot be honoured; image preparation comes
/// last because it depends on every namespace and writable decision.
pub const PIPELINE: &[(&str, Step)] = &[
    ("privileges", privilege::gate_privileges),
    ("process", process::set_process),
    ("umask", process::set_umask),
    ("target ids", privilege::set_target_ids),
    ("image or instance", image::set_image_or_instance),
    ("overlays", image::set_overlays),
    ("encryption key", image::check_encryption_key),
    ("privilege mode", privilege::set_privilege_mode),
    ("binds", mounts::set_binds),
    ("fuse mounts", mounts::set_fuse_mounts),
    ("home", mounts::set_home),
    ("no-mount", mounts::set_no_mount),
    ("gpu", devices::set_gpu),
    ("writable tmpfs", mounts::resolve_writable_tmpfs),
    ("container options", namespaces::set_container_options),
    ("capabilities", privilege::set_capabilities),
    ("fakeroot", privilege::set_fakeroot),
    ("cgroups", namespaces::set_cgroups),
    ("containment", namespaces::set_containment),
    ("instance", namespaces::set_instance),
    ("namespaces", namespaces::set_namespaces),
    ("environment", process::set_env),
    ("cwd", process::set_cwd),
    ("app name", process::set_app_name),
    ("prepare image", image::prepare_image),
];

pub struct LaunchConfigBuilder<'a> {
    conf: &'a RuntimeConf,
    host: Box<dyn HostContext>,
    keys: Box<dyn KeyProvider>,
    preparer: ImagePreparer,
    registry: InstanceRegistry,
}

impl<'a> LaunchConfigBuilder<'a> {
    /// A builder for the live host.
    pub fn new(conf: &'a RuntimeConf) -> Self {
        let host = SystemHost;
        let registry = InstanceRegistry::new(InstanceRegistry::default_dir(
            conf.instance_dir.as_deref(),
            &host.home_dir(),
        ));
        let stager = HostStager {
            unsquashfs: conf.unsquashfs_path.clone(),
        };
        Self {
            conf,
            host: Box::new(host),
            keys: Box::new(PassphraseKeyProvider),
            preparer: ImagePreparer::new(Box::new(HeaderProbe), Box::new(stager)),
            registry,
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: Box<dyn HostContext>) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub fn with_keys(mut self, keys: Box<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    #[must_use]
    pub fn with_preparer(mut self, preparer: ImagePreparer) -> Self {
        self.preparer = preparer;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: InstanceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn context(&self) -> Context<'_> {
        Context {
            conf: self.conf,
            host: self.host.as_ref(),
            keys: self.keys.as_ref(),
            preparer: &self.preparer,
            registry: &self.registry,
        }
    }

    /// Run every step over a fresh resolution.
    pub fn resolve(
        &self,
        opts: LaunchOptions,
        image: &str,
        process: &str,
        args: &[String],
        instance_name: Option<&str>,
    ) -> Result<Resolution, LaunchError> {
        let ctx = self.context();
        let mut res = Resolution::new(opts, image, process, args, instance_name);
        res.uid = ctx.host.uid();
        res.gid = ctx.host.gid();
        res.host_env = ctx.host.env();
        for (name, step) in PIPELINE {
            debug!("launch resolution: {name}");
            res = step(res, &ctx)?;
        }
        Ok(res)
    }

    pub fn build(
        &self,
        opts: LaunchOptions,
        image: &str,
        process: &str,
        args: &[String],
        instance_name: Option<&str>,
    ) -> Result<LaunchConfig, LaunchError> {
        Ok(self
            .resolve(opts, image, process, args, instance_name)?
            .config)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::Fixture;
    use super::*;
    use crate::config::NamespaceKind;
    use crate::host::StaticHost;

    fn builder(fx: &Fixture) -> LaunchConfigBuilder<'_> {
        LaunchConfigBuilder::new(&fx.conf)
            .with_host(Box::new(fx.host.clone()))
            .with_registry(fx.registry.clone())
    }

    #[test]
    fn pipeline_order_is_fixed() {
        let names: Vec<_> = PIPELINE.iter().map(|(n, _)| *n).collect();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert_eq!(pos("privileges"), 0);
        assert!(pos("umask") < pos("target ids"));
        assert!(pos("target ids") < pos("image or instance"));
        assert!(pos("image or instance") < pos("privilege mode"));
        assert!(pos("privilege mode") < pos("binds"));
        assert!(pos("binds") < pos("gpu"));
        assert!(pos("gpu") < pos("writable tmpfs"));
        assert!(pos("cgroups") < pos("namespaces"));
        assert_eq!(names.last(), Some(&"prepare image"));
    }

    #[test]
    fn plain_user_launch_of_sandbox() {
        let fx = Fixture::user();
        let image = fx.dir.path().join("rootfs");
        let cfg = builder(&fx)
            .build(
                LaunchOptions::default(),
                image.to_str().unwrap(),
                "/bin/echo",
                &["hi".to_owned()],
                None,
            )
            .unwrap();

        assert_eq!(cfg.process.args, vec!["/bin/echo", "hi"]);
        assert_eq!(cfg.image, image);
        assert!(cfg.use_suid);
        assert!(!cfg.has_namespace(NamespaceKind::User));
        assert_eq!(cfg.home_dest, "/home/u1000");
        assert_eq!(cfg.process.cwd.as_deref(), Some(std::path::Path::new("/work")));
        assert_eq!(
            cfg.process.env.get("CAPSULE_NAME").map(String::as_str),
            Some("rootfs")
        );
        assert_eq!(cfg.umask, Some(0o022));
        assert!(cfg.cleanup.is_empty());
        assert_eq!(cfg.process.rlimits.len(), 1);
    }

    #[test]
    fn writable_and_writable_tmpfs_never_both() {
        let fx = Fixture::user();
        let image = fx.dir.path().join("rootfs");
        let opts = LaunchOptions {
            writable: true,
            writable_tmpfs: true,
            ..Default::default()
        };
        let cfg = builder(&fx)
            .build(opts, image.to_str().unwrap(), "/bin/sh", &[], None)
            .unwrap();
        assert!(cfg.writable_image);
        assert!(!cfg.writable_tmpfs);
        assert!(cfg
            .warnings
            .iter()
            .any(|w| w.contains("mutually exclusive with --writable")));
    }

    #[test]
    fn privilege_flags_fail_before_anything_is_read() {
        let fx = Fixture::user();
        for opts in [
            LaunchOptions {
                allow_setuid: true,
                ..Default::default()
            },
            LaunchOptions {
                keep_privs: true,
                ..Default::default()
            },
            LaunchOptions {
                boot: true,
                ..Default::default()
            },
        ] {
            // the image does not exist: the privilege error must win
            let err = builder(&fx)
                .build(opts, "/does/not/exist", "/bin/sh", &[], None)
                .unwrap_err();
            assert!(matches!(err, LaunchError::PrivilegeRequired(_)), "{err}");
        }
    }

    #[test]
    fn root_without_cap_sys_admin_falls_back_to_user_namespace() {
        let host = StaticHost {
            cap_sys_admin: false,
            ..StaticHost::root()
        };
        let fx = Fixture::new(host);
        let image = fx.dir.path().join("rootfs");
        let cfg = builder(&fx)
            .build(LaunchOptions::default(), image.to_str().unwrap(), "/bin/sh", &[], None)
            .unwrap();
        assert!(!cfg.use_suid);
        assert!(cfg.has_namespace(NamespaceKind::User));
        assert_eq!(cfg.uid_mappings.len(), 1);
    }
}

use crate::conf::ConfError;
use serde::{Deserialize, Serialize};

/// A `--security` option in `<name>:<value>` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum SecurityOpt {
    Selinux(String),
    Apparmor(String),
    Seccomp(String),
    Uid(u32),
    Gid(Vec<u32>),
}

impl SecurityOpt {
    pub fn parse(opt: &str) -> Result<Self, ConfError> {
        let invalid = || ConfError::InvalidSecurityOpt(opt.to_owned());
        let (name, value) = opt.split_once(':').ok_or_else(invalid)?;
        if value.is_empty() {
            return Err(invalid());
        }
        match name {
            "selinux" => Ok(Self::Selinux(value.to_owned())),
            "apparmor" => Ok(Self::Apparmor(value.to_owned())),
            "seccomp" => Ok(Self::Seccomp(value.to_owned())),
            "uid" => value.parse().map(Self::Uid).map_err(|_| invalid()),
            "gid" => value
                .split(':')
                .map(str::parse)
                .collect::<Result<Vec<u32>, _>>()
                .map(Self::Gid)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Uid(_) | Self::Gid(_))
    }
}

/// Return the raw value of the first `<feature>:<value>` entry in `opts`.
pub fn get_param<'a>(opts: &'a [String], feature: &str) -> Option<&'a str> {
    opts.iter().find_map(|o| {
        let (name, value) = o.split_once(':')?;
        (name == feature).then_some(value)
    })
}

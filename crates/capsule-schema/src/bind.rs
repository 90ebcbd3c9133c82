use crate::conf::ConfError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindOption {
    ReadOnly,
    ReadWrite,
    ImageSrc(String),
    Id(String),
}

impl BindOption {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "ro" => Some(Self::ReadOnly),
            "rw" => Some(Self::ReadWrite),
            _ => {
                if let Some(v) = token.strip_prefix("image-src=") {
                    Some(Self::ImageSrc(v.to_owned()))
                } else {
                    token
                        .strip_prefix("id=")
                        .map(|v| Self::Id(v.to_owned()))
                }
            }
        }
    }
}

/// A host path (or a path inside an image when `image-src` is set) to be
/// bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindPath {
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<BindOption>,
}

impl BindPath {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            options: Vec::new(),
        }
    }

    pub fn readonly(&self) -> bool {
        self.options.contains(&BindOption::ReadOnly)
    }

    /// Path inside the source image to bind from. An empty `image-src=`
    /// means the image root.
    pub fn image_src(&self) -> Option<&str> {
        self.options.iter().find_map(|o| match o {
            BindOption::ImageSrc(v) if v.is_empty() => Some("/"),
            BindOption::ImageSrc(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.options.iter().find_map(|o| match o {
            BindOption::Id(v) => Some(v.as_str()),
            _ => None,
        })
    }

    fn set(&mut self, opt: BindOption) {
        self.options
            .retain(|o| std::mem::discriminant(o) != std::mem::discriminant(&opt));
        self.options.push(opt);
    }
}

fn bind_error(spec: &str, reason: impl Into<String>) -> ConfError {
    ConfError::InvalidBind {
        spec: spec.to_owned(),
        reason: reason.into(),
    }
}

fn new_bind_path(spec: &str) -> Result<BindPath, ConfError> {
    let mut parts = spec.splitn(3, ':');
    let source = parts.next().unwrap_or_default().trim();
    if source.is_empty() {
        return Err(bind_error(spec, "empty bind source"));
    }
    let destination = match parts.next() {
        Some(d) if !d.trim().is_empty() => d.trim(),
        Some(_) => return Err(bind_error(spec, "empty bind destination")),
        None => source,
    };
    let mut bind = BindPath::new(source, destination);
    if let Some(opts) = parts.next() {
        for token in opts.split(',').map(str::trim) {
            let opt = BindOption::parse(token)
                .ok_or_else(|| bind_error(spec, format!("{token} is not a valid bind option")))?;
            bind.set(opt);
        }
    }
    Ok(bind)
}

/// Parse a comma separated list of `src[:dst[:opt,opt...]]` entries.
///
/// Commas both separate entries and separate the options of the entry
/// before them: a token that follows an entry carrying an option field
/// and looks like an option is attached to that entry.
pub fn parse_bind_paths(spec: &str) -> Result<Vec<BindPath>, ConfError> {
    let mut entries: Vec<String> = Vec::new();

    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some(current) = entries.last_mut() {
            let has_opts = current.matches(':').count() >= 2;
            if has_opts && BindOption::parse(token).is_some() {
                current.push(',');
                current.push_str(token);
                continue;
            }
        }
        if token.matches(':').count() > 2 {
            return Err(bind_error(token, "too many ':' separated fields"));
        }
        entries.push(token.to_owned());
    }

    entries.iter().map(|e| new_bind_path(e)).collect()
}

/// Parse a data container bind of the form `<image>:<dest>`.
pub fn parse_data_bind(spec: &str) -> Result<BindPath, ConfError> {
    let fields: Vec<&str> = spec.split(':').collect();
    let [source, destination] = fields.as_slice() else {
        return Err(bind_error(spec, "not in <src image>:<dest> format"));
    };
    if source.is_empty() {
        return Err(bind_error(spec, "empty source"));
    }
    if destination.is_empty() {
        return Err(bind_error(spec, "empty destination"));
    }
    let mut bind = BindPath::new(*source, *destination);
    bind.set(BindOption::ImageSrc("/".to_owned()));
    Ok(bind)
}

fn split_csv_record(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if quoted {
        return Err("unterminated quote".to_owned());
    }
    fields.push(field);
    Ok(fields)
}

/// Parse docker style `--mount` specifications. Each line of `spec` is one
/// CSV record of `key[=value]` fields. Only `type=bind` is accepted.
pub fn parse_mount_string(spec: &str) -> Result<Vec<BindPath>, ConfError> {
    let mount_error = |reason: String| ConfError::InvalidMount {
        spec: spec.to_owned(),
        reason,
    };
    let mut binds = Vec::new();

    for line in spec.lines().filter(|l| !l.trim().is_empty()) {
        let mut source = String::new();
        let mut destination = String::new();
        let mut bind = BindPath::new("", "");

        for field in split_csv_record(line).map_err(mount_error)? {
            let (key, val) = field.split_once('=').unwrap_or((field.as_str(), ""));
            match key {
                "type" if val != "bind" => {
                    return Err(mount_error(format!(
                        "unsupported mount type '{val}', only 'bind' is supported"
                    )));
                }
                "type" => {}
                "source" | "src" => {
                    if val.is_empty() {
                        return Err(mount_error("mount source cannot be empty".to_owned()));
                    }
                    val.clone_into(&mut source);
                }
                "destination" | "dst" | "target" => {
                    if val.is_empty() {
                        return Err(mount_error("mount destination cannot be empty".to_owned()));
                    }
                    val.clone_into(&mut destination);
                }
                "ro" | "readonly" => bind.set(BindOption::ReadOnly),
                "image-src" => {
                    if val.is_empty() {
                        return Err(mount_error("image-src cannot be empty".to_owned()));
                    }
                    bind.set(BindOption::ImageSrc(val.to_owned()));
                }
                "id" => {
                    if val.is_empty() {
                        return Err(mount_error("id cannot be empty".to_owned()));
                    }
                    bind.set(BindOption::Id(val.to_owned()));
                }
                "bind-propagation" => {
                    return Err(mount_error(
                        "bind-propagation is not supported for individual mounts".to_owned(),
                    ));
                }
                other => {
                    return Err(mount_error(format!(
                        "invalid key '{other}' in mount specification"
                    )));
                }
            }
        }

        if source.is_empty() || destination.is_empty() {
            return Err(mount_error(
                "mounts must specify a source and a destination".to_owned(),
            ));
        }
        bind.source = source;
        bind.destination = destination;
        binds.push(bind);
    }

    Ok(binds)
}

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

const CONFIG_FOLDER: &str = "xdg-desktop-portal-pikeru";
const CONFIG_FALLBACK: &str = "config";
const FILECHOOSER_SECTION: &str = "filechooser";

pub const POSTPROCESS_DIR: &str = "/tmp/pk_postprocess";
const FALLBACK_SAVE_DIR: &str = "/tmp";

const DEFAULT_CMDS: &[&str] = &[
    "/usr/share/xdg-desktop-portal-pikeru/pikeru-wrapper.sh",
    "/usr/local/share/xdg-desktop-portal-pikeru/pikeru-wrapper.sh",
    "/opt/pikeru/xdg_portal/contrib/pikeru-wrapper.sh",
];

fn sysconfdir() -> &'static str {
    option_env!("SYSCONFDIR").unwrap_or("/etc")
}

/// The parts of the process environment that configuration resolution reads.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    home: Option<PathBuf>,
    config_home: Option<PathBuf>,
    current_desktop: Option<String>,
}

impl Environment {
    pub fn from_process() -> Self {
        Self {
            home: non_empty_var("HOME").map(PathBuf::from),
            config_home: non_empty_var("XDG_CONFIG_HOME").map(PathBuf::from),
            current_desktop: std::env::var("XDG_CURRENT_DESKTOP").ok(),
        }
    }

    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    fn config_home(&self) -> Option<PathBuf> {
        self.config_home
            .clone()
            .or_else(|| self.home.as_ref().map(|home| home.join(".config")))
    }
}

fn non_empty_var(key: &str) -> Option<OsString> {
    std::env::var_os(key).filter(|value| !value.is_empty())
}

/// Runtime configuration of the file chooser.
///
/// Built once at startup and never modified afterwards.
#[derive(Debug)]
pub struct Config {
    command: Option<PathBuf>,
    default_save_dir: PathBuf,
    postprocess_dir: PathBuf,
}

impl Config {
    /// Builds the configuration from defaults, overlaid by `explicit_path` if
    /// given or by the first config file found in the XDG config locations.
    pub fn resolve(env: &Environment, explicit_path: Option<&Path>) -> Self {
        let mut config = Self::defaults(env);

        let path = match explicit_path {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(env),
        };

        match path {
            Some(path) => config.load(env, &path),
            None => log::debug!("config: no config file found, using defaults"),
        }

        config.validate(env);
        config
    }

    fn defaults(env: &Environment) -> Self {
        let command = DEFAULT_CMDS
            .iter()
            .map(Path::new)
            .find(|cmd| is_readable(cmd))
            .map(Path::to_path_buf);

        Self {
            command,
            default_save_dir: default_save_dir(env),
            postprocess_dir: PathBuf::from(POSTPROCESS_DIR),
        }
    }

    fn load(&mut self, env: &Environment, path: &Path) {
        log::info!("config: loading {}", path.display());
        match fs::read(path) {
            Ok(contents) => self.apply_ini(env, path, &String::from_utf8_lossy(&contents)),
            Err(e) => log::error!(
                "config: unable to load config file {}: {}",
                path.display(),
                e
            ),
        }
    }

    fn apply_ini(&mut self, env: &Environment, path: &Path, contents: &str) {
        let mut section = "";

        for (index, line) in contents.lines().enumerate() {
            match IniLine::parse(line) {
                IniLine::Blank => {}
                IniLine::Section(name) => section = name,
                IniLine::Entry(key, value) => {
                    log::trace!(
                        "config: parsing section {}, key {}, value {}",
                        section,
                        key,
                        value
                    );
                    if section != FILECHOOSER_SECTION {
                        log::trace!("config: skipping key {} in section [{}]", key, section);
                        continue;
                    }
                    self.set(env, key, value);
                }
                IniLine::Malformed => log::error!(
                    "config: {}:{}: malformed line: {}",
                    path.display(),
                    index + 1,
                    line
                ),
            }
        }
    }

    fn set(&mut self, env: &Environment, key: &str, value: &str) {
        let slot = match key {
            "cmd" => None,
            "default_save_dir" => Some(&mut self.default_save_dir),
            "postprocess_dir" => Some(&mut self.postprocess_dir),
            _ => {
                log::trace!("config: skipping unknown key {}", key);
                return;
            }
        };

        if value.is_empty() {
            log::trace!("config: skipping empty value for {}", key);
            return;
        }

        let value = expand_home(env, value);
        match slot {
            Some(slot) => *slot = value,
            None => self.command = Some(value),
        }
    }

    fn validate(&mut self, env: &Environment) {
        match &self.command {
            Some(cmd) if !cmd.exists() => {
                log::warn!("config: cmd {} does not exist", cmd.display())
            }
            Some(_) => {}
            None => log::warn!("config: no cmd found, every request will fail"),
        }

        if !self.default_save_dir.is_dir() {
            let fallback = default_save_dir(env);
            log::warn!(
                "config: default_save_dir {} is not a directory, using {}",
                self.default_save_dir.display(),
                fallback.display()
            );
            self.default_save_dir = fallback;
        }
    }

    /// Logs every field at `level`.
    pub fn print(&self, level: log::Level) {
        let command = self
            .command
            .as_deref()
            .map(|cmd| cmd.display().to_string())
            .unwrap_or_else(|| String::from("(none)"));
        log::log!(level, "config: cmd: {}", command);
        log::log!(
            level,
            "config: default_save_dir: {}",
            self.default_save_dir.display()
        );
        log::log!(
            level,
            "config: postprocess_dir: {}",
            self.postprocess_dir.display()
        );
    }

    pub fn command(&self) -> Option<&Path> {
        self.command.as_deref()
    }

    pub fn default_save_dir(&self) -> &Path {
        &self.default_save_dir
    }

    pub fn postprocess_dir(&self) -> &Path {
        &self.postprocess_dir
    }

    #[cfg(test)]
    pub(crate) fn new(
        command: Option<PathBuf>,
        default_save_dir: PathBuf,
        postprocess_dir: PathBuf,
    ) -> Self {
        Self {
            command,
            default_save_dir,
            postprocess_dir,
        }
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        log::debug!("config: destroying config");
    }
}

fn default_save_dir(env: &Environment) -> PathBuf {
    env.home()
        .map(|home| home.join("Downloads"))
        .filter(|downloads| downloads.is_dir())
        .unwrap_or_else(|| PathBuf::from(FALLBACK_SAVE_DIR))
}

fn is_readable(path: &Path) -> bool {
    fs::File::open(path).is_ok()
}

/// Walks `<prefix>/xdg-desktop-portal-pikeru/<name>` for every config prefix
/// and every desktop name, returning the first readable file.
fn find_config_file(env: &Environment) -> Option<PathBuf> {
    let prefixes = [env.config_home(), Some(Path::new(sysconfdir()).join("xdg"))];

    let desktops: Vec<&str> = env
        .current_desktop
        .as_deref()
        .map(|desktops| desktops.split(':').filter(|d| !d.is_empty()).collect())
        .unwrap_or_default();

    for prefix in prefixes.iter().flatten() {
        if prefix.as_os_str().is_empty() {
            continue;
        }

        for name in desktops.iter().copied().chain([CONFIG_FALLBACK]) {
            let path = prefix.join(CONFIG_FOLDER).join(name);
            log::trace!("config: trying config file {}", path.display());
            if is_readable(&path) {
                return Some(path);
            }
        }
    }

    None
}

/// Replaces a leading `~` with the home directory. A lone `~` is kept as is.
fn expand_home(env: &Environment, value: &str) -> PathBuf {
    match (value.strip_prefix('~'), env.home()) {
        (Some(rest), Some(home)) if !rest.is_empty() => {
            log::trace!("config: expanding home tilde in {}", value);
            let mut expanded = home.as_os_str().to_os_string();
            expanded.push(rest);
            PathBuf::from(expanded)
        }
        _ => PathBuf::from(value),
    }
}

#[derive(Debug, PartialEq)]
enum IniLine<'a> {
    Blank,
    Section(&'a str),
    Entry(&'a str, &'a str),
    Malformed,
}

impl<'a> IniLine<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();

        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            return Self::Blank;
        }

        if let Some(rest) = line.strip_prefix('[') {
            return match rest.find(']') {
                Some(end) => Self::Section(rest[..end].trim()),
                None => Self::Malformed,
            };
        }

        match line.find(|c: char| c == '=' || c == ':') {
            Some(split) => {
                let key = line[..split].trim();
                let value = strip_inline_comment(&line[split + 1..]).trim();
                if key.is_empty() {
                    Self::Malformed
                } else {
                    Self::Entry(key, value)
                }
            }
            None => Self::Malformed,
        }
    }
}

// an inline comment starts at a ';' preceded by whitespace
fn strip_inline_comment(value: &str) -> &str {
    let mut previous = ' ';
    for (i, c) in value.char_indices() {
        if c == ';' && previous.is_whitespace() {
            return &value[..i];
        }
        previous = c;
    }
    value
}

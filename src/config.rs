use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_RESET_PATH: &str = "/reset/";
pub const DEFAULT_RESTART_PATH: &str = "/restart/";
/// Longest accepted wait: 100 years. Anything above cannot be scheduled.
pub const MAX_DEADLINE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("\"task\" is required")]
    MissingTask,
    #[error("\"time\" is required")]
    MissingDuration,
    #[error("invalid \"time\" value {value:?}: {source}")]
    InvalidDuration {
        value: String,
        source: humantime::DurationError,
    },
    #[error("\"time\" must be positive")]
    NonPositiveDuration,
    #[error("\"time\" must be at most 100 years, got {0:?}")]
    DurationTooLarge(Duration),
    #[error("invalid redirect URL {value:?}: {source}")]
    InvalidRedirect {
        value: String,
        source: url::ParseError,
    },
    #[error("reset and restart paths are both {0}")]
    PathConflict(String),
    /// Several problems found at once.
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<ConfigError>),
}

/// Wait time for one arm cycle. Always strictly positive and at most
/// `MAX_DEADLINE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Duration);

impl Deadline {
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() {
            return Err(ConfigError::NonPositiveDuration);
        }
        if duration > MAX_DEADLINE {
            return Err(ConfigError::DurationTooLarge(duration));
        }
        Ok(Self(duration))
    }

    /// Parse a human duration expression such as `10s` or `1h5m`.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let duration =
            humantime::parse_duration(value.trim()).map_err(|e| ConfigError::InvalidDuration {
                value: value.to_string(),
                source: e,
            })?;
        Self::new(duration)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }
}

/// Optional TOML config file (`--config`).
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub watchdog: WatchdogSection,
    pub shutdown: ShutdownSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WatchdogSection {
    pub task: Option<String>,
    pub time: Option<String>,
    pub port: Option<u16>,
    pub local: Option<bool>,
    pub stealth: Option<bool>,
    pub onetime: Option<bool>,
    pub reset_url: Option<String>,
    pub restart_url: Option<String>,
    pub redir_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    pub grace_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self { grace_secs: 5 }
    }
}

/// Load a config file. A named file that is missing or malformed is an error.
pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub task: Option<String>,
    pub time: Option<String>,
    pub port: Option<u16>,
    pub local: Option<bool>,
    pub stealth: bool,
    pub onetime: bool,
    pub reset_url: Option<String>,
    pub restart_url: Option<String>,
    pub redir_url: Option<String>,
}

/// Fully resolved, immutable configuration built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub task: String,
    pub deadline: Deadline,
    pub port: u16,
    pub local: bool,
    pub stealth: bool,
    pub onetime: bool,
    pub reset_path: String,
    pub restart_path: String,
    pub redirect: Option<String>,
    pub shutdown_grace: Duration,
}

impl Settings {
    /// Merge CLI overrides over file values over defaults, then validate.
    ///
    /// Every problem is reported, not just the first one.
    pub fn resolve(cli: Overrides, file: FileConfig) -> Result<Self, ConfigError> {
        let section = file.watchdog;
        let mut errors = Vec::new();

        let task = cli
            .task
            .or(section.task)
            .filter(|t| !t.trim().is_empty());
        if task.is_none() {
            errors.push(ConfigError::MissingTask);
        }

        let deadline = match cli.time.or(section.time) {
            Some(value) => Deadline::parse(&value).map_err(|e| errors.push(e)).ok(),
            None => {
                errors.push(ConfigError::MissingDuration);
                None
            }
        };

        let redirect = match cli.redir_url.or(section.redir_url) {
            Some(value) if !value.trim().is_empty() => {
                parse_redirect(&value).map_err(|e| errors.push(e)).ok()
            }
            _ => None,
        };

        let onetime = cli.onetime || section.onetime.unwrap_or(false);
        let reset_path = normalize_path(
            &cli.reset_url
                .or(section.reset_url)
                .unwrap_or_else(|| DEFAULT_RESET_PATH.to_string()),
        );
        let restart_path = normalize_path(
            &cli.restart_url
                .or(section.restart_url)
                .unwrap_or_else(|| DEFAULT_RESTART_PATH.to_string()),
        );
        if !onetime && reset_path == restart_path {
            errors.push(ConfigError::PathConflict(reset_path.clone()));
        }

        match (task, deadline) {
            (Some(task), Some(deadline)) if errors.is_empty() => Ok(Self {
                task,
                deadline,
                port: cli.port.or(section.port).unwrap_or(DEFAULT_PORT),
                local: cli.local.or(section.local).unwrap_or(true),
                stealth: cli.stealth || section.stealth.unwrap_or(false),
                onetime,
                reset_path,
                restart_path,
                redirect: redirect.flatten(),
                shutdown_grace: Duration::from_secs(file.shutdown.grace_secs),
            }),
            _ if errors.len() == 1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }

    /// Listen address: loopback only unless `local` is off.
    pub fn listen_addr(&self) -> String {
        if self.local {
            format!("127.0.0.1:{}", self.port)
        } else {
            format!("0.0.0.0:{}", self.port)
        }
    }
}

/// Ensure a URL path begins and ends with `/`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 2);
    if !path.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(path);
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// Validate a redirect target.
///
/// Absolute URLs are returned in canonical form. Relative references such as
/// `/status/` are accepted as written if they resolve against a base URL.
pub fn parse_redirect(value: &str) -> Result<Option<String>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = |source| ConfigError::InvalidRedirect {
        value: value.to_string(),
        source,
    };
    match url::Url::parse(value) {
        Ok(url) => Ok(Some(url.to_string())),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = url::Url::parse("http://localhost/").map_err(invalid)?;
            let resolved = base.join(value).map_err(invalid)?;
            // Keep the caller's relative form, percent-encoded the way the join did.
            let mut relative = resolved.path().to_string();
            if let Some(query) = resolved.query() {
                relative.push('?');
                relative.push_str(query);
            }
            if let Some(fragment) = resolved.fragment() {
                relative.push('#');
                relative.push_str(fragment);
            }
            if value.starts_with('/') {
                Ok(Some(relative))
            } else {
                Ok(Some(value.to_string()))
            }
        }
        Err(e) => Err(invalid(e)),
    }
}

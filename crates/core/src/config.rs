use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

/// Overrides `github.token` so the credential can stay out of the file.
pub const GITHUB_TOKEN_ENV: &str = "REPODROP_GITHUB_TOKEN";

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_AUTHOR_NAME: &str = "repodrop";
pub const DEFAULT_AUTHOR_EMAIL: &str = "repodrop@users.noreply.github.com";
pub const DEFAULT_COMMIT_MESSAGE: &str = "Sync from archive";

/// Hard ceiling on archive size (50 MiB).
pub const MAX_ARCHIVE_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub github: GitHubSettings,
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubSettings {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub max_archive_bytes: u64,
    pub timeout_secs: u64,
    pub idle_reset_secs: u64,
    /// Files per batch; the burst counter is reset between batches.
    pub batch_size: u32,
    pub default_commit_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub burst_size: u32,
    pub burst_step_ms: u64,
    pub max_burst_delay_ms: u64,
    pub max_retries: u32,
    pub default_retry_after_ms: u64,
}

/// Per-project override of the default target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProjectTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: default_api_base(),
            owner: String::new(),
            repo: String::new(),
            branch: default_branch(),
        }
    }
}

impl Default for Author {
    fn default() -> Self {
        Self {
            name: DEFAULT_AUTHOR_NAME.to_string(),
            email: DEFAULT_AUTHOR_EMAIL.to_string(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_archive_bytes: MAX_ARCHIVE_BYTES,
            timeout_secs: 300,
            idle_reset_secs: 5,
            batch_size: 10,
            default_commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            burst_size: 10,
            burst_step_ms: 100,
            max_burst_delay_ms: 2_000,
            max_retries: 5,
            default_retry_after_ms: 60_000,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            github: GitHubSettings::default(),
            author: Author::default(),
            sync: SyncSettings::default(),
            rate_limit: RateLimitSettings::default(),
            projects: BTreeMap::new(),
        }
    }
}

impl SyncSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn idle_reset_delay(&self) -> Duration {
        Duration::from_secs(self.idle_reset_secs)
    }
}

impl Settings {
    /// Hash of every field a pipeline is built from; equal fingerprints mean
    /// an existing pipeline can be kept.
    pub fn fingerprint(&self) -> String {
        let encoded = toml::to_string(self).unwrap_or_default();
        blake3::hash(encoded.as_bytes()).to_hex().to_string()
    }

    /// Whether a pipeline can be built at all. Owner and repository are
    /// checked per sync since projects may supply them.
    pub fn check_ready(&self) -> Result<()> {
        if self.github.token.trim().is_empty() {
            return Err(Error::NotReady {
                message: "github token is not configured".to_string(),
            });
        }
        Ok(())
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(v) = std::env::var("REPODROP_CONFIG_DIR") {
        return PathBuf::from(v);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("repodrop")
}

pub fn default_data_dir() -> PathBuf {
    if let Ok(v) = std::env::var("REPODROP_DATA_DIR") {
        return PathBuf::from(v);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("repodrop")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    let mut settings = if path.exists() {
        let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
            message: format!("config read failed: {e}"),
        })?;
        parse_settings(&text).map_err(|e| Error::InvalidConfig {
            message: format!("config invalid: {e}"),
        })?
    } else {
        Settings::default()
    };

    if let Ok(token) = std::env::var(GITHUB_TOKEN_ENV)
        && !token.trim().is_empty()
    {
        settings.github.token = token.trim().to_string();
    }
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => {
            let mut s = toml::from_str::<Settings>(text)?;
            normalize_settings(&mut s);
            Ok(s)
        }
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings version")),
    }
}

fn normalize_settings(settings: &mut Settings) {
    settings.github.token = settings.github.token.trim().to_string();
    settings.github.owner = settings.github.owner.trim().to_string();
    settings.github.repo = settings.github.repo.trim().to_string();
    settings.github.branch = settings.github.branch.trim().to_string();
    settings.github.api_base = settings.github.api_base.trim_end_matches('/').to_string();
    if settings.github.branch.is_empty() {
        settings.github.branch = default_branch();
    }
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })?;

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    let base = settings.github.api_base.trim();
    if !(base.starts_with("https://") || base.starts_with("http://")) {
        return Err(Error::InvalidConfig {
            message: "github.api_base must be an http(s) url".to_string(),
        });
    }
    if !is_valid_branch_name(&settings.github.branch) {
        return Err(Error::InvalidConfig {
            message: format!("github.branch is not a valid branch name: {:?}", settings.github.branch),
        });
    }

    if settings.sync.max_archive_bytes == 0 || settings.sync.max_archive_bytes > MAX_ARCHIVE_BYTES {
        return Err(Error::InvalidConfig {
            message: format!("sync.max_archive_bytes must be in 1..={MAX_ARCHIVE_BYTES}"),
        });
    }
    if settings.sync.timeout_secs == 0 {
        return Err(Error::InvalidConfig {
            message: "sync.timeout_secs must be > 0".to_string(),
        });
    }
    if settings.sync.batch_size == 0 {
        return Err(Error::InvalidConfig {
            message: "sync.batch_size must be >= 1".to_string(),
        });
    }
    if settings.author.name.trim().is_empty() || !settings.author.email.contains('@') {
        return Err(Error::InvalidConfig {
            message: "author.name must be set and author.email must be an email address"
                .to_string(),
        });
    }

    if settings.rate_limit.burst_size == 0 {
        return Err(Error::InvalidConfig {
            message: "rate_limit.burst_size must be >= 1".to_string(),
        });
    }
    if settings.rate_limit.burst_step_ms > settings.rate_limit.max_burst_delay_ms {
        return Err(Error::InvalidConfig {
            message: "rate_limit.burst_step_ms must be <= rate_limit.max_burst_delay_ms"
                .to_string(),
        });
    }

    for (id, project) in &settings.projects {
        if id.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "projects keys must not be empty".to_string(),
            });
        }
        if project.repo.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: format!("projects.{id}.repo must not be empty"),
            });
        }
        if let Some(branch) = &project.branch
            && !is_valid_branch_name(branch)
        {
            return Err(Error::InvalidConfig {
                message: format!("projects.{id}.branch is not a valid branch name"),
            });
        }
    }

    Ok(())
}

fn is_valid_branch_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

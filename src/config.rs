//! Configuration for cowork.
//!
//! Settings are read from `.cowork/cowork.toml` and layered
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! data_dir = ".cowork/data"
//!
//! [workspaces]
//! root = ".cowork/workspaces"
//!
//! [lease]
//! ttl_secs = 600
//! watchdog_interval_secs = 30
//! holder_id = "driver-a"          # optional
//!
//! [github]
//! api_url = "https://api.github.com"
//! token_env = "GITHUB_TOKEN"
//!
//! [defaults]
//! base_branch = "main"
//! sync_strategy = "rebase"
//! max_retries = 3
//! timeout_minutes = 60
//! draft_pr = false
//!
//! [log]
//! level = "info"
//! json = false
//! dir = ".cowork/logs"            # optional
//! ```
//!
//! Environment overrides: `COWORK_DATA_DIR`, `COWORK_LEASE_TTL_SECS`,
//! `COWORK_HOLDER_ID`, `COWORK_LOG`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cowork::github::{DEFAULT_API_URL, is_valid_github_token};
use crate::logging::LogSettings;
use crate::workflow::models::{SyncStrategy, WorkflowConfig};

pub const CONFIG_DIR: &str = ".cowork";
pub const CONFIG_FILE: &str = "cowork.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".cowork/data")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspacesSection {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".cowork/workspaces")
}

impl Default for WorkspacesSection {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSection {
    /// How long a lease is valid without being released
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// How often the watchdog sweeps expired leases
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// Fixed holder identifier (defaults to one generated per process)
    #[serde(default)]
    pub holder_id: Option<String>,
}

fn default_ttl_secs() -> u64 {
    600
}

fn default_watchdog_interval_secs() -> u64 {
    30
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            holder_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Name of the environment variable holding the token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
        }
    }
}

/// Defaults applied to newly created workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub sync_strategy: SyncStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: i32,
    #[serde(default)]
    pub draft_pr: bool,
    #[serde(default)]
    pub auto_merge: bool,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_max_retries() -> i32 {
    3
}

fn default_timeout_minutes() -> i32 {
    60
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            sync_strategy: SyncStrategy::default(),
            max_retries: default_max_retries(),
            timeout_minutes: default_timeout_minutes(),
            draft_pr: false,
            auto_merge: false,
        }
    }
}

impl DefaultsSection {
    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            sync_strategy: self.sync_strategy,
            max_retries: self.max_retries,
            timeout_minutes: self.timeout_minutes,
            draft_pr: self.draft_pr,
            auto_merge: self.auto_merge,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit console logs as JSON
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rotated JSON logs here
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

/// Parsed `cowork.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoworkToml {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub workspaces: WorkspacesSection,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub log: LogSection,
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl CoworkToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cowork.toml")
    }

    /// Load `cowork.toml` from `cowork_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(cowork_dir: &Path) -> Result<Self> {
        let config_path = cowork_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cowork.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.lease.ttl_secs == 0 {
            warnings.push("lease.ttl_secs is 0: every lease expires immediately".to_string());
        }
        if self.lease.watchdog_interval_secs == 0 {
            warnings.push("lease.watchdog_interval_secs is 0: the watchdog would spin".to_string());
        }
        if let Some(holder) = &self.lease.holder_id
            && holder.trim().is_empty()
        {
            warnings.push("lease.holder_id is empty".to_string());
        }
        if self.defaults.base_branch.trim().is_empty() {
            warnings.push("defaults.base_branch is empty".to_string());
        }
        if let Err(e) = self.defaults.workflow_config().validate() {
            warnings.push(format!("defaults: {}", e));
        }
        if !LOG_LEVELS.contains(&self.log.level.to_lowercase().as_str()) {
            warnings.push(format!(
                "Invalid log level '{}'. Valid values: {}",
                self.log.level,
                LOG_LEVELS.join(", ")
            ));
        }

        warnings
    }
}

/// CLI flags that override file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub holder_id: Option<String>,
    pub verbose: bool,
}

/// Resolved configuration: file → environment → CLI.
#[derive(Debug, Clone)]
pub struct CoworkConfig {
    pub project_dir: PathBuf,
    pub toml: CoworkToml,
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub lease_ttl: Duration,
    pub watchdog_interval: Duration,
    pub holder_id: String,
    pub log: LogSettings,
}

impl CoworkConfig {
    /// Resolve against the process environment.
    pub fn load(project_dir: &Path, cli: &CliOverrides) -> Result<Self> {
        Self::load_with_env(project_dir, cli, |key| std::env::var(key).ok())
    }

    pub fn load_with_env(
        project_dir: &Path,
        cli: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let toml = match &cli.config_path {
            Some(path) => CoworkToml::load(path)?,
            None => CoworkToml::load_or_default(&project_dir.join(CONFIG_DIR))?,
        };
        Self::resolve(project_dir, toml, cli, env)
    }

    pub fn resolve(
        project_dir: &Path,
        toml: CoworkToml,
        cli: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let absolute = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                project_dir.join(p)
            }
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| env("COWORK_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| toml.store.data_dir.clone());

        let ttl_secs = match env("COWORK_LEASE_TTL_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("Invalid COWORK_LEASE_TTL_SECS '{}'", raw))?,
            None => toml.lease.ttl_secs,
        };

        let holder_id = cli
            .holder_id
            .clone()
            .or_else(|| env("COWORK_HOLDER_ID"))
            .or_else(|| toml.lease.holder_id.clone())
            .unwrap_or_else(default_holder_id);

        let level = if cli.verbose {
            "debug".to_string()
        } else {
            env("COWORK_LOG").unwrap_or_else(|| toml.log.level.clone())
        };
        let log = LogSettings {
            level,
            json: toml.log.json,
            dir: toml.log.dir.as_deref().map(absolute),
        };

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            data_dir: absolute(&data_dir),
            workspace_root: absolute(&toml.workspaces.root),
            lease_ttl: Duration::from_secs(ttl_secs),
            watchdog_interval: Duration::from_secs(toml.lease.watchdog_interval_secs),
            holder_id,
            log,
            toml,
        })
    }

    /// The GitHub token, read fresh from the configured variable.
    pub fn github_token(&self) -> Option<String> {
        std::env::var(&self.toml.github.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn workflow_defaults(&self) -> WorkflowConfig {
        self.toml.defaults.workflow_config()
    }

    /// File warnings plus checks that need the environment.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if self.lease_ttl.is_zero() && self.toml.lease.ttl_secs != 0 {
            warnings.push(
                "COWORK_LEASE_TTL_SECS is 0: every lease expires immediately".to_string(),
            );
        }
        match self.github_token() {
            Some(token) if !is_valid_github_token(&token) => warnings.push(format!(
                "${} does not look like a GitHub token",
                self.toml.github.token_env
            )),
            Some(_) => {}
            None => warnings.push(format!(
                "${} is not set; GitHub requests will be unauthenticated",
                self.toml.github.token_env
            )),
        }
        warnings
    }
}

fn default_holder_id() -> String {
    format!("cowork-{}-{}", std::process::id(), uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let toml = CoworkToml::parse("").unwrap();
        assert_eq!(toml.store.data_dir, PathBuf::from(".cowork/data"));
        assert_eq!(toml.lease.ttl_secs, 600);
        assert_eq!(toml.lease.watchdog_interval_secs, 30);
        assert_eq!(toml.github.api_url, "https://api.github.com");
        assert_eq!(toml.defaults.base_branch, "main");
        assert_eq!(toml.defaults.sync_strategy, SyncStrategy::Rebase);
        assert_eq!(toml.log.level, "info");
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let content = r#"
[store]
data_dir = "/var/lib/cowork"

[lease]
ttl_secs = 120
holder_id = "driver-a"

[defaults]
base_branch = "develop"
sync_strategy = "merge"
draft_pr = true

[log]
level = "debug"
json = true
"#;
        let toml = CoworkToml::parse(content).unwrap();
        assert_eq!(toml.lease.ttl_secs, 120);
        assert_eq!(toml.lease.watchdog_interval_secs, 30);
        assert_eq!(toml.lease.holder_id.as_deref(), Some("driver-a"));
        let wf = toml.defaults.workflow_config();
        assert_eq!(wf.sync_strategy, SyncStrategy::Merge);
        assert!(wf.draft_pr);
        assert_eq!(wf.max_retries, 3);
        assert!(toml.log.json);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(CoworkToml::parse("[lease\nttl_secs = 1").is_err());
        assert!(CoworkToml::parse("[defaults]\nsync_strategy = \"squash\"").is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let content = r#"
[lease]
ttl_secs = 0
watchdog_interval_secs = 0

[defaults]
max_retries = -1

[log]
level = "loud"
"#;
        let warnings = CoworkToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 4);
        assert!(warnings.iter().any(|w| w.contains("ttl_secs")));
        assert!(warnings.iter().any(|w| w.contains("watchdog_interval_secs")));
        assert!(warnings.iter().any(|w| w.contains("max_retries")));
        assert!(warnings.iter().any(|w| w.contains("loud")));
    }

    #[test]
    fn test_resolve_relative_paths_against_project() {
        let config = CoworkConfig::resolve(
            Path::new("/srv/project"),
            CoworkToml::default(),
            &CliOverrides::default(),
            no_env,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/project/.cowork/data"));
        assert_eq!(
            config.workspace_root,
            PathBuf::from("/srv/project/.cowork/workspaces")
        );
        assert_eq!(config.lease_ttl, Duration::from_secs(600));
        assert!(config.holder_id.starts_with("cowork-"));
    }

    #[test]
    fn test_env_overrides_file_and_cli_overrides_env() {
        let mut toml = CoworkToml::default();
        toml.lease.holder_id = Some("from-file".into());
        let env: HashMap<&str, &str> = [
            ("COWORK_DATA_DIR", "/env/data"),
            ("COWORK_LEASE_TTL_SECS", "45"),
            ("COWORK_HOLDER_ID", "from-env"),
            ("COWORK_LOG", "warn"),
        ]
        .into_iter()
        .collect();
        let lookup = |k: &str| env.get(k).map(|v| v.to_string());

        let config =
            CoworkConfig::resolve(Path::new("/p"), toml.clone(), &CliOverrides::default(), lookup)
                .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/env/data"));
        assert_eq!(config.lease_ttl, Duration::from_secs(45));
        assert_eq!(config.holder_id, "from-env");
        assert_eq!(config.log.level, "warn");

        let cli = CliOverrides {
            data_dir: Some(PathBuf::from("cli-data")),
            holder_id: Some("from-cli".into()),
            verbose: true,
            ..Default::default()
        };
        let config = CoworkConfig::resolve(Path::new("/p"), toml, &cli, lookup).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/p/cli-data"));
        assert_eq!(config.holder_id, "from-cli");
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_invalid_ttl_env_is_error() {
        let result = CoworkConfig::resolve(
            Path::new("/p"),
            CoworkToml::default(),
            &CliOverrides::default(),
            |k| (k == "COWORK_LEASE_TTL_SECS").then(|| "ten".to_string()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_project_dir_and_explicit_path() {
        let dir = tempdir().unwrap();
        let cowork_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&cowork_dir).unwrap();
        std::fs::write(cowork_dir.join(CONFIG_FILE), "[lease]\nttl_secs = 5\n").unwrap();

        let config =
            CoworkConfig::load_with_env(dir.path(), &CliOverrides::default(), no_env).unwrap();
        assert_eq!(config.lease_ttl, Duration::from_secs(5));

        let other = dir.path().join("other.toml");
        std::fs::write(&other, "[lease]\nttl_secs = 9\n").unwrap();
        let cli = CliOverrides {
            config_path: Some(other),
            ..Default::default()
        };
        let config = CoworkConfig::load_with_env(dir.path(), &cli, no_env).unwrap();
        assert_eq!(config.lease_ttl, Duration::from_secs(9));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = CoworkToml::default();
        toml.defaults.draft_pr = true;
        toml.save(&path).unwrap();
        let loaded = CoworkToml::load(&path).unwrap();
        assert!(loaded.defaults.draft_pr);
    }
}

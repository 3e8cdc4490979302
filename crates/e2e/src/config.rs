//! Harness configuration

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::retry::RetryPolicy;

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Application tree to publish and deploy
    pub application_path: PathBuf,

    /// Reserved port range for variations
    pub ports: PortConfig,

    /// Retry policy for the initial probe
    pub retry: RetryPolicy,

    /// Host startup and shutdown timing
    pub startup: StartupConfig,

    /// Database provisioning
    pub database: DatabaseConfig,

    /// Publish step
    pub publish: PublishConfig,

    /// Host launch commands
    pub launch: LaunchConfig,

    /// Response validation
    pub validation: ValidationConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            application_path: PathBuf::from("samples/storefront"),
            ports: PortConfig::default(),
            retry: RetryPolicy::default(),
            startup: StartupConfig::default(),
            database: DatabaseConfig::default(),
            publish: PublishConfig::default(),
            launch: LaunchConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub range_start: u16,
    pub range_end: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            range_start: 5025,
            range_end: 5039,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// How long a host may take to accept connections
    pub timeout_secs: u64,

    /// Readiness poll interval
    pub poll_interval_ms: u64,

    /// Time between SIGTERM and a forced kill
    pub shutdown_grace_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            poll_interval_ms: 100,
            shutdown_grace_ms: 500,
        }
    }
}

impl StartupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding one database file per variation
    pub directory: PathBuf,

    /// Connection string with `{dir}` and `{name}` placeholders
    pub connection_string_template: String,

    /// Environment variable the application reads its connection string from
    pub connection_string_key: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("storefront-e2e-db"),
            connection_string_template: "Data Source={dir}/{name}.db".to_string(),
            connection_string_key: "SQLAZURECONNSTR_DefaultConnection".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherKind {
    /// Copy the application tree, honoring exclusions
    Directory,
    /// Delegate to an external publish tool
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub kind: PublisherKind,

    /// External tool, used when `kind = "command"`. Placeholders: `{app}`, `{out}`
    pub command: Option<CommandTemplate>,

    /// Arguments appended when publishing without source
    pub no_source_args: Vec<String>,

    /// Argument preceding each exclusion glob
    pub exclude_flag: String,

    /// Extensions treated as source and dropped by no-source publishes
    pub source_extensions: Vec<String>,

    /// Extension of platform launcher scripts that must not be published
    pub launcher_script_extension: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            kind: PublisherKind::Directory,
            command: None,
            no_source_args: vec!["--no-source".to_string()],
            exclude_flag: "--exclude".to_string(),
            source_extensions: vec!["cs".to_string(), "cshtml".to_string(), "rs".to_string()],
            launcher_script_extension: "cmd".to_string(),
        }
    }
}

/// Program plus arguments, with `{placeholder}` substitution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Substitute `{key}` placeholders in the program and every argument
    pub fn render(&self, vars: &HashMap<&str, String>) -> (String, Vec<String>) {
        let program = substitute(&self.program, vars);
        let args = self.args.iter().map(|a| substitute(a, vars)).collect();
        (program, args)
    }
}

pub(crate) fn substitute(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Used by `standalone` and `http_listener`.
    /// Placeholders: `{path}`, `{url}`, `{port}`, `{server}`, `{flavor}`, `{arch}`
    pub self_host: CommandTemplate,

    /// Used by `in_process_host`
    pub in_process_host: CommandTemplate,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            self_host: CommandTemplate::new(
                "{path}/web",
                &["--server", "{server}", "--urls", "{url}"],
            ),
            in_process_host: CommandTemplate::new(
                "apphost",
                &["--path", "{path}", "--port", "{port}"],
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Fragments that must all appear on the landing page
    pub home_page_markers: Vec<String>,

    /// Static assets that must be served, relative to the base URI
    pub static_assets: Vec<String>,

    /// Re-request the first asset with its ETag and expect 304
    pub verify_etag: bool,

    pub request_timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            home_page_markers: vec![
                "<title>Home Page – Storefront</title>".to_string(),
                "<a href=\"/\">Home</a>".to_string(),
                "/Images/home-showcase.png".to_string(),
                "Register".to_string(),
                "Login".to_string(),
            ],
            static_assets: vec!["favicon.ico".to_string(), "Content/site.css".to_string()],
            verify_etag: true,
            request_timeout_secs: 30,
        }
    }
}

impl ValidationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| HarnessError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.ports.range_start == 0 || self.ports.range_start > self.ports.range_end {
            return Err(HarnessError::Config(format!(
                "invalid port range {}-{}",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(HarnessError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.publish.kind == PublisherKind::Command && self.publish.command.is_none() {
            return Err(HarnessError::Config(
                "publish.kind = \"command\" requires publish.command".into(),
            ));
        }
        if !self.database.connection_string_template.contains("{name}") {
            return Err(HarnessError::Config(
                "database.connection_string_template must contain {name}".into(),
            ));
        }
        Ok(())
    }
}

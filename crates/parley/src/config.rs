//! Layered configuration: built-in defaults, then the TOML file, then `PARLEY__*`
//! environment variables.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::info;
use parley_protocol::ChatOptions;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "parley";

/// Where configuration and state live on disk.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub cache_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            cache_dir: default_cache_dir()?,
        })
    }

    /// Location of the cached voice-actor catalog.
    pub fn actor_cache_file(&self) -> PathBuf {
        self.cache_dir.join("voice-actors.json")
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, cache: {}",
            self.config_file.display(),
            self.cache_dir.display()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub sessions: SessionsConfig,
    pub narration: NarrationConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Deployment flavour; controls whether error responses carry diagnostic detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEnvironment {
    #[default]
    Development,
    Production,
}

impl RunEnvironment {
    pub fn is_development(&self) -> bool {
        matches!(self, RunEnvironment::Development)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: RunEnvironment,
    /// Allowed CORS origins. Empty means the local development defaults.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            environment: RunEnvironment::Development,
            cors_origins: Vec::new(),
        }
    }
}

/// How the coding-agent CLI is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable, looked up on `PATH` when not absolute.
    pub binary: String,
    pub default_model: Option<String>,
    /// Arguments appended to every invocation.
    pub extra_args: Vec<String>,
    /// How long a cancelled agent may keep running after SIGINT before it is killed.
    pub cancel_grace_ms: u64,
    /// Extra environment for the agent process.
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            default_model: None,
            extra_args: Vec::new(),
            cancel_grace_ms: 3000,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Idle time after which a placeholder session that never received a durable
    /// identity is dropped.
    pub placeholder_ttl_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            placeholder_ttl_secs: 600,
            reap_interval_secs: 60,
        }
    }
}

impl SessionsConfig {
    pub fn placeholder_ttl(&self) -> Duration {
        Duration::from_secs(self.placeholder_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    /// Base URL of the voice generation API.
    pub base_url: String,
    pub timeout_secs: u64,
    pub default_format: String,
    pub default_speed: f32,
    /// Upper bound on concurrent generations in the client queue; 0 means unbounded.
    pub max_parallel_generations: usize,
    /// Spell out upper-case acronyms before generation.
    pub spell_out_acronyms: bool,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.nijivoice.com/api/platform/v1".to_string(),
            timeout_secs: 60,
            default_format: "wav".to_string(),
            default_speed: 1.0,
            max_parallel_generations: 4,
            spell_out_acronyms: true,
        }
    }
}

/// Settings for `parley chat` and the other client commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub narration_api_key: Option<String>,
    pub actor_id: Option<String>,
    /// Player invocation; the audio file path is appended as the last argument.
    pub player_command: Vec<String>,
    pub inter_item_delay_ms: u64,
    pub actor_cache_ttl_secs: u64,
    /// Defaults merged into every chat request.
    pub options: ChatOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".to_string(),
            narration_api_key: None,
            actor_id: None,
            player_command: vec![
                "ffplay".to_string(),
                "-nodisp".to_string(),
                "-autoexit".to_string(),
                "-loglevel".to_string(),
                "quiet".to_string(),
            ],
            inter_item_delay_ms: 500,
            actor_cache_ttl_secs: 24 * 60 * 60,
            options: ChatOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Narration runs only when both a credential and a voice are configured.
    pub fn narration_enabled(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.narration_api_key) && present(&self.actor_id)
    }
}

/// Load the effective configuration, writing the default file first if missing.
pub fn load_or_init(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default(&paths.config_file)?;
        }
    }
    load(&paths.config_file)
}

/// Load configuration from `path` (optional) and the environment.
pub fn load(path: &Path) -> Result<AppConfig> {
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()
        .with_context(|| format!("reading configuration from {}", path.display()))?;

    let config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;
    Ok(config)
}

pub fn write_default(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push_str("\n\n");
    buffer
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_cache_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::cache_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".cache").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine cache directory"))
}

/// `PARLEY`, so `PARLEY__SERVER__PORT=8080` overrides `server.port`.
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Configuration for parley"));

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.server.port, 3000);
        assert_eq!(loaded.agent.binary, "claude");
        assert_eq!(loaded.sessions.placeholder_ttl_secs, 600);
        assert_eq!(loaded.client.inter_item_delay_ms, 500);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nport = 9123\nenvironment = \"production\"\n\n[client]\nactor_id = \"a1\"\nnarration_api_key = \"k\"\n",
        )
        .unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.server.port, 9123);
        assert_eq!(loaded.server.environment, RunEnvironment::Production);
        assert_eq!(loaded.server.host, "127.0.0.1");
        assert!(loaded.client.narration_enabled());
    }

    #[test]
    fn test_narration_requires_key_and_actor() {
        let mut client = ClientConfig::default();
        assert!(!client.narration_enabled());
        client.narration_api_key = Some("key".into());
        assert!(!client.narration_enabled());
        client.actor_id = Some("  ".into());
        assert!(!client.narration_enabled());
        client.actor_id = Some("a1".into());
        assert!(client.narration_enabled());
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "PARLEY");
    }
}

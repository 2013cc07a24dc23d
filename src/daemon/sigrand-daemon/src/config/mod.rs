//! Configuration management
//! Follows SRP: Only handles configuration loading, overriding and validation

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sigrand_core::{Separator, DEFAULT_SEPARATOR};
use tracing::{debug, info};

/// Environment variables that override file configuration
pub const ENV_SOURCE: &str = "SIGRAND_SOURCE";
pub const ENV_FIFO: &str = "SIGRAND_FIFO";
pub const ENV_LOCK: &str = "SIGRAND_LOCK";
pub const ENV_SEPARATOR: &str = "SIGRAND_SEPARATOR";
pub const ENV_SEED: &str = "SIGRAND_SEED";

/// Main daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub paths: PathsConfig,
    pub selection: SelectionConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Filesystem locations; `~` is expanded against `$HOME`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Signature file, entries separated by the separator line
    pub source: String,
    /// Pre-existing named pipe readers open
    pub fifo: String,
    /// Lock file holding the daemon pid
    pub lock: String,
}

/// Entry selection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Line that terminates each entry
    pub separator: String,
    /// Fixed generator seed; seeded from the clock when absent
    pub seed: Option<u64>,
}

/// Serve loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Pause after each served reader in milliseconds
    pub pause_ms: u64,
    /// How often to retry opening the pipe while no reader is present
    pub poll_interval_ms: u64,
    /// Enable Prometheus metrics endpoint
    pub enable_metrics: bool,
    /// Metrics port
    pub metrics_port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source: "~/.sigfile".to_string(),
            fifo: "~/.signature".to_string(),
            lock: "~/.sigrandpid".to_string(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
            seed: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pause_ms: 200,
            poll_interval_ms: 50,
            enable_metrics: false,
            metrics_port: 9091,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl PathsConfig {
    pub fn source_path(&self) -> PathBuf {
        expand(&self.source)
    }

    pub fn fifo_path(&self) -> PathBuf {
        expand(&self.fifo)
    }

    pub fn lock_path(&self) -> PathBuf {
        expand(&self.lock)
    }
}

impl ServerConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SelectionConfig {
    pub fn separator(&self) -> Result<Separator> {
        Separator::new(self.separator.as_str()).map_err(Into::into)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Default location of the configuration file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sigrand")
        .join("sigrand.toml")
}

/// Configuration manager: layers defaults, file, environment and overrides
#[derive(Debug, Default)]
pub struct ConfigManager {
    config: DaemonConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Create a new configuration manager holding the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from file
    pub async fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let config_str = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        self.config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        self.config_path = Some(path.to_path_buf());

        info!("Loaded configuration from: {}", path.display());
        Ok(())
    }

    /// Save current configuration to file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let config_str = toml::to_string_pretty(&self.config)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, config_str)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Apply `SIGRAND_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production)
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(source) = lookup(ENV_SOURCE) {
            debug!("{} overrides source path", ENV_SOURCE);
            self.config.paths.source = source;
        }
        if let Some(fifo) = lookup(ENV_FIFO) {
            debug!("{} overrides fifo path", ENV_FIFO);
            self.config.paths.fifo = fifo;
        }
        if let Some(lock) = lookup(ENV_LOCK) {
            debug!("{} overrides lock path", ENV_LOCK);
            self.config.paths.lock = lock;
        }
        if let Some(separator) = lookup(ENV_SEPARATOR) {
            self.config.selection.separator = separator;
        }
        if let Some(seed) = lookup(ENV_SEED) {
            let seed = seed
                .trim()
                .parse()
                .with_context(|| format!("{ENV_SEED} must be an unsigned integer, got {seed:?}"))?;
            self.config.selection.seed = Some(seed);
        }
        Ok(())
    }

    /// Get current configuration
    pub fn get_config(&self) -> DaemonConfig {
        self.config.clone()
    }

    /// Mutable access for command-line overrides
    pub fn config_mut(&mut self) -> &mut DaemonConfig {
        &mut self.config
    }

    /// Path of the loaded configuration file, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Validate configuration
    pub fn validate(config: &DaemonConfig) -> Result<()> {
        config
            .selection
            .separator()
            .context("Invalid selection.separator")?;

        for (name, value) in [
            ("source", &config.paths.source),
            ("fifo", &config.paths.fifo),
            ("lock", &config.paths.lock),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("paths.{name} must not be empty");
            }
        }

        if config.server.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be > 0");
        }

        if config.server.enable_metrics && config.server.metrics_port == 0 {
            anyhow::bail!("Invalid metrics port: {}", config.server.metrics_port);
        }

        match config.logging.format.as_str() {
            "pretty" | "compact" => {}
            other => anyhow::bail!("Unknown logging.format {other:?} (expected pretty or compact)"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_config_load() {
        let mut temp_file = NamedTempFile::new().unwrap();

        let config_toml = r#"
[paths]
source = "/srv/quotes"
fifo = "/tmp/sig"

[selection]
separator = "--"
seed = 17

[server]
pause_ms = 10
"#;

        temp_file.write_all(config_toml.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let mut manager = ConfigManager::new();
        manager.load_from_file(temp_file.path()).await.unwrap();

        let config = manager.get_config();
        assert_eq!(config.paths.source_path(), PathBuf::from("/srv/quotes"));
        assert_eq!(config.paths.fifo_path(), PathBuf::from("/tmp/sig"));
        // unspecified keys keep their defaults
        assert_eq!(config.paths.lock, "~/.sigrandpid");
        assert_eq!(config.selection.separator, "--");
        assert_eq!(config.selection.seed, Some(17));
        assert_eq!(config.server.pause(), Duration::from_millis(10));
        assert_eq!(config.server.poll_interval_ms, 50);
        assert_eq!(manager.config_path(), Some(temp_file.path()));
    }

    #[tokio::test]
    async fn test_config_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sigrand.toml");

        let mut manager = ConfigManager::new();
        manager.config_mut().server.pause_ms = 500;
        manager.save_to_file(&path).await.unwrap();

        let mut reloaded = ConfigManager::new();
        reloaded.load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.get_config(), manager.get_config());
    }

    #[tokio::test]
    async fn test_config_rejects_bad_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[server\npause_ms = ").unwrap();

        let mut manager = ConfigManager::new();
        assert!(manager.load_from_file(temp_file.path()).await.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_SOURCE, "/a/source"),
            (ENV_FIFO, "/a/fifo"),
            (ENV_LOCK, "/a/lock"),
            (ENV_SEPARATOR, "##"),
            (ENV_SEED, " 99 "),
        ]
        .into_iter()
        .collect();

        let mut manager = ConfigManager::new();
        manager
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        let config = manager.get_config();
        assert_eq!(config.paths.source, "/a/source");
        assert_eq!(config.paths.fifo, "/a/fifo");
        assert_eq!(config.paths.lock, "/a/lock");
        assert_eq!(config.selection.separator, "##");
        assert_eq!(config.selection.seed, Some(99));
    }

    #[test]
    fn test_env_bad_seed() {
        let mut manager = ConfigManager::new();
        let result = manager.apply_env_from(|key| (key == ENV_SEED).then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let paths = PathsConfig::default();
        let source = paths.source_path();
        assert!(!source.to_string_lossy().starts_with('~'));
        assert!(source.ends_with(".sigfile"));
    }

    #[test]
    fn test_validate() {
        assert!(ConfigManager::validate(&DaemonConfig::default()).is_ok());

        let mut config = DaemonConfig::default();
        config.selection.separator = String::new();
        assert!(ConfigManager::validate(&config).is_err());

        let mut config = DaemonConfig::default();
        config.server.poll_interval_ms = 0;
        assert!(ConfigManager::validate(&config).is_err());

        let mut config = DaemonConfig::default();
        config.server.enable_metrics = true;
        config.server.metrics_port = 0;
        assert!(ConfigManager::validate(&config).is_err());

        let mut config = DaemonConfig::default();
        config.logging.format = "json".to_string();
        assert!(ConfigManager::validate(&config).is_err());
    }
}

//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RELWIRE_CONFIG)
//! 3. Environment variables

use relwire_protocol::{DEFAULT_PORT, MAX_HANDLES, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Worker pool configuration.
    pub pool: PoolConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Wire encryption configuration.
    pub crypt: CryptConfig,
    /// Engine configuration.
    pub engine: EngineConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RELWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.pool.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.crypt.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.pool.validate()?;
        if self.auth.plugins.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.plugins must name at least one plugin".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Oldest protocol version accepted from clients.
    pub min_protocol_version: u32,
    /// Whether clients may negotiate lazy (pipelined) mode.
    pub lazy: bool,
    /// Live handles of one kind allowed per connection.
    pub max_handles: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            lazy: true,
            max_handles: MAX_HANDLES,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RELWIRE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("RELWIRE_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("RELWIRE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(lazy) = std::env::var("RELWIRE_LAZY") {
            self.lazy = lazy == "1" || lazy.to_lowercase() == "true";
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_protocol_version > PROTOCOL_VERSION {
            return Err(ConfigError::ValidationError(format!(
                "min_protocol_version {} is newer than the supported version {}",
                self.min_protocol_version, PROTOCOL_VERSION
            )));
        }
        if self.max_handles == 0 {
            return Err(ConfigError::ValidationError(
                "max_handles must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers kept alive while idle.
    pub min_workers: usize,
    /// Upper bound on live workers.
    pub max_workers: usize,
    /// How long an idle worker waits before it may exit, in milliseconds.
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 16,
            idle_timeout_ms: 60_000,
        }
    }
}

impl PoolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("RELWIRE_MAX_WORKERS") {
            if let Ok(n) = max.parse() {
                self.max_workers = n;
            }
        }

        if let Ok(min) = std::env::var("RELWIRE_MIN_WORKERS") {
            if let Ok(n) = min.parse() {
                self.min_workers = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::ValidationError(
                "pool.min_workers must be at least 1".to_string(),
            ));
        }
        if self.max_workers < self.min_workers {
            return Err(ConfigError::ValidationError(format!(
                "pool.max_workers ({}) is below pool.min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        Ok(())
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Verifier material for one user. Never holds the clear-text password.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSecret {
    /// SCRAM salt, hex encoded.
    pub salt: String,
    /// PBKDF2 iteration count.
    pub iterations: u32,
    /// SCRAM stored key, hex encoded.
    pub stored_key: String,
    /// SCRAM server key, hex encoded.
    pub server_key: String,
    /// Digest checked by the legacy plugin, hex encoded.
    pub legacy_hash: Option<String>,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Plugins the server accepts, in its own preference order.
    pub plugins: Vec<String>,
    /// Known users.
    pub users: BTreeMap<String, UserSecret>,
    /// Failed-login throttle.
    pub throttle: ThrottleConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            plugins: vec!["Scram_Sha256".to_string(), "Legacy_Hash".to_string()],
            users: BTreeMap::new(),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(list) = std::env::var("RELWIRE_AUTH_PLUGINS") {
            let plugins: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !plugins.is_empty() {
                self.plugins = plugins;
            }
        }
    }
}

/// Failed-login throttle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Failures tolerated inside the window before the penalty applies.
    pub failure_limit: u32,
    /// Window over which failures are counted, in seconds.
    pub window_secs: u64,
    /// Delay applied to every further attempt, in milliseconds.
    pub penalty_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            failure_limit: 4,
            window_secs: 10,
            penalty_ms: 2_000,
        }
    }
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn penalty(&self) -> Duration {
        Duration::from_millis(self.penalty_ms)
    }
}

/// Wire encryption level, for either side of the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireCrypt {
    Disabled,
    #[default]
    Enabled,
    Required,
}

impl WireCrypt {
    /// Level as carried in the client identification block.
    pub fn as_u32(self) -> u32 {
        match self {
            WireCrypt::Disabled => 0,
            WireCrypt::Enabled => 1,
            WireCrypt::Required => 2,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(WireCrypt::Disabled),
            1 => Some(WireCrypt::Enabled),
            2 => Some(WireCrypt::Required),
            _ => None,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "disabled" => Some(WireCrypt::Disabled),
            "enabled" => Some(WireCrypt::Enabled),
            "required" => Some(WireCrypt::Required),
            _ => None,
        }
    }
}

/// Wire encryption configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptConfig {
    pub wire_crypt: WireCrypt,
    /// How long an attach waits for the client's database key, in milliseconds.
    pub key_callback_timeout_ms: u64,
}

impl Default for CryptConfig {
    fn default() -> Self {
        Self {
            wire_crypt: WireCrypt::Enabled,
            key_callback_timeout_ms: 5_000,
        }
    }
}

impl CryptConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("RELWIRE_WIRE_CRYPT") {
            if let Some(parsed) = WireCrypt::parse(&level) {
                self.wire_crypt = parsed;
            }
        }
    }

    pub fn key_callback_timeout(&self) -> Duration {
        Duration::from_millis(self.key_callback_timeout_ms)
    }
}

/// A database created when the server starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    /// Key clients must supply through the crypt-key callback.
    #[serde(default)]
    pub key: Option<String>,
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub databases: Vec<DatabaseConfig>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Collect prometheus metrics.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("RELWIRE_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.network.min_protocol_version, MIN_PROTOCOL_VERSION);
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.auth.throttle.failure_limit, 4);
        assert_eq!(config.auth.throttle.penalty(), Duration::from_secs(2));
        assert_eq!(config.crypt.wire_crypt, WireCrypt::Enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.engine.databases.push(DatabaseConfig {
            name: "mydb".to_string(),
            key: Some("secret".to_string()),
        });
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.engine.databases, config.engine.databases);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:4000\"\n  lazy: false\ncrypt:\n  wire_crypt: required\npool:\n  max_workers: 4"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 4000);
        assert!(!config.network.lazy);
        assert_eq!(config.crypt.wire_crypt, WireCrypt::Required);
        assert_eq!(config.pool.max_workers, 4);
        // untouched sections keep their defaults
        assert_eq!(config.pool.min_workers, 1);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relwire.yaml");
        let mut config = Config::default();
        config.auth.plugins = vec!["Legacy_Hash".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.auth.plugins, vec!["Legacy_Hash"]);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.pool.min_workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.pool.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.min_protocol_version = PROTOCOL_VERSION + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.plugins.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wire_crypt_levels() {
        for level in [WireCrypt::Disabled, WireCrypt::Enabled, WireCrypt::Required] {
            assert_eq!(WireCrypt::from_u32(level.as_u32()), Some(level));
        }
        assert_eq!(WireCrypt::from_u32(7), None);
        assert_eq!(WireCrypt::parse("REQUIRED"), Some(WireCrypt::Required));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/relwire.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}

//! Configuration management with validation and defaults
//!
//! Every section has production defaults; a TOML file may override any
//! subset of fields and the command line overrides the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete service configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub game: GameConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub admin: AdminConfig,
}

/// Round timing, house edge and player defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Betting window length in seconds
    pub countdown_secs: u32,
    /// Flight tick interval
    pub tick_interval_ms: u64,
    /// Multiplier increment per tick, in hundredths
    pub tick_step_hundredths: u32,
    /// Pause between crash and the next betting window
    pub cooldown_secs: u64,
    /// Probability of an instant 1.00x crash
    pub house_edge: f64,
    /// Upper bound for generated crash points
    pub max_crash_point: f64,
    /// Balance granted to a player on first contact
    pub starting_balance: f64,
    /// Rounds returned by the history endpoint
    pub history_limit: usize,
    /// Players returned by the leaderboard endpoint
    pub leaderboard_limit: usize,
    /// Capacity of the game loop command queue
    pub command_buffer: usize,
    /// Capacity of the broadcast channel per observer
    pub event_buffer: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            countdown_secs: 10,
            tick_interval_ms: 50,
            tick_step_hundredths: 1,
            cooldown_secs: 3,
            house_edge: 0.03,
            max_crash_point: 10_000.0,
            starting_balance: 0.09,
            history_limit: 20,
            leaderboard_limit: 10,
            command_buffer: 1_024,
            event_buffer: 1_024,
        }
    }
}

impl GameConfig {
    pub fn countdown_tick(&self) -> Duration {
        Duration::from_secs(1)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// HTTP listener configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

/// Storage backend selection
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local maps, lost on restart
    Memory,
    /// RocksDB on disk
    RocksDb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_directory: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::RocksDb,
            data_directory: "./DB/crash_data".to_string(),
        }
    }
}

/// Admin control surface
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Shared secret expected in `adminKey`. Admin routes deny everything
    /// while unset.
    pub secret: Option<String>,
}

impl CrashConfig {
    /// Fast rounds on in-memory storage, for local play and tests
    pub fn development() -> Self {
        Self {
            game: GameConfig {
                countdown_secs: 3,
                cooldown_secs: 1,
                ..Default::default()
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load from a TOML file; missing fields keep their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigValidationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigValidationError::LoadFailed(format!("{}: {}", path.display(), e))
        })?;
        let config: CrashConfig = toml::from_str(&text)
            .map_err(|e| ConfigValidationError::LoadFailed(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let game = &self.game;

        if game.countdown_secs == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "countdown_secs must be > 0".to_string(),
            ));
        }

        if game.tick_interval_ms == 0 || game.tick_step_hundredths == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "tick_interval_ms and tick_step_hundredths must be > 0".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&game.house_edge) {
            return Err(ConfigValidationError::InvalidValue(
                "house_edge must be in [0, 1)".to_string(),
            ));
        }

        if !game.max_crash_point.is_finite() || game.max_crash_point < 1.01 {
            return Err(ConfigValidationError::InvalidValue(
                "max_crash_point must be >= 1.01".to_string(),
            ));
        }

        if !game.starting_balance.is_finite() || game.starting_balance < 0.0 {
            return Err(ConfigValidationError::InvalidValue(
                "starting_balance must be a non-negative number".to_string(),
            ));
        }

        if game.command_buffer == 0 || game.event_buffer == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "command_buffer and event_buffer must be > 0".to_string(),
            ));
        }

        // A tick slower than the betting window makes the countdown meaningless
        if game.tick_interval() >= game.countdown_tick() {
            return Err(ConfigValidationError::LogicalInconsistency(
                "tick_interval_ms must be shorter than one second".to_string(),
            ));
        }

        if let Some(secret) = &self.admin.secret {
            if secret.trim().is_empty() {
                return Err(ConfigValidationError::InvalidValue(
                    "admin secret must not be blank".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration logical inconsistency: {0}")]
    LogicalInconsistency(String),

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = CrashConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.game.countdown_secs, 10);
        assert_eq!(config.game.tick_interval_ms, 50);
        assert_eq!(config.game.cooldown_secs, 3);
        assert_eq!(config.storage.backend, StorageBackend::RocksDb);
    }

    #[test]
    fn test_development_preset() {
        let config = CrashConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_invalid_house_edge() {
        let mut config = CrashConfig::default();
        config.game.house_edge = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_slow_tick_is_inconsistent() {
        let mut config = CrashConfig::default();
        config.game.tick_interval_ms = 1_500;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::LogicalInconsistency(_))
        ));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[game]\ncountdown_secs = 5\n\n[storage]\nbackend = \"memory\"\n\n[admin]\nsecret = \"s3cret\""
        )
        .unwrap();

        let config = CrashConfig::load(file.path()).unwrap();
        assert_eq!(config.game.countdown_secs, 5);
        assert_eq!(config.game.tick_interval_ms, 50);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.admin.secret.as_deref(), Some("s3cret"));
    }
}

//! bluelink CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! - Built-in defaults
//! - `bluelink.toml` in the working directory
//! - `~/.bluelink/config.toml`
//! - Environment variables (`BLUELINK_*`, nested keys separated by `__`)
//! - A file given with `--config`
//! - Command line arguments
//!
//! Durations inside the `[ble]` table use serde's `{ secs, nanos }` form.

use std::path::{Path, PathBuf};

use bluelink_core::BleConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the per-directory configuration file
pub const LOCAL_CONFIG_FILE: &str = "bluelink.toml";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the bluelink CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliAppConfig {
    /// Library tunables handed to the manager
    pub ble: BleConfig,

    /// Defaults for `bluelink scan`
    pub scan: ScanConfig,

    /// Defaults for `bluelink read`
    pub read: ReadConfig,

    /// Defaults for `bluelink advertise`
    pub advertise: AdvertiseConfig,

    /// Platform selection
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Scan duration in seconds, 0 scans until interrupted
    pub timeout_secs: u64,

    /// Drop advertisements weaker than this (dBm)
    pub min_rssi: Option<i16>,

    /// Request scan responses
    pub active: bool,

    /// Print every advertisement instead of once per device
    pub allow_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadConfig {
    /// How long to scan for the target before connecting (milliseconds)
    pub locate_timeout_ms: u64,

    /// Connection establishment timeout in seconds
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertiseConfig {
    /// Local name put in the advertising payload
    pub name: String,

    /// Advertising duration in seconds, 0 advertises until interrupted
    pub timeout_secs: u64,

    pub connectable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Always use the simulated radio
    pub simulate: bool,

    /// Adapter id; the first adapter reported when unset
    pub adapter: Option<String>,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            min_rssi: None,
            active: true,
            allow_duplicates: false,
        }
    }
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            locate_timeout_ms: 5000,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self {
            name: "bluelink".to_string(),
            timeout_secs: 0,
            connectable: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    /// Load defaults, the standard files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_overrides(None, false, None)
    }

    /// Load configuration from a specific file path on top of the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        Self::ensure_exists(path)?;
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path));
        Self::extract(figment)
    }

    /// Load every layer, then apply command line overrides
    pub fn load_with_overrides(
        config_file: Option<&Path>,
        simulate: bool,
        adapter: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut figment = Self::layered();

        if let Some(path) = config_file {
            Self::ensure_exists(path)?;
            debug!("Loading configuration from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        // Flags only ever switch the simulated radio on
        if simulate {
            figment = figment.merge(("runtime.simulate", true));
        }
        if let Some(id) = adapter {
            figment = figment.merge(("runtime.adapter", id));
        }

        Self::extract(figment)
    }

    fn layered() -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(LOCAL_CONFIG_FILE));
        if let Some(path) = Self::default_config_path() {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("BLUELINK_").split("__"))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: CliAppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn ensure_exists(path: &Path) -> Result<(), ConfigError> {
        if path.is_file() {
            Ok(())
        } else {
            Err(ConfigError::FileSystem(format!("No configuration file at {}", path.display())))
        }
    }

    /// `~/.bluelink/config.toml`, when a home directory is known
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".bluelink").join("config.toml"))
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_config_path()
            .ok_or_else(|| ConfigError::Environment("No home directory".to_string()))?;
        self.save_to_file(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::FileSystem(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = self.to_toml()?;
        std::fs::write(path.as_ref(), toml_string)
            .map_err(|e| ConfigError::FileSystem(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ble
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if let Some(min_rssi) = self.scan.min_rssi {
            if !(-127..=20).contains(&min_rssi) {
                return Err(ConfigError::Validation(format!(
                    "scan.min_rssi {} is outside -127..=20 dBm",
                    min_rssi
                )));
            }
        }

        if self.read.locate_timeout_ms == 0 || self.read.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation("Read timeouts must be greater than 0".to_string()));
        }

        if self.advertise.name.is_empty() {
            return Err(ConfigError::Validation("Advertised name must not be empty".to_string()));
        }

        if matches!(&self.runtime.adapter, Some(id) if id.is_empty()) {
            return Err(ConfigError::Validation("Adapter id must not be empty".to_string()));
        }

        Ok(())
    }

    /// Create example configuration file content
    pub fn example_config() -> String {
        let example_config = CliAppConfig {
            scan: ScanConfig {
                min_rssi: Some(-80),
                ..ScanConfig::default()
            },
            advertise: AdvertiseConfig {
                name: "my-sensor".to_string(),
                timeout_secs: 30,
                connectable: true,
            },
            runtime: RuntimeConfig {
                simulate: false,
                adapter: Some("ble0".to_string()),
            },
            ..Default::default()
        };

        example_config
            .to_toml()
            .unwrap_or_else(|_| "# Failed to generate example config".to_string())
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Configuration module
//!
//! Handles loading and saving MotorLink configuration: the UDP link settings
//! and the ordered list of multi-motor presets.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::console::MAX_SPEED;
use crate::network::TransceiverConfig;
use crate::protocol::{MotorMask, DEFAULT_LOCAL_PORT, DEFAULT_REMOTE_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Preset {index}: speed {speed} exceeds {max}")]
    PresetSpeed { index: usize, speed: u16, max: u16 },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Link settings
    #[serde(default)]
    pub link: LinkConfig,

    /// Multi-motor presets; position in the list is the group index
    #[serde(default)]
    pub presets: Vec<PresetConfig>,
}

/// UDP link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Controller IP address or hostname
    #[serde(default = "default_remote_ip")]
    pub remote_ip: String,
    /// Controller command port
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// Local port telemetry is received on
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Back-off after a receive error (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Shutdown join timeout (ms)
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

fn default_remote_ip() -> String {
    "192.168.70.129".to_string()
}

fn default_remote_port() -> u16 {
    DEFAULT_REMOTE_PORT
}

fn default_local_port() -> u16 {
    DEFAULT_LOCAL_PORT
}

fn default_poll_interval() -> u64 {
    1
}

fn default_join_timeout() -> u64 {
    1000
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            remote_ip: default_remote_ip(),
            remote_port: default_remote_port(),
            local_port: default_local_port(),
            poll_interval_ms: default_poll_interval(),
            join_timeout_ms: default_join_timeout(),
        }
    }
}

impl LinkConfig {
    /// Transceiver timings derived from this link
    pub fn transceiver_config(&self) -> TransceiverConfig {
        TransceiverConfig {
            poll_interval_ms: self.poll_interval_ms,
            join_timeout_ms: self.join_timeout_ms,
            ..Default::default()
        }
    }
}

/// A multi-motor preset row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresetConfig {
    /// Motors taking part, as a binary string
    pub selection: MotorMask,
    /// Forward/reverse per motor, as a binary string
    #[serde(default)]
    pub direction: MotorMask,
    /// Sync speed (0-1024)
    pub speed: u16,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("motorlink/config.toml")),
            Some(PathBuf::from("./motorlink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check preset speeds
    pub fn validate(&self) -> ConfigResult<()> {
        for (index, preset) in self.presets.iter().enumerate() {
            if preset.speed > MAX_SPEED {
                return Err(ConfigError::PresetSpeed {
                    index,
                    speed: preset.speed,
                    max: MAX_SPEED,
                });
            }
        }
        Ok(())
    }

    /// Get the preset at a group index
    pub fn preset(&self, index: usize) -> Option<&PresetConfig> {
        self.presets.get(index)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        presets: vec![
            PresetConfig {
                selection: MotorMask::new(0b0100000),
                direction: MotorMask::NONE,
                speed: 512,
            },
            PresetConfig {
                selection: MotorMask::new(0b0000111),
                direction: MotorMask::new(0b0000101),
                speed: 300,
            },
        ],
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.link.remote_port, DEFAULT_REMOTE_PORT);
        assert_eq!(config.link.local_port, DEFAULT_LOCAL_PORT);
        assert!(config.presets.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.link.remote_ip = "10.0.0.7".to_string();
        config.presets.push(PresetConfig {
            selection: MotorMask::new(0b1000001),
            direction: MotorMask::new(0b0000001),
            speed: 128,
        });
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.link.remote_ip, "10.0.0.7");
        assert_eq!(loaded.presets, config.presets);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.presets.len(), 2);
        assert_eq!(parsed.preset(0).unwrap().selection.bits(), 0b0100000);
        assert!(parsed.preset(2).is_none());
    }

    #[test]
    fn test_preset_rows_keep_order() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[link]
remote_ip = "127.0.0.1"

[[presets]]
selection = "0000011"
direction = "0000010"
speed = 100

[[presets]]
selection = "1110000"
speed = 1024
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.link.remote_port, DEFAULT_REMOTE_PORT);
        assert_eq!(config.presets[0].direction.bits(), 0b10);
        assert_eq!(config.presets[1].selection.bits(), 0b1110000);
        assert_eq!(config.presets[1].direction, MotorMask::NONE);
    }

    #[test]
    fn test_rejects_bad_presets() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[[presets]]\nselection = \"0000001\"\nspeed = 2000\n").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::PresetSpeed { index: 0, speed: 2000, .. })
        ));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[[presets]]\nselection = \"00x\"\nspeed = 10\n").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/motorlink.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}

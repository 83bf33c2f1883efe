//! Configuration loading for the device-control server.
//!
//! Settings are loaded with Figment from:
//! 1. a TOML file (base configuration)
//! 2. environment variables (prefixed with `DEVCTL_`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DEVCTL_APPLICATION_LOG_LEVEL=debug
//! DEVCTL_APPLICATION_NAME="Lab Device Control"
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "rust_devctl"
//! log_level = "info"
//!
//! [registry.ports]
//! HV500_HV264 = "/dev/ttyUSB0"
//!
//! [[devices]]
//! id = "hv500"
//! type = "hv500"
//! reg_key = "HV500_HV264"
//! node = "labnode"
//! timeout_ms = 100
//! baud_rate = 9600
//! ```
//!
//! Per-device settings are frozen into an immutable [`DeviceConfig`] that is
//! handed to the connection manager at construction; nothing reconfigures a
//! running device.

use crate::error::ConfigError;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level settings for the server binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Seed data for the port registry
    #[serde(default)]
    pub registry: RegistrySettings,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Registry seed data: key/value pairs placed under the `Ports` directory.
///
/// A `BTreeMap` keeps the listing order deterministic, which matters because
/// port lookup takes the first key containing the search substring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Port name or address per registry key
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
}

/// One device definition in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Device type (currently only "hv500")
    pub r#type: String,
    /// Registry key used to resolve the transport address
    #[serde(default)]
    pub reg_key: Option<String>,
    /// Name of the node running the backend server for this device
    #[serde(default)]
    pub node: Option<String>,
    /// Communication timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Serial baud rate, where applicable
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Whether this device is started by the server binary
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Immutable per-device configuration passed to the connection manager.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device name; also the fallback source of the registry lookup prefix.
    pub name: String,
    /// Registry key used to resolve the transport address.
    pub reg_key: Option<String>,
    /// Node whose backend server provides the transport.
    pub node: Option<String>,
    /// Transport-level timeout.
    pub timeout: Duration,
    /// Serial baud rate, where applicable.
    pub baud_rate: Option<u32>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Load settings from a TOML file plus `DEVCTL_`-prefixed environment
    /// variables, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DEVCTL_").split("_"))
            .extract()
            .map_err(ConfigError::Load)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    ///
    /// Checks the log level, device id uniqueness, and that every device has
    /// a known type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut ids = std::collections::HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device ID: '{}'",
                    device.id
                )));
            }

            let valid_types = ["hv500"];
            if !valid_types.contains(&device.r#type.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Invalid device type '{}' for device '{}'. Must be one of: {}",
                    device.r#type,
                    device.id,
                    valid_types.join(", ")
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled devices.
    pub fn enabled_devices(&self) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }
}

impl DeviceDefinition {
    /// Freeze this definition into the immutable per-device configuration.
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            name: self.id.clone(),
            reg_key: self.reg_key.clone(),
            node: self.node.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            baud_rate: self.baud_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn hv500_definition() -> DeviceDefinition {
        DeviceDefinition {
            id: "hv500".to_string(),
            r#type: "hv500".to_string(),
            reg_key: Some("HV500_HV264".to_string()),
            node: Some("labnode".to_string()),
            timeout_ms: 100,
            baud_rate: Some(9600),
            enabled: true,
        }
    }

    fn settings_with(devices: Vec<DeviceDefinition>) -> Settings {
        Settings {
            application: ApplicationConfig {
                name: "test".to_string(),
                log_level: "info".to_string(),
            },
            registry: RegistrySettings::default(),
            devices,
        }
    }

    #[test]
    fn test_valid_settings() {
        assert!(settings_with(vec![hv500_definition()]).validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = settings_with(vec![]);
        settings.application.log_level = "loud".to_string();
        let result = settings.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_duplicate_device_ids() {
        let result = settings_with(vec![hv500_definition(), hv500_definition()]).validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Duplicate device ID"));
    }

    #[test]
    fn test_invalid_device_type() {
        let mut definition = hv500_definition();
        definition.r#type = "hv9000".to_string();
        let result = settings_with(vec![definition]).validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid device type"));
    }

    #[test]
    fn test_device_config_freeze() {
        let config = hv500_definition().device_config();
        assert_eq!(config.name, "hv500");
        assert_eq!(config.reg_key.as_deref(), Some("HV500_HV264"));
        assert_eq!(config.timeout, Duration::from_millis(100));
        assert_eq!(config.baud_rate, Some(9600));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[application]
name = "rust_devctl"
log_level = "debug"

[registry.ports]
HV500_HV264 = "/dev/ttyUSB0"

[[devices]]
id = "hv500"
type = "hv500"
reg_key = "HV500_HV264"
node = "labnode"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(
            settings.registry.ports.get("HV500_HV264").map(String::as_str),
            Some("/dev/ttyUSB0")
        );
        assert_eq!(settings.enabled_devices().len(), 1);
        // defaults applied
        assert_eq!(settings.devices[0].timeout_ms, 100);
        assert_eq!(settings.devices[0].baud_rate, None);
    }
}

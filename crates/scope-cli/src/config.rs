//! Service configuration – reads a TOML file and layers `SCOPE_*`
//! environment overrides on top of it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use scope_kernel::{ConfigRequest, ConfigVerifier};
use scope_runtime::{DEFAULT_LISTENERS, LogFormat};
use scope_types::{Binning, DeviceConfig, DeviceError, Geometry, SensorSettings, TriggerMode};

/// Everything one device service needs at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device name; doubles as the command topic.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_serial_number")]
    pub serial_number: String,

    /// WebSocket URL the command lines are read from.
    #[serde(default = "default_commands")]
    pub commands: String,

    /// WebSocket URL status records are pushed to.
    #[serde(default = "default_status")]
    pub status: String,

    /// Listen address of the data endpoint (`*:<port>` binds every interface).
    #[serde(default = "default_data")]
    pub data: String,

    /// `1` = internal, `2` = external exposure.
    #[serde(default = "default_trigger_mode")]
    pub trigger_mode: i64,

    #[serde(default = "default_stack_size")]
    pub stack_size: u32,

    #[serde(default = "default_side")]
    pub height: u32,

    #[serde(default = "default_side")]
    pub width: u32,

    #[serde(default = "default_binning")]
    pub binning: u32,

    /// Exposure time in seconds.
    #[serde(default = "default_exposure")]
    pub exposure: f64,

    /// Status listener names, each receives its own copy of every record.
    #[serde(default = "default_listeners")]
    pub listeners: Vec<String>,

    #[serde(default = "default_slot_count")]
    pub slot_count: usize,

    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_name() -> String {
    "ZylaCamera".to_string()
}
fn default_serial_number() -> String {
    "VSC-08793".to_string()
}
fn default_commands() -> String {
    "localhost:5001".to_string()
}
fn default_status() -> String {
    "localhost:5000".to_string()
}
fn default_data() -> String {
    "*:5003".to_string()
}
fn default_trigger_mode() -> i64 {
    1
}
fn default_stack_size() -> u32 {
    25
}
fn default_side() -> u32 {
    512
}
fn default_binning() -> u32 {
    4
}
fn default_exposure() -> f64 {
    0.05
}
fn default_listeners() -> Vec<String> {
    DEFAULT_LISTENERS.iter().map(|s| s.to_string()).collect()
}
fn default_slot_count() -> usize {
    scope_hal::DEFAULT_SLOT_COUNT
}
fn default_frame_timeout_ms() -> u64 {
    scope_hal::DEFAULT_FRAME_TIMEOUT.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            serial_number: default_serial_number(),
            commands: default_commands(),
            status: default_status(),
            data: default_data(),
            trigger_mode: default_trigger_mode(),
            stack_size: default_stack_size(),
            height: default_side(),
            width: default_side(),
            binning: default_binning(),
            exposure: default_exposure(),
            listeners: default_listeners(),
            slot_count: default_slot_count(),
            frame_timeout_ms: default_frame_timeout_ms(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Validate the raw values and build the typed [`DeviceConfig`].
    ///
    /// The values pass the same rules as the matching bus commands. Under
    /// internal triggering the stack size is then forced to one.
    pub fn device_config(&self) -> Result<DeviceConfig, DeviceError> {
        let verifier = ConfigVerifier::with_default_rules();
        for request in [
            ConfigRequest::Shape {
                batch_size: i64::from(self.stack_size),
                height: i64::from(self.height),
                width: i64::from(self.width),
            },
            ConfigRequest::TriggerMode {
                code: self.trigger_mode,
            },
            ConfigRequest::Exposure {
                seconds: self.exposure,
            },
        ] {
            verifier.verify(&request)?;
        }
        if self.slot_count == 0 {
            return Err(DeviceError::InvalidConfig("slot_count must be at least 1".into()));
        }
        let settings = SensorSettings {
            geometry: Geometry::new(i64::from(self.height), i64::from(self.width))?,
            binning: Binning::try_from(self.binning)?,
            trigger_mode: TriggerMode::try_from(self.trigger_mode)?,
            exposure_s: self.exposure,
        };
        DeviceConfig::new(&self.name, &self.serial_number, settings, self.stack_size)
    }
}

/// Load the config from `path`, then apply environment overrides.
/// A missing file yields the defaults.
pub fn load(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse the file at `path`. Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `SCOPE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SCOPE_NAME` | `name` |
/// | `SCOPE_SERIAL_NUMBER` | `serial_number` |
/// | `SCOPE_COMMANDS` | `commands` |
/// | `SCOPE_STATUS` | `status` |
/// | `SCOPE_DATA` | `data` |
/// | `SCOPE_STACK_SIZE` | `stack_size` |
/// | `SCOPE_TRIGGER_MODE` | `trigger_mode` |
/// | `SCOPE_LOG_FORMAT` | `log_format` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SCOPE_NAME") {
        cfg.name = v;
    }
    if let Ok(v) = std::env::var("SCOPE_SERIAL_NUMBER") {
        cfg.serial_number = v;
    }
    if let Ok(v) = std::env::var("SCOPE_COMMANDS") {
        cfg.commands = v;
    }
    if let Ok(v) = std::env::var("SCOPE_STATUS") {
        cfg.status = v;
    }
    if let Ok(v) = std::env::var("SCOPE_DATA") {
        cfg.data = v;
    }
    if let Ok(v) = std::env::var("SCOPE_STACK_SIZE")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.stack_size = n;
    }
    if let Ok(v) = std::env::var("SCOPE_TRIGGER_MODE")
        && let Ok(n) = v.parse::<i64>()
    {
        cfg.trigger_mode = n;
    }
    if let Ok(v) = std::env::var("SCOPE_LOG_FORMAT")
        && let Ok(format) = v.parse::<LogFormat>()
    {
        cfg.log_format = format;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use scope_kernel::MAX_BATCH_SIZE;

    #[test]
    fn load_from_returns_none_when_missing() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let result = load_from(&dir.path().join("scope.toml"))?;
        assert!(result.is_none());
        Ok(())
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scope.toml");
        fs::write(
            &path,
            "name = \"Bench\"\ntrigger_mode = 2\nstack_size = 100\nlog_format = \"json\"\n",
        )?;

        let cfg = load_from(&path)?.ok_or("expected a config")?;
        assert_eq!(cfg.name, "Bench");
        assert_eq!(cfg.trigger_mode, 2);
        assert_eq!(cfg.stack_size, 100);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.height, 512);
        assert_eq!(cfg.data, "*:5003");
        assert_eq!(cfg.listeners, vec!["hub".to_string(), "logger".to_string()]);
        Ok(())
    }

    #[test]
    fn malformed_file_is_an_error() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scope.toml");
        fs::write(&path, "stack_size = \"many\"")?;
        assert!(load_from(&path).is_err());
        Ok(())
    }

    #[test]
    fn default_device_config_pins_internal_batch_to_one() -> Result<(), Box<dyn Error>> {
        let dc = Config::default().device_config()?;
        assert_eq!(dc.name(), "ZylaCamera");
        assert_eq!(dc.trigger_mode(), TriggerMode::Internal);
        assert_eq!(dc.batch_size(), 1);
        assert_eq!(dc.geometry(), Geometry { height: 512, width: 512 });
        assert_eq!(dc.settings().binning, Binning::X4);
        Ok(())
    }

    #[test]
    fn external_trigger_keeps_configured_stack_size() -> Result<(), Box<dyn Error>> {
        let cfg = Config {
            trigger_mode: 2,
            ..Config::default()
        };
        let dc = cfg.device_config()?;
        assert_eq!(dc.batch_size(), 25);
        Ok(())
    }

    #[test]
    fn device_config_rejects_bad_values() {
        let bad = [
            Config { trigger_mode: 3, ..Config::default() },
            Config { binning: 3, ..Config::default() },
            Config { height: 0, ..Config::default() },
            Config { exposure: -1.0, ..Config::default() },
            Config { slot_count: 0, ..Config::default() },
            Config {
                trigger_mode: 2,
                stack_size: MAX_BATCH_SIZE as u32 + 1,
                ..Config::default()
            },
            Config { name: "two words".into(), ..Config::default() },
        ];
        for cfg in bad {
            assert!(
                matches!(cfg.device_config(), Err(DeviceError::InvalidConfig(_))),
                "expected InvalidConfig for {cfg:?}"
            );
        }
    }

    #[test]
    fn apply_env_overrides_changes_name_and_trigger() {
        // SAFETY: no other test in this crate touches these variables.
        unsafe {
            std::env::set_var("SCOPE_NAME", "Bench");
            std::env::set_var("SCOPE_TRIGGER_MODE", "2");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.name, "Bench");
        assert_eq!(cfg.trigger_mode, 2);
        unsafe {
            std::env::remove_var("SCOPE_NAME");
            std::env::remove_var("SCOPE_TRIGGER_MODE");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_stack_size() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("SCOPE_STACK_SIZE", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.stack_size, 25);
        unsafe { std::env::remove_var("SCOPE_STACK_SIZE") };
    }
}

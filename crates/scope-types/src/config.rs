//! Device configuration: sensor geometry, binning, trigger mode and the
//! batch size that decides how many frames travel in one data message.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DeviceError;

/// Bytes per pixel of the Mono16 encoding every frame is converted into.
pub const BYTES_PER_PIXEL: usize = 2;

/// Active readout rectangle (AOI) in binned super-pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub height: u32,
    pub width: u32,
}

impl Geometry {
    /// Build a geometry, rejecting zero or negative dimensions.
    pub fn new(height: i64, width: i64) -> Result<Self, DeviceError> {
        let dim = |value: i64, axis: &str| {
            u32::try_from(value)
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| DeviceError::InvalidConfig(format!("{axis} must be positive, got {value}")))
        };
        Ok(Self {
            height: dim(height, "height")?,
            width: dim(width, "width")?,
        })
    }

    pub fn pixels(&self) -> usize {
        self.height as usize * self.width as usize
    }

    /// Size of one converted frame.
    pub fn frame_bytes(&self) -> usize {
        self.pixels() * BYTES_PER_PIXEL
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// On-chip pixel binning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Binning {
    X1,
    X2,
    X4,
    X8,
}

impl Binning {
    pub fn factor(self) -> u32 {
        match self {
            Binning::X1 => 1,
            Binning::X2 => 2,
            Binning::X4 => 4,
            Binning::X8 => 8,
        }
    }

    /// Vendor enumeration string, e.g. `"4x4"`.
    pub fn label(self) -> &'static str {
        match self {
            Binning::X1 => "1x1",
            Binning::X2 => "2x2",
            Binning::X4 => "4x4",
            Binning::X8 => "8x8",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [Binning::X1, Binning::X2, Binning::X4, Binning::X8]
            .into_iter()
            .find(|b| b.label() == label)
    }
}

impl TryFrom<u32> for Binning {
    type Error = DeviceError;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Binning::X1),
            2 => Ok(Binning::X2),
            4 => Ok(Binning::X4),
            8 => Ok(Binning::X8),
            other => Err(DeviceError::InvalidConfig(format!(
                "binning must be 1, 2, 4 or 8, got {other}"
            ))),
        }
    }
}

impl From<Binning> for u32 {
    fn from(b: Binning) -> u32 {
        b.factor()
    }
}

/// How exposures are started.
///
/// On the wire and in configuration files the mode is an integer: `1` for
/// [`TriggerMode::Internal`], `2` for [`TriggerMode::ExternalExposure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum TriggerMode {
    /// The sensor free-runs on its own clock.
    Internal,
    /// An external signal gates every exposure.
    ExternalExposure,
}

impl TriggerMode {
    pub fn code(self) -> i64 {
        match self {
            TriggerMode::Internal => 1,
            TriggerMode::ExternalExposure => 2,
        }
    }

    /// Vendor enumeration string.
    pub fn label(self) -> &'static str {
        match self {
            TriggerMode::Internal => "Internal",
            TriggerMode::ExternalExposure => "External Exposure",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Internal" => Some(TriggerMode::Internal),
            "External Exposure" => Some(TriggerMode::ExternalExposure),
            _ => None,
        }
    }
}

impl TryFrom<i64> for TriggerMode {
    type Error = DeviceError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(TriggerMode::Internal),
            2 => Ok(TriggerMode::ExternalExposure),
            other => Err(DeviceError::InvalidConfig(format!(
                "trigger mode must be 1 (Internal) or 2 (ExternalExposure), got {other}"
            ))),
        }
    }
}

impl From<TriggerMode> for i64 {
    fn from(mode: TriggerMode) -> i64 {
        mode.code()
    }
}

/// Acquisition lifecycle of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcquisitionState {
    /// No buffers allocated.
    Idle,
    /// Configuration applied, buffers allocated and queued.
    Prepared,
    /// The sensor is capturing and buffers are in flight.
    Streaming,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AcquisitionState::Idle => "Idle",
            AcquisitionState::Prepared => "Prepared",
            AcquisitionState::Streaming => "Streaming",
        };
        f.write_str(s)
    }
}

/// Everything the hardware session pushes to the sensor on `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    pub geometry: Geometry,
    pub binning: Binning,
    pub trigger_mode: TriggerMode,
    /// Exposure applied when switching to internal triggering, in seconds.
    pub exposure_s: f64,
}

/// Typed configuration of one device service.
///
/// Internal triggering free-runs the sensor, so the batch size is pinned to
/// one whenever the trigger mode is [`TriggerMode::Internal`]. Every setter
/// re-applies that rule, and deserialization goes through
/// [`DeviceConfig::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DeviceConfigFields")]
pub struct DeviceConfig {
    name: String,
    serial_number: String,
    settings: SensorSettings,
    batch_size: u32,
}

#[derive(Deserialize)]
struct DeviceConfigFields {
    name: String,
    serial_number: String,
    settings: SensorSettings,
    batch_size: u32,
}

impl TryFrom<DeviceConfigFields> for DeviceConfig {
    type Error = DeviceError;

    fn try_from(fields: DeviceConfigFields) -> Result<Self, Self::Error> {
        Self::new(fields.name, fields.serial_number, fields.settings, fields.batch_size)
    }
}

impl DeviceConfig {
    /// # Errors
    ///
    /// [`DeviceError::InvalidConfig`] when `name` is empty or contains
    /// whitespace (it doubles as the command topic) or `batch_size` is zero.
    pub fn new(
        name: impl Into<String>,
        serial_number: impl Into<String>,
        settings: SensorSettings,
        batch_size: u32,
    ) -> Result<Self, DeviceError> {
        let name = name.into();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(DeviceError::InvalidConfig(format!(
                "device name {name:?} must be a single non-empty word"
            )));
        }
        let mut cfg = Self {
            name,
            serial_number: serial_number.into(),
            settings,
            batch_size: 1,
        };
        cfg.set_batch_size(batch_size)?;
        Ok(cfg)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn settings(&self) -> &SensorSettings {
        &self.settings
    }

    pub fn geometry(&self) -> Geometry {
        self.settings.geometry
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.settings.trigger_mode
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Set the frames-per-message count, clamped to 1 under internal
    /// triggering.
    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), DeviceError> {
        if batch_size == 0 {
            return Err(DeviceError::InvalidConfig("batch size must be at least 1".to_string()));
        }
        self.batch_size = match self.settings.trigger_mode {
            TriggerMode::Internal => 1,
            TriggerMode::ExternalExposure => batch_size,
        };
        Ok(())
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) {
        self.settings.trigger_mode = mode;
        if mode == TriggerMode::Internal {
            self.batch_size = 1;
        }
    }

    pub fn set_geometry(&mut self, geometry: Geometry) {
        self.settings.geometry = geometry;
    }

    pub fn set_exposure(&mut self, seconds: f64) {
        self.settings.exposure_s = seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(trigger_mode: TriggerMode) -> SensorSettings {
        SensorSettings {
            geometry: Geometry { height: 512, width: 512 },
            binning: Binning::X4,
            trigger_mode,
            exposure_s: 0.05,
        }
    }

    #[test]
    fn geometry_rejects_zero_and_negative() {
        assert!(Geometry::new(0, 512).is_err());
        assert!(Geometry::new(512, -4).is_err());
        assert!(matches!(
            Geometry::new(-1, 1),
            Err(DeviceError::InvalidConfig(_))
        ));
        let g = Geometry::new(256, 128).unwrap();
        assert_eq!(g.frame_bytes(), 256 * 128 * 2);
    }

    #[test]
    fn internal_trigger_pins_batch_size_to_one() {
        let cfg = DeviceConfig::new("ZylaCamera", "VSC-08793", settings(TriggerMode::Internal), 25).unwrap();
        assert_eq!(cfg.batch_size(), 1);
    }

    #[test]
    fn external_trigger_keeps_batch_size() {
        let mut cfg =
            DeviceConfig::new("ZylaCamera", "VSC-08793", settings(TriggerMode::ExternalExposure), 25).unwrap();
        assert_eq!(cfg.batch_size(), 25);

        cfg.set_trigger_mode(TriggerMode::Internal);
        assert_eq!(cfg.batch_size(), 1);

        cfg.set_batch_size(7).unwrap();
        assert_eq!(cfg.batch_size(), 1, "still clamped while Internal");

        cfg.set_trigger_mode(TriggerMode::ExternalExposure);
        cfg.set_batch_size(7).unwrap();
        assert_eq!(cfg.batch_size(), 7);
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let mut cfg =
            DeviceConfig::new("cam", "1", settings(TriggerMode::ExternalExposure), 3).unwrap();
        assert!(cfg.set_batch_size(0).is_err());
        assert_eq!(cfg.batch_size(), 3);
    }

    #[test]
    fn deserialized_config_keeps_the_internal_batch_rule() {
        let cfg =
            DeviceConfig::new("cam", "1", settings(TriggerMode::ExternalExposure), 25).unwrap();
        let mut value = serde_json::to_value(&cfg).unwrap();
        value["settings"]["trigger_mode"] = serde_json::json!(1);

        let parsed: DeviceConfig = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(parsed.trigger_mode(), TriggerMode::Internal);
        assert_eq!(parsed.batch_size(), 1);

        value["name"] = serde_json::json!("two words");
        assert!(serde_json::from_value::<DeviceConfig>(value).is_err());
    }

    #[test]
    fn name_must_be_a_single_word() {
        assert!(DeviceConfig::new("", "1", settings(TriggerMode::Internal), 1).is_err());
        assert!(DeviceConfig::new("two words", "1", settings(TriggerMode::Internal), 1).is_err());
    }

    #[test]
    fn trigger_mode_codes() {
        assert_eq!(TriggerMode::try_from(1).unwrap(), TriggerMode::Internal);
        assert_eq!(TriggerMode::try_from(2).unwrap(), TriggerMode::ExternalExposure);
        assert!(TriggerMode::try_from(3).is_err());
        assert_eq!(
            TriggerMode::from_label(TriggerMode::ExternalExposure.label()),
            Some(TriggerMode::ExternalExposure)
        );
    }

    #[test]
    fn binning_labels() {
        assert_eq!(Binning::try_from(4).unwrap().label(), "4x4");
        assert!(Binning::try_from(3).is_err());
        assert_eq!(Binning::from_label("8x8"), Some(Binning::X8));
    }
}

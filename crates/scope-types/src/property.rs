//! Closed set of sensor properties and their values.
//!
//! Vendor SDKs expose dozens of string-keyed features. The service only ever
//! touches the ones listed in [`Property`], through a single typed
//! `get`/`set` pair on the sensor.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DeviceError;

/// A sensor feature the service reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Property {
    TriggerMode,
    ExposureTime,
    FrameRate,
    /// Highest frame rate the current configuration allows.
    FrameRateMax,
    AoiHeight,
    AoiWidth,
    AoiBinning,
    AoiStride,
    VerticallyCenterAoi,
    ImageSizeBytes,
    PixelEncoding,
    CycleMode,
    Overlap,
    PreAmpGain,
    PixelReadoutRate,
    SensorCooling,
    FastAoiFrameRate,
    ShutteringMode,
    AuxiliaryOutSource,
    /// Live acquisition flag; the source of truth for streaming state.
    CameraAcquiring,
    SensorTemperature,
    SerialNumber,
    CameraModel,
}

impl Property {
    /// Feature name as the vendor SDK spells it.
    pub fn vendor_name(self) -> &'static str {
        match self {
            Property::TriggerMode => "TriggerMode",
            Property::ExposureTime => "ExposureTime",
            Property::FrameRate | Property::FrameRateMax => "FrameRate",
            Property::AoiHeight => "AOIHeight",
            Property::AoiWidth => "AOIWidth",
            Property::AoiBinning => "AOIBinning",
            Property::AoiStride => "AOIStride",
            Property::VerticallyCenterAoi => "VerticallyCenterAOI",
            Property::ImageSizeBytes => "ImageSizeBytes",
            Property::PixelEncoding => "PixelEncoding",
            Property::CycleMode => "CycleMode",
            Property::Overlap => "Overlap",
            Property::PreAmpGain => "SimplePreAmpGainControl",
            Property::PixelReadoutRate => "PixelReadoutRate",
            Property::SensorCooling => "SensorCooling",
            Property::FastAoiFrameRate => "FastAOIFrameRateEnable",
            Property::ShutteringMode => "ElectronicShutteringMode",
            Property::AuxiliaryOutSource => "AuxiliaryOutSource",
            Property::CameraAcquiring => "CameraAcquiring",
            Property::SensorTemperature => "SensorTemperature",
            Property::SerialNumber => "SerialNumber",
            Property::CameraModel => "CameraModel",
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Property::FrameRateMax
                | Property::AoiStride
                | Property::ImageSizeBytes
                | Property::CameraAcquiring
                | Property::SensorTemperature
                | Property::SerialNumber
                | Property::CameraModel
        )
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.vendor_name())
    }
}

/// Value of a [`Property`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Enumerated or free-form string feature.
    Text(String),
}

impl PropertyValue {
    pub fn as_int(&self, property: Property) -> Result<i64, DeviceError> {
        match self {
            PropertyValue::Int(v) => Ok(*v),
            other => Err(mismatch(property, "integer", other)),
        }
    }

    pub fn as_float(&self, property: Property) -> Result<f64, DeviceError> {
        match self {
            PropertyValue::Float(v) => Ok(*v),
            PropertyValue::Int(v) => Ok(*v as f64),
            other => Err(mismatch(property, "float", other)),
        }
    }

    pub fn as_bool(&self, property: Property) -> Result<bool, DeviceError> {
        match self {
            PropertyValue::Bool(v) => Ok(*v),
            other => Err(mismatch(property, "bool", other)),
        }
    }

    pub fn as_text(&self, property: Property) -> Result<&str, DeviceError> {
        match self {
            PropertyValue::Text(v) => Ok(v),
            other => Err(mismatch(property, "string", other)),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

fn mismatch(property: Property, expected: &str, got: &PropertyValue) -> DeviceError {
    DeviceError::rejected(property, format!("expected {expected}, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_reject_wrong_kind() {
        let v = PropertyValue::from("Mono16");
        assert_eq!(v.as_text(Property::PixelEncoding).unwrap(), "Mono16");
        assert!(matches!(
            v.as_int(Property::PixelEncoding),
            Err(DeviceError::DeviceConfig { .. })
        ));
    }

    #[test]
    fn int_widens_to_float() {
        let v = PropertyValue::Int(30);
        assert!((v.as_float(Property::FrameRate).unwrap() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn read_only_features() {
        assert!(Property::CameraAcquiring.is_read_only());
        assert!(Property::ImageSizeBytes.is_read_only());
        assert!(!Property::AoiHeight.is_read_only());
        assert_eq!(Property::PreAmpGain.to_string(), "SimplePreAmpGainControl");
    }
}

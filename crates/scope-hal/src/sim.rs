//! In-process simulated sensor for CI/CD testing without a physical camera.
//!
//! [`SimSensor`] behaves like a buffer-queue scientific camera: a 2048x2048
//! chip with binning, padded raw rows, a live acquisition flag and both
//! trigger modes. Frames carry a deterministic pattern (see
//! [`SimSensor::pixel`]) so tests can check exactly which frame ended up
//! where. Every driver call is recorded for inspection.
//!
//! # Example
//!
//! ```rust
//! use scope_hal::sim::SimSensor;
//! use scope_hal::Sensor;
//!
//! let mut sensor = SimSensor::open("VSC-08793")
//!     .expect("serial is in the sim catalog")
//!     .with_external_pulses(3);
//! sensor.arm().expect("sim arm must succeed");
//! assert_eq!(sensor.serial_number(), "VSC-08793");
//! ```

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;

use scope_types::{Binning, DeviceError, Property, PropertyValue, TriggerMode};
use tracing::{debug, warn};

use crate::pool::Slot;
use crate::sensor::{FrameLayout, Rejected, Sensor};

pub const SENSOR_HEIGHT: u32 = 2048;
pub const SENSOR_WIDTH: u32 = 2048;

/// Raw rows are padded to this many bytes.
const ROW_ALIGN: usize = 64;
/// Fill value for row padding, so unpacking mistakes show up in pixel data.
const PAD_BYTE: u8 = 0xAA;
/// Sensor rows read per second at full speed.
const ROW_RATE: f64 = 100_000.0;
const MAX_EXPOSURE_S: f64 = 30.0;

/// Serial numbers [`SimSensor::open`] can find, with their model names.
pub const CATALOG: &[(&str, &str)] = &[
    ("VSC-08793", "ZYLA-4.2P-USB3"),
    ("VSC-11422", "ZYLA-5.5-CL3"),
];

const ENCODINGS: &[&str] = &["Mono12", "Mono16", "Mono32"];
const CYCLE_MODES: &[&str] = &["Fixed", "Continuous"];
const PRE_AMP_GAINS: &[&str] = &[
    "12-bit (high well capacity)",
    "12-bit (low noise)",
    "16-bit (low noise & high well capacity)",
];
const READOUT_RATES: &[&str] = &["100 MHz", "270 MHz"];
const SHUTTERING_MODES: &[&str] = &["Rolling", "Global"];
const AUX_OUT_SOURCES: &[&str] = &["FireRow1", "FireRowN", "FireAll", "FireAny"];

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorCall {
    Arm,
    Disarm,
    /// A successful property write, with the number of slots queued at the
    /// time.
    Set {
        property: Property,
        value: PropertyValue,
        queued: usize,
    },
    Start,
    Stop,
    Queue { slot: usize },
    Flush { returned: usize },
}

pub struct SimSensor {
    serial_number: String,
    model: String,
    armed: bool,
    acquiring: bool,
    trigger_mode: TriggerMode,
    binning: Binning,
    aoi_height: u32,
    aoi_width: u32,
    exposure_s: f64,
    frame_rate: f64,
    encoding: String,
    /// Pass-through features the sim only stores.
    features: HashMap<Property, PropertyValue>,
    queue: VecDeque<Slot>,
    frames_delivered: u64,
    frame_interval: Duration,
    pending_pulses: u64,
    fault_after: Option<u64>,
    calls: Vec<SensorCall>,
}

impl SimSensor {
    /// Simulated camera with an arbitrary serial number.
    pub fn new(serial_number: impl Into<String>, model: impl Into<String>) -> Self {
        let features = HashMap::from([
            (Property::VerticallyCenterAoi, PropertyValue::Bool(false)),
            (Property::CycleMode, PropertyValue::from("Fixed")),
            (Property::Overlap, PropertyValue::Bool(false)),
            (Property::PreAmpGain, PropertyValue::from("12-bit (high well capacity)")),
            (Property::PixelReadoutRate, PropertyValue::from("100 MHz")),
            (Property::SensorCooling, PropertyValue::Bool(false)),
            (Property::FastAoiFrameRate, PropertyValue::Bool(false)),
            (Property::ShutteringMode, PropertyValue::from("Rolling")),
            (Property::AuxiliaryOutSource, PropertyValue::from("FireAll")),
        ]);
        Self {
            serial_number: serial_number.into(),
            model: model.into(),
            armed: false,
            acquiring: false,
            trigger_mode: TriggerMode::Internal,
            binning: Binning::X1,
            aoi_height: SENSOR_HEIGHT,
            aoi_width: SENSOR_WIDTH,
            exposure_s: 0.01,
            frame_rate: 10.0,
            encoding: "Mono12".to_string(),
            features,
            queue: VecDeque::new(),
            frames_delivered: 0,
            frame_interval: Duration::ZERO,
            pending_pulses: 0,
            fault_after: None,
            calls: Vec::new(),
        }
    }

    /// Find a simulated camera by serial number in [`CATALOG`].
    ///
    /// # Errors
    ///
    /// [`DeviceError::DeviceNotFound`] if the serial number is unknown.
    pub fn open(serial_number: &str) -> Result<Self, DeviceError> {
        CATALOG
            .iter()
            .find(|(serial, _)| *serial == serial_number)
            .map(|(serial, model)| Self::new(*serial, *model))
            .ok_or_else(|| DeviceError::DeviceNotFound(serial_number.to_string()))
    }

    /// Delay before each delivered frame. A wait shorter than the interval
    /// times out without consuming a frame.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Pre-load external trigger pulses.
    pub fn with_external_pulses(mut self, pulses: u64) -> Self {
        self.pending_pulses = pulses;
        self
    }

    /// Drop the acquisition flag after `frames` frames, as a camera that
    /// lost its link would.
    pub fn with_fault_after(mut self, frames: u64) -> Self {
        self.fault_after = Some(frames);
        self
    }

    /// Deliver `count` more external trigger pulses.
    pub fn pulse(&mut self, count: u64) {
        self.pending_pulses += count;
    }

    pub fn calls(&self) -> &[SensorCall] {
        &self.calls
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    /// Slots currently in the driver queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Pixel value the sim writes at (`row`, `col`) of its `frame`-th
    /// delivered frame, counting from zero.
    pub fn pixel(frame: u64, row: u32, col: u32) -> u16 {
        (frame.wrapping_mul(31) as u16)
            .wrapping_add((row as u16).wrapping_mul(7))
            .wrapping_add(col as u16)
    }

    fn bytes_per_pixel(&self) -> usize {
        if self.encoding == "Mono32" { 4 } else { 2 }
    }

    fn stride(&self) -> usize {
        (self.aoi_width as usize * self.bytes_per_pixel()).next_multiple_of(ROW_ALIGN)
    }

    fn image_size_bytes(&self) -> usize {
        self.stride() * self.aoi_height as usize
    }

    fn max_aoi(&self) -> (u32, u32) {
        let factor = self.binning.factor();
        (SENSOR_HEIGHT / factor, SENSOR_WIDTH / factor)
    }

    fn frame_rate_max(&self) -> f64 {
        let rows = f64::from(self.aoi_height * self.binning.factor());
        let readout_limit = (ROW_RATE / rows).min(1000.0);
        match self.trigger_mode {
            TriggerMode::Internal => readout_limit.min(1.0 / self.exposure_s),
            TriggerMode::ExternalExposure => readout_limit,
        }
    }

    fn ensure_armed(&self) -> Result<(), DeviceError> {
        if self.armed {
            Ok(())
        } else {
            Err(DeviceError::HardwareFault {
                component: self.serial_number.clone(),
                details: "sensor is not armed".to_string(),
            })
        }
    }

    fn timed_out(&self, timeout: Duration) -> DeviceError {
        thread::sleep(timeout);
        DeviceError::HardwareTimeout {
            waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn fill(&self, slot: &mut Slot, frame: u64) {
        let stride = self.stride();
        let row_bytes = self.aoi_width as usize * 2;
        let bytes = slot.as_mut_bytes();
        bytes.fill(PAD_BYTE);
        for (row, raw) in bytes.chunks_exact_mut(stride).take(self.aoi_height as usize).enumerate() {
            for (col, px) in raw[..row_bytes].chunks_exact_mut(2).enumerate() {
                px.copy_from_slice(&Self::pixel(frame, row as u32, col as u32).to_le_bytes());
            }
        }
    }

    fn check_writable(&self, property: Property) -> Result<(), DeviceError> {
        if property.is_read_only() {
            return Err(DeviceError::rejected(property, "feature is read-only"));
        }
        let geometry_feature = matches!(
            property,
            Property::AoiHeight | Property::AoiWidth | Property::AoiBinning | Property::PixelEncoding
        );
        if self.acquiring && property != Property::ExposureTime {
            return Err(DeviceError::rejected(property, "not writable while acquiring"));
        }
        if geometry_feature && !self.queue.is_empty() {
            return Err(DeviceError::rejected(
                property,
                format!("{} buffer(s) still queued", self.queue.len()),
            ));
        }
        Ok(())
    }

    fn apply(&mut self, property: Property, value: &PropertyValue) -> Result<(), DeviceError> {
        match property {
            Property::TriggerMode => {
                let label = value.as_text(property)?;
                self.trigger_mode = TriggerMode::from_label(label)
                    .ok_or_else(|| DeviceError::rejected(property, format!("unknown mode {label:?}")))?;
            }
            Property::AoiBinning => {
                let label = value.as_text(property)?;
                self.binning = Binning::from_label(label)
                    .ok_or_else(|| DeviceError::rejected(property, format!("unknown binning {label:?}")))?;
                let (max_h, max_w) = self.max_aoi();
                self.aoi_height = self.aoi_height.min(max_h);
                self.aoi_width = self.aoi_width.min(max_w);
            }
            Property::AoiHeight | Property::AoiWidth => {
                let requested = value.as_int(property)?;
                let (max_h, max_w) = self.max_aoi();
                let max = if property == Property::AoiHeight { max_h } else { max_w };
                let dim = u32::try_from(requested)
                    .ok()
                    .filter(|v| (1..=max).contains(v))
                    .ok_or_else(|| {
                        DeviceError::rejected(
                            property,
                            format!("{requested} outside 1..={max} at {} binning", self.binning.label()),
                        )
                    })?;
                if property == Property::AoiHeight {
                    self.aoi_height = dim;
                } else {
                    self.aoi_width = dim;
                }
            }
            Property::ExposureTime => {
                let seconds = value.as_float(property)?;
                if !(seconds > 0.0 && seconds <= MAX_EXPOSURE_S) {
                    return Err(DeviceError::rejected(
                        property,
                        format!("{seconds} s outside (0, {MAX_EXPOSURE_S}]"),
                    ));
                }
                self.exposure_s = seconds;
                self.frame_rate = self.frame_rate.min(self.frame_rate_max());
            }
            Property::FrameRate => {
                let rate = value.as_float(property)?;
                let max = self.frame_rate_max();
                if !(rate > 0.0 && rate <= max) {
                    return Err(DeviceError::rejected(property, format!("{rate} fps outside (0, {max}]")));
                }
                self.frame_rate = rate;
            }
            Property::PixelEncoding => {
                let label = value.as_text(property)?;
                one_of(property, label, ENCODINGS)?;
                self.encoding = label.to_string();
            }
            Property::CycleMode
            | Property::PreAmpGain
            | Property::PixelReadoutRate
            | Property::ShutteringMode
            | Property::AuxiliaryOutSource => {
                let allowed = match property {
                    Property::CycleMode => CYCLE_MODES,
                    Property::PreAmpGain => PRE_AMP_GAINS,
                    Property::PixelReadoutRate => READOUT_RATES,
                    Property::ShutteringMode => SHUTTERING_MODES,
                    _ => AUX_OUT_SOURCES,
                };
                one_of(property, value.as_text(property)?, allowed)?;
                self.features.insert(property, value.clone());
            }
            Property::VerticallyCenterAoi
            | Property::Overlap
            | Property::SensorCooling
            | Property::FastAoiFrameRate => {
                value.as_bool(property)?;
                self.features.insert(property, value.clone());
            }
            read_only => return Err(DeviceError::rejected(read_only, "feature is read-only")),
        }
        Ok(())
    }
}

fn one_of(property: Property, label: &str, allowed: &[&str]) -> Result<(), DeviceError> {
    if allowed.contains(&label) {
        Ok(())
    } else {
        Err(DeviceError::rejected(
            property,
            format!("{label:?} is not one of {allowed:?}"),
        ))
    }
}

fn to_int(value: usize) -> PropertyValue {
    PropertyValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
}

impl Sensor for SimSensor {
    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn arm(&mut self) -> Result<(), DeviceError> {
        self.armed = true;
        self.calls.push(SensorCall::Arm);
        debug!(serial = %self.serial_number, model = %self.model, "sim sensor armed");
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), DeviceError> {
        self.armed = false;
        self.acquiring = false;
        self.queue.clear();
        self.calls.push(SensorCall::Disarm);
        Ok(())
    }

    fn get(&self, property: Property) -> Result<PropertyValue, DeviceError> {
        self.ensure_armed()?;
        let value = match property {
            Property::TriggerMode => PropertyValue::from(self.trigger_mode.label()),
            Property::ExposureTime => PropertyValue::Float(self.exposure_s),
            Property::FrameRate => PropertyValue::Float(self.frame_rate),
            Property::FrameRateMax => PropertyValue::Float(self.frame_rate_max()),
            Property::AoiHeight => PropertyValue::Int(i64::from(self.aoi_height)),
            Property::AoiWidth => PropertyValue::Int(i64::from(self.aoi_width)),
            Property::AoiBinning => PropertyValue::from(self.binning.label()),
            Property::AoiStride => to_int(self.stride()),
            Property::ImageSizeBytes => to_int(self.image_size_bytes()),
            Property::PixelEncoding => PropertyValue::Text(self.encoding.clone()),
            Property::CameraAcquiring => PropertyValue::Bool(self.acquiring),
            Property::SensorTemperature => {
                let cooled = matches!(self.features.get(&Property::SensorCooling), Some(PropertyValue::Bool(true)));
                PropertyValue::Float(if cooled { 0.0 } else { 22.5 })
            }
            Property::SerialNumber => PropertyValue::Text(self.serial_number.clone()),
            Property::CameraModel => PropertyValue::Text(self.model.clone()),
            other => self
                .features
                .get(&other)
                .cloned()
                .ok_or_else(|| DeviceError::rejected(other, "feature not implemented"))?,
        };
        Ok(value)
    }

    fn set(&mut self, property: Property, value: PropertyValue) -> Result<(), DeviceError> {
        self.ensure_armed()?;
        self.check_writable(property)?;
        self.apply(property, &value)?;
        self.calls.push(SensorCall::Set {
            property,
            value,
            queued: self.queue.len(),
        });
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<(), DeviceError> {
        self.ensure_armed()?;
        self.acquiring = true;
        self.calls.push(SensorCall::Start);
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<(), DeviceError> {
        self.ensure_armed()?;
        self.acquiring = false;
        self.calls.push(SensorCall::Stop);
        Ok(())
    }

    fn queue_buffer(&mut self, slot: Slot) -> Result<(), Rejected> {
        if let Err(error) = self.ensure_armed() {
            return Err(Rejected { slot, error });
        }
        let needed = self.image_size_bytes();
        if slot.len() < needed {
            let error = DeviceError::rejected(
                Property::ImageSizeBytes,
                format!("slot of {} bytes is smaller than the {needed}-byte image", slot.len()),
            );
            return Err(Rejected { slot, error });
        }
        self.calls.push(SensorCall::Queue { slot: slot.index() });
        self.queue.push_back(slot);
        Ok(())
    }

    fn wait_buffer(&mut self, timeout: Duration) -> Result<Slot, DeviceError> {
        let triggered = match self.trigger_mode {
            TriggerMode::Internal => true,
            TriggerMode::ExternalExposure => self.pending_pulses > 0,
        };
        if !self.acquiring || !triggered {
            return Err(self.timed_out(timeout));
        }
        if let Some(limit) = self.fault_after
            && self.frames_delivered >= limit
        {
            warn!(serial = %self.serial_number, frames = self.frames_delivered, "sim sensor dropped out of acquisition");
            self.acquiring = false;
            return Err(self.timed_out(timeout));
        }
        if self.frame_interval > timeout {
            return Err(self.timed_out(timeout));
        }
        let Some(mut slot) = self.queue.pop_front() else {
            return Err(self.timed_out(timeout));
        };
        if !self.frame_interval.is_zero() {
            thread::sleep(self.frame_interval);
        }
        self.fill(&mut slot, self.frames_delivered);
        self.frames_delivered += 1;
        if self.trigger_mode == TriggerMode::ExternalExposure {
            self.pending_pulses -= 1;
        }
        Ok(slot)
    }

    fn flush(&mut self) -> Vec<Slot> {
        let drained: Vec<Slot> = self.queue.drain(..).collect();
        self.calls.push(SensorCall::Flush {
            returned: drained.len(),
        });
        drained
    }

    fn convert(&self, raw: &[u8], layout: &FrameLayout, destination: &mut [u8]) -> Result<(), DeviceError> {
        if self.bytes_per_pixel() != 2 {
            return Err(DeviceError::rejected(
                Property::PixelEncoding,
                format!("cannot unpack {} into Mono16", self.encoding),
            ));
        }
        let row_bytes = layout.geometry.width as usize * 2;
        let rows = layout.geometry.height as usize;
        if destination.len() != layout.frame_bytes() || raw.len() < layout.stride * rows || layout.stride < row_bytes {
            return Err(DeviceError::HardwareFault {
                component: "convert".to_string(),
                details: format!(
                    "raw {} bytes (stride {}) does not match a {} frame of {} bytes",
                    raw.len(),
                    layout.stride,
                    layout.geometry,
                    destination.len()
                ),
            });
        }
        for (src, dst) in raw.chunks_exact(layout.stride).zip(destination.chunks_exact_mut(row_bytes)) {
            dst.copy_from_slice(&src[..row_bytes]);
        }
        Ok(())
    }
}

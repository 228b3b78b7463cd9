//! [`HardwareSession`] – one armed sensor plus the frame pool it fills.
//!
//! The session owns the driver and the [`FrameBufferPool`] and knows the
//! property sequences a scientific camera needs (arming, geometry/trigger
//! configuration, preparation). It does not track acquisition state itself;
//! [`HardwareSession::is_streaming`] always asks the hardware.

use std::time::Duration;

use scope_types::{DeviceError, Geometry, Property, PropertyValue, SensorSettings, TriggerMode};
use tracing::{debug, info, instrument, warn};

use crate::pool::{FrameBufferPool, Slot};
use crate::sensor::{FrameLayout, Rejected, Sensor};

/// Default bound on a single frame wait, on top of the exposure time.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Properties reported by [`HardwareSession::describe`].
const DESCRIBED: &[Property] = &[
    Property::SerialNumber,
    Property::CameraModel,
    Property::TriggerMode,
    Property::ExposureTime,
    Property::FrameRate,
    Property::AoiHeight,
    Property::AoiWidth,
    Property::AoiBinning,
    Property::PixelEncoding,
    Property::PixelReadoutRate,
    Property::SensorTemperature,
    Property::CameraAcquiring,
];

/// Applied once when the session opens.
fn arming_setup() -> [(Property, PropertyValue); 5] {
    [
        (Property::PixelReadoutRate, "270 MHz".into()),
        (Property::SensorCooling, true.into()),
        (Property::FastAoiFrameRate, true.into()),
        (Property::ShutteringMode, "Rolling".into()),
        (Property::AuxiliaryOutSource, "FireRow1".into()),
    ]
}

/// Applied on every prepare, before the buffer size is read.
fn readout_setup() -> [(Property, PropertyValue); 4] {
    [
        (Property::CycleMode, "Continuous".into()),
        (Property::PixelEncoding, "Mono16".into()),
        (Property::Overlap, true.into()),
        (Property::PreAmpGain, "16-bit (low noise & high well capacity)".into()),
    ]
}

pub struct HardwareSession<S: Sensor> {
    sensor: S,
    pool: FrameBufferPool,
    slot_count: usize,
    frame_timeout: Duration,
    /// `frame_timeout` plus the exposure the sensor last reported.
    wait_bound: Duration,
    layout: Option<FrameLayout>,
    armed: bool,
}

impl<S: Sensor> HardwareSession<S> {
    /// Arm `sensor` and apply the fixed readout setup.
    ///
    /// # Errors
    ///
    /// Any driver error from arming or from the setup writes.
    #[instrument(skip_all, fields(serial = %sensor.serial_number()))]
    pub fn open(mut sensor: S, slot_count: usize, frame_timeout: Duration) -> Result<Self, DeviceError> {
        sensor.arm()?;
        let mut session = Self {
            sensor,
            pool: FrameBufferPool::new(),
            slot_count,
            frame_timeout,
            wait_bound: frame_timeout,
            layout: None,
            armed: true,
        };
        for (property, value) in arming_setup() {
            session.sensor.set(property, value)?;
        }
        session.update_wait_bound()?;
        info!(
            readout = %session.sensor.get(Property::PixelReadoutRate)?,
            "sensor armed"
        );
        Ok(session)
    }

    /// Push geometry, binning and trigger settings to the sensor.
    ///
    /// Under internal triggering the exposure is applied and the frame rate
    /// is raised to the highest the sensor then allows.
    ///
    /// # Errors
    ///
    /// * [`DeviceError::IllegalTransition`] while streaming or while a frame
    ///   pool is allocated; tear down first.
    /// * [`DeviceError::DeviceConfig`] when the sensor refuses a value.
    #[instrument(skip(self), fields(geometry = %settings.geometry, trigger = settings.trigger_mode.label()))]
    pub fn configure(&mut self, settings: &SensorSettings) -> Result<(), DeviceError> {
        if self.is_streaming()? {
            return Err(DeviceError::IllegalTransition {
                from: scope_types::AcquisitionState::Streaming,
                action: "configure".to_string(),
            });
        }
        if self.pool.is_allocated() {
            return Err(DeviceError::IllegalTransition {
                from: scope_types::AcquisitionState::Prepared,
                action: "configure".to_string(),
            });
        }

        let sensor = &mut self.sensor;
        sensor.set(Property::AoiBinning, settings.binning.label().into())?;
        sensor.set(Property::AoiHeight, i64::from(settings.geometry.height).into())?;
        sensor.set(Property::AoiWidth, i64::from(settings.geometry.width).into())?;
        sensor.set(Property::VerticallyCenterAoi, true.into())?;
        sensor.set(Property::TriggerMode, settings.trigger_mode.label().into())?;
        if settings.trigger_mode == TriggerMode::Internal {
            sensor.set(Property::ExposureTime, settings.exposure_s.into())?;
            let max_rate = sensor.get(Property::FrameRateMax)?;
            sensor.set(Property::FrameRate, max_rate)?;
        }
        self.update_wait_bound()?;
        debug!(wait_bound_ms = self.wait_bound.as_millis() as u64, "sensor configured");
        Ok(())
    }

    /// Apply the readout setup, size and allocate the frame pool from the
    /// sensor's reported image size, and queue every slot.
    ///
    /// # Errors
    ///
    /// * [`DeviceError::ResourceExhausted`] if the pool cannot be allocated.
    /// * [`DeviceError::IllegalTransition`] if already prepared.
    /// * Driver errors from the setup writes or the queueing.
    #[instrument(skip(self))]
    pub fn prepare(&mut self) -> Result<FrameLayout, DeviceError> {
        if self.pool.is_allocated() {
            return Err(DeviceError::IllegalTransition {
                from: scope_types::AcquisitionState::Prepared,
                action: "prepare".to_string(),
            });
        }
        for (property, value) in readout_setup() {
            self.sensor.set(property, value)?;
        }
        self.sensor.stop_acquisition()?;

        let layout = self.read_layout()?;
        self.pool.allocate(self.slot_count, layout.slot_bytes)?;
        self.layout = Some(layout);
        self.queue_available()?;
        info!(
            geometry = %layout.geometry,
            stride = layout.stride,
            slot_bytes = layout.slot_bytes,
            slots = self.pool.slot_count(),
            "acquisition prepared"
        );
        Ok(layout)
    }

    /// Flush the driver queue and queue every slot again, so acquisition
    /// starts from a full set of empty buffers.
    pub fn requeue_all(&mut self) -> Result<(), DeviceError> {
        if !self.pool.is_allocated() {
            return Err(DeviceError::IllegalTransition {
                from: scope_types::AcquisitionState::Idle,
                action: "queue buffers".to_string(),
            });
        }
        self.reclaim_flushed()?;
        self.queue_available()
    }

    pub fn start(&mut self) -> Result<(), DeviceError> {
        if self.layout.is_none() {
            return Err(DeviceError::IllegalTransition {
                from: scope_types::AcquisitionState::Idle,
                action: "start".to_string(),
            });
        }
        self.sensor.start_acquisition()
    }

    pub fn stop(&mut self) -> Result<(), DeviceError> {
        self.sensor.stop_acquisition()
    }

    /// Stop acquisition if running, reclaim every queued slot and free the
    /// pool. A no-op on an unprepared session.
    #[instrument(skip(self))]
    pub fn teardown(&mut self) -> Result<(), DeviceError> {
        if self.is_streaming()? {
            self.sensor.stop_acquisition()?;
        }
        if !self.pool.is_allocated() {
            return Ok(());
        }
        self.reclaim_flushed()?;
        self.pool.release()?;
        self.layout = None;
        debug!("acquisition torn down");
        Ok(())
    }

    /// Wait for the next filled slot, unpack it into `destination` and hand
    /// the same slot straight back to the driver.
    ///
    /// `destination` must be exactly one converted frame long.
    ///
    /// # Errors
    ///
    /// * [`DeviceError::HardwareTimeout`] when no frame arrives within the
    ///   [wait bound][Self::wait_bound].
    /// * [`DeviceError::IllegalTransition`] on an unprepared session.
    pub fn next_frame(&mut self, destination: &mut [u8]) -> Result<(), DeviceError> {
        let layout = self.layout.ok_or_else(|| DeviceError::IllegalTransition {
            from: scope_types::AcquisitionState::Idle,
            action: "read a frame".to_string(),
        })?;
        if destination.len() != layout.frame_bytes() {
            return Err(DeviceError::HardwareFault {
                component: "frame_buffer".to_string(),
                details: format!(
                    "destination holds {} bytes, a {} frame needs {}",
                    destination.len(),
                    layout.geometry,
                    layout.frame_bytes()
                ),
            });
        }

        let filled = self.sensor.wait_buffer(self.wait_bound)?;
        let converted = self.sensor.convert(filled.as_bytes(), &layout, destination);
        self.pool.checkin(filled)?;
        self.queue_available()?;
        converted
    }

    /// Live acquisition flag, read from the sensor.
    pub fn is_streaming(&self) -> Result<bool, DeviceError> {
        self.sensor
            .get(Property::CameraAcquiring)?
            .as_bool(Property::CameraAcquiring)
    }

    pub fn get(&self, property: Property) -> Result<PropertyValue, DeviceError> {
        self.sensor.get(property)
    }

    /// Write a single property. An exposure change also moves the frame
    /// wait bound.
    ///
    /// # Errors
    ///
    /// [`DeviceError::DeviceConfig`] for read-only properties or values the
    /// sensor refuses.
    pub fn set(&mut self, property: Property, value: PropertyValue) -> Result<(), DeviceError> {
        if property.is_read_only() {
            return Err(DeviceError::rejected(property, "feature is read-only"));
        }
        self.sensor.set(property, value)?;
        if property == Property::ExposureTime {
            self.update_wait_bound()?;
        }
        Ok(())
    }

    /// Snapshot of the identifying and acquisition-relevant properties.
    /// Properties the sensor cannot report are left out.
    pub fn describe(&self) -> Vec<(Property, PropertyValue)> {
        DESCRIBED
            .iter()
            .filter_map(|&property| match self.sensor.get(property) {
                Ok(value) => Some((property, value)),
                Err(e) => {
                    debug!(%property, error = %e, "property not reported");
                    None
                }
            })
            .collect()
    }

    /// Layout of the prepared frames, if any.
    pub fn frame_layout(&self) -> Option<FrameLayout> {
        self.layout
    }

    /// Geometry the sensor currently reports.
    pub fn sensor_geometry(&self) -> Result<Geometry, DeviceError> {
        Geometry::new(
            self.sensor.get(Property::AoiHeight)?.as_int(Property::AoiHeight)?,
            self.sensor.get(Property::AoiWidth)?.as_int(Property::AoiWidth)?,
        )
    }

    pub fn pool(&self) -> &FrameBufferPool {
        &self.pool
    }

    pub fn frame_timeout(&self) -> Duration {
        self.frame_timeout
    }

    /// Longest a single frame wait may take: the configured frame timeout
    /// plus the current exposure, so long exposures never time out.
    pub fn wait_bound(&self) -> Duration {
        self.wait_bound
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    /// Direct driver access. Writes made through it skip the session's
    /// sequencing checks.
    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    /// Tear down, switch cooling off and disarm. Idempotent.
    #[instrument(skip(self), fields(serial = %self.sensor.serial_number()))]
    pub fn close(&mut self) -> Result<(), DeviceError> {
        if !self.armed {
            return Ok(());
        }
        self.teardown()?;
        if let Err(e) = self.sensor.set(Property::SensorCooling, false.into()) {
            warn!(error = %e, "could not switch sensor cooling off");
        }
        self.sensor.disarm()?;
        self.armed = false;
        info!("sensor closed");
        Ok(())
    }

    fn update_wait_bound(&mut self) -> Result<(), DeviceError> {
        let exposure = self
            .sensor
            .get(Property::ExposureTime)?
            .as_float(Property::ExposureTime)?;
        let exposure = Duration::try_from_secs_f64(exposure)
            .map_err(|e| DeviceError::rejected(Property::ExposureTime, format!("reported {exposure} s: {e}")))?;
        self.wait_bound = self.frame_timeout.saturating_add(exposure);
        Ok(())
    }

    fn read_layout(&self) -> Result<FrameLayout, DeviceError> {
        let size = |property: Property| -> Result<usize, DeviceError> {
            let raw = self.sensor.get(property)?.as_int(property)?;
            usize::try_from(raw).map_err(|_| DeviceError::rejected(property, format!("reported {raw}")))
        };
        Ok(FrameLayout {
            geometry: self.sensor_geometry()?,
            stride: size(Property::AoiStride)?,
            slot_bytes: size(Property::ImageSizeBytes)?,
        })
    }

    fn reclaim_flushed(&mut self) -> Result<(), DeviceError> {
        for slot in self.sensor.flush() {
            self.pool.checkin(slot)?;
        }
        Ok(())
    }

    fn queue_available(&mut self) -> Result<(), DeviceError> {
        while let Some(slot) = self.pool.checkout() {
            self.queue(slot)?;
        }
        Ok(())
    }

    fn queue(&mut self, slot: Slot) -> Result<(), DeviceError> {
        match self.sensor.queue_buffer(slot) {
            Ok(()) => Ok(()),
            Err(Rejected { slot, error }) => {
                self.pool.checkin(slot)?;
                Err(error)
            }
        }
    }
}

impl<S: Sensor> Drop for HardwareSession<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "sensor did not close cleanly");
        }
    }
}

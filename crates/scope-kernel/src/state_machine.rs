//! [`AcquisitionStateMachine`] – the single owner of [`AcquisitionState`].
//!
//! ```text
//!          prepare            start
//!   Idle ──────────▶ Prepared ──────▶ Streaming
//!    ▲                 │  ▲   stop /     │
//!    │    teardown     │  └── fault ─────┘
//!    └─────────────────┴─────────────────┘
//! ```
//!
//! Transitions into and out of Streaming are confirmed by reading the
//! sensor's live acquisition flag rather than assumed from the command.

use scope_hal::{HardwareSession, Sensor};
use scope_types::{AcquisitionState, DeviceError, Property, PropertyValue, SensorSettings, TriggerMode};
use tracing::{debug, info, warn};

pub struct AcquisitionStateMachine<S: Sensor> {
    session: HardwareSession<S>,
    state: AcquisitionState,
    settings: SensorSettings,
    frame_bytes: Option<usize>,
    streaming_runs: u64,
}

impl<S: Sensor> AcquisitionStateMachine<S> {
    /// Start in Idle with `settings` as the configuration to prepare with.
    pub fn new(session: HardwareSession<S>, settings: SensorSettings) -> Self {
        Self {
            session,
            state: AcquisitionState::Idle,
            settings,
            frame_bytes: None,
            streaming_runs: 0,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == AcquisitionState::Streaming
    }

    /// Settings most recently applied (or to be applied on prepare).
    pub fn settings(&self) -> &SensorSettings {
        &self.settings
    }

    /// Number of times streaming has begun. Frames read under different
    /// values belong to different hardware runs.
    pub fn streaming_runs(&self) -> u64 {
        self.streaming_runs
    }

    /// Converted frame size while Prepared or Streaming.
    pub fn frame_bytes(&self) -> Option<usize> {
        self.frame_bytes
    }

    /// Idle → Prepared.
    ///
    /// # Errors
    ///
    /// * [`DeviceError::InvalidConfig`] for a zero dimension; nothing is sent
    ///   to the sensor.
    /// * [`DeviceError::IllegalTransition`] unless Idle.
    /// * [`DeviceError::DeviceConfig`] / [`DeviceError::ResourceExhausted`]
    ///   from the session.
    pub fn prepare(&mut self) -> Result<(), DeviceError> {
        validate(&self.settings)?;
        self.expect_state(AcquisitionState::Idle, "prepare")?;
        let settings = self.settings;
        self.apply(settings)
    }

    /// Prepared → Streaming. Returns whether the state changed; a start
    /// while already streaming touches no hardware.
    pub fn start(&mut self) -> Result<bool, DeviceError> {
        match self.state {
            AcquisitionState::Streaming => return Ok(false),
            AcquisitionState::Idle => {
                return Err(DeviceError::IllegalTransition {
                    from: AcquisitionState::Idle,
                    action: "start".to_string(),
                });
            }
            AcquisitionState::Prepared => {}
        }
        self.session.requeue_all()?;
        self.session.start()?;
        if self.session.is_streaming()? {
            self.state = AcquisitionState::Streaming;
            self.streaming_runs += 1;
            info!(run = self.streaming_runs, "acquisition streaming");
            Ok(true)
        } else {
            warn!("sensor did not report acquiring after start");
            Ok(false)
        }
    }

    /// Streaming → Prepared. Buffers stay allocated. Returns whether the
    /// state changed.
    pub fn stop(&mut self) -> Result<bool, DeviceError> {
        if self.state != AcquisitionState::Streaming {
            return Ok(false);
        }
        self.session.stop()?;
        if self.session.is_streaming()? {
            warn!("sensor still reports acquiring after stop");
            return Ok(false);
        }
        self.state = AcquisitionState::Prepared;
        info!("acquisition paused");
        Ok(true)
    }

    /// Prepared / Streaming → Idle. Returns whether the state changed.
    pub fn teardown(&mut self) -> Result<bool, DeviceError> {
        if self.state == AcquisitionState::Idle {
            return Ok(false);
        }
        self.session.teardown()?;
        self.state = AcquisitionState::Idle;
        self.frame_bytes = None;
        debug!("acquisition idle");
        Ok(true)
    }

    /// Re-read the acquisition flag and drop to Prepared if the sensor
    /// stopped streaming on its own. Returns whether the state changed.
    pub fn refresh(&mut self) -> Result<bool, DeviceError> {
        if self.state != AcquisitionState::Streaming || self.session.is_streaming()? {
            return Ok(false);
        }
        warn!("sensor stopped acquiring without a stop command");
        self.state = AcquisitionState::Prepared;
        Ok(true)
    }

    /// Tear down, apply `settings`, re-prepare, and resume streaming if it
    /// was streaming before.
    ///
    /// When the sensor rejects the new settings the previous ones are put
    /// back the same way and the rejection is returned.
    pub fn reconfigure(&mut self, settings: SensorSettings) -> Result<(), DeviceError> {
        validate(&settings)?;
        let was_streaming = self.is_streaming();
        let previous = self.settings;
        self.teardown()?;

        if let Err(e) = self.apply(settings) {
            if !matches!(e, DeviceError::DeviceConfig { .. }) {
                return Err(e);
            }
            warn!(error = %e, "sensor rejected new settings, restoring previous");
            self.session.teardown()?;
            self.apply(previous)?;
            if was_streaming {
                self.start()?;
            }
            return Err(e);
        }
        if was_streaming {
            self.start()?;
        }
        Ok(())
    }

    /// Change exposure in any state. Under internal triggering outside of
    /// streaming the frame rate is raised to the new maximum.
    pub fn set_exposure(&mut self, seconds: f64) -> Result<(), DeviceError> {
        self.session.set(Property::ExposureTime, PropertyValue::Float(seconds))?;
        self.settings.exposure_s = seconds;
        if self.settings.trigger_mode == TriggerMode::Internal && !self.is_streaming() {
            let max_rate = self.session.get(Property::FrameRateMax)?;
            self.session.set(Property::FrameRate, max_rate)?;
        }
        Ok(())
    }

    /// Fill `destination` with the next frame. Only legal while Streaming.
    pub fn next_frame(&mut self, destination: &mut [u8]) -> Result<(), DeviceError> {
        self.expect_state(AcquisitionState::Streaming, "read a frame")?;
        self.session.next_frame(destination)
    }

    pub fn session(&self) -> &HardwareSession<S> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut HardwareSession<S> {
        &mut self.session
    }

    /// Tear down and release the sensor.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        self.teardown()?;
        self.session.close()
    }

    fn apply(&mut self, settings: SensorSettings) -> Result<(), DeviceError> {
        self.session.configure(&settings)?;
        self.settings = settings;
        let layout = self.session.prepare()?;
        self.frame_bytes = Some(layout.frame_bytes());
        self.state = AcquisitionState::Prepared;
        Ok(())
    }

    fn expect_state(&self, expected: AcquisitionState, action: &str) -> Result<(), DeviceError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DeviceError::IllegalTransition {
                from: self.state,
                action: action.to_string(),
            })
        }
    }
}

fn validate(settings: &SensorSettings) -> Result<(), DeviceError> {
    let g = settings.geometry;
    if g.height == 0 || g.width == 0 {
        return Err(DeviceError::InvalidConfig(format!("geometry {g} has a zero dimension")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use scope_hal::sim::{SensorCall, SimSensor};
    use scope_types::{Binning, Geometry};

    fn settings(height: u32, width: u32) -> SensorSettings {
        SensorSettings {
            geometry: Geometry { height, width },
            binning: Binning::X4,
            trigger_mode: TriggerMode::Internal,
            exposure_s: 0.05,
        }
    }

    fn machine_with(sensor: SimSensor, s: SensorSettings) -> AcquisitionStateMachine<SimSensor> {
        let session = HardwareSession::open(sensor, 3, Duration::from_millis(10)).unwrap();
        AcquisitionStateMachine::new(session, s)
    }

    fn machine() -> AcquisitionStateMachine<SimSensor> {
        machine_with(SimSensor::open("VSC-08793").unwrap(), settings(16, 16))
    }

    fn count_starts(m: &AcquisitionStateMachine<SimSensor>) -> usize {
        m.session()
            .sensor()
            .calls()
            .iter()
            .filter(|c| matches!(c, SensorCall::Start))
            .count()
    }

    #[test]
    fn full_lifecycle() {
        let mut m = machine();
        assert_eq!(m.state(), AcquisitionState::Idle);
        m.prepare().unwrap();
        assert_eq!(m.state(), AcquisitionState::Prepared);
        assert_eq!(m.frame_bytes(), Some(16 * 16 * 2));

        assert!(m.start().unwrap());
        assert_eq!(m.state(), AcquisitionState::Streaming);
        assert!(m.stop().unwrap());
        assert_eq!(m.state(), AcquisitionState::Prepared);
        assert!(m.teardown().unwrap());
        assert_eq!(m.state(), AcquisitionState::Idle);
        assert_eq!(m.frame_bytes(), None);
        assert!(!m.teardown().unwrap());
    }

    #[test]
    fn start_twice_calls_hardware_once() {
        let mut m = machine();
        m.prepare().unwrap();
        assert!(m.start().unwrap());
        assert!(!m.start().unwrap());
        assert_eq!(count_starts(&m), 1);
    }

    #[test]
    fn stop_when_not_streaming_is_noop() {
        let mut m = machine();
        assert!(!m.stop().unwrap());
        m.prepare().unwrap();
        assert!(!m.stop().unwrap());
        assert_eq!(m.state(), AcquisitionState::Prepared);
    }

    #[test]
    fn start_from_idle_is_illegal() {
        let mut m = machine();
        assert!(matches!(m.start(), Err(DeviceError::IllegalTransition { .. })));
    }

    #[test]
    fn zero_geometry_rejected_before_hardware() {
        let mut m = machine_with(SimSensor::open("VSC-08793").unwrap(), settings(0, 16));
        let calls_before = m.session().sensor().calls().len();
        assert!(matches!(m.prepare(), Err(DeviceError::InvalidConfig(_))));
        assert_eq!(m.session().sensor().calls().len(), calls_before);

        let mut m = machine();
        m.prepare().unwrap();
        assert!(matches!(m.reconfigure(settings(8, 0)), Err(DeviceError::InvalidConfig(_))));
        assert_eq!(m.state(), AcquisitionState::Prepared);
    }

    #[test]
    fn reconfigure_while_streaming_resumes_with_new_geometry() {
        let mut m = machine();
        m.prepare().unwrap();
        m.start().unwrap();
        assert_eq!(m.streaming_runs(), 1);
        m.reconfigure(settings(8, 4)).unwrap();
        assert_eq!(m.state(), AcquisitionState::Streaming);
        assert_eq!(m.streaming_runs(), 2);
        assert_eq!(m.frame_bytes(), Some(8 * 4 * 2));

        let mut frame = vec![0u8; 8 * 4 * 2];
        m.next_frame(&mut frame).unwrap();
    }

    #[test]
    fn rejected_reconfigure_restores_previous_settings() {
        let mut m = machine();
        m.prepare().unwrap();
        m.start().unwrap();
        let err = m.reconfigure(settings(4096, 16)).unwrap_err();
        assert!(matches!(err, DeviceError::DeviceConfig { .. }));
        assert_eq!(m.settings().geometry, Geometry { height: 16, width: 16 });
        assert_eq!(m.frame_bytes(), Some(16 * 16 * 2));
        assert_eq!(m.state(), AcquisitionState::Streaming);
    }

    #[test]
    fn refresh_detects_sensor_fault() {
        let sensor = SimSensor::open("VSC-08793").unwrap().with_fault_after(1);
        let mut m = machine_with(sensor, settings(4, 4));
        m.prepare().unwrap();
        m.start().unwrap();
        let mut frame = vec![0u8; 32];
        m.next_frame(&mut frame).unwrap();
        assert!(matches!(m.next_frame(&mut frame), Err(DeviceError::HardwareTimeout { .. })));
        assert!(m.refresh().unwrap());
        assert_eq!(m.state(), AcquisitionState::Prepared);
        assert!(!m.refresh().unwrap());
    }

    #[test]
    fn next_frame_requires_streaming() {
        let mut m = machine();
        m.prepare().unwrap();
        let mut frame = vec![0u8; 16 * 16 * 2];
        assert!(matches!(m.next_frame(&mut frame), Err(DeviceError::IllegalTransition { .. })));
    }

    #[test]
    fn set_exposure_updates_settings() {
        let mut m = machine();
        m.prepare().unwrap();
        m.set_exposure(0.2).unwrap();
        assert_eq!(m.settings().exposure_s, 0.2);
        assert_eq!(
            m.session().get(Property::FrameRate).unwrap(),
            m.session().get(Property::FrameRateMax).unwrap()
        );
    }

    #[test]
    fn streaming_runs_count_each_start() {
        let mut m = machine();
        m.prepare().unwrap();
        assert_eq!(m.streaming_runs(), 0);
        m.start().unwrap();
        m.start().unwrap();
        assert_eq!(m.streaming_runs(), 1);
        m.stop().unwrap();
        assert_eq!(m.streaming_runs(), 1);
        m.start().unwrap();
        assert_eq!(m.streaming_runs(), 2);
    }
}

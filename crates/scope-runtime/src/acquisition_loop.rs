//! [`AcquisitionLoop`] – the single cooperative control loop.
//!
//! Each [`step`][AcquisitionLoop::step]:
//!
//! 1. **Poll** – while streaming, a non-blocking receive on the command
//!    source; otherwise a blocking receive (nothing else to do).
//! 2. **Dispatch** – a received line goes to the [`CommandRouter`].
//! 3. **Acquire** – with no command and the sensor streaming, read exactly
//!    `batch_size` frames into one contiguous buffer and hand it to the data
//!    sink in a single send.
//!
//! Commands are not polled between the frames of a batch, so a shutdown
//! arriving mid-batch takes effect once the batch is complete. Batch size
//! and frame size are read once before the first frame; a batch is never
//! resized halfway.
//!
//! A frame timeout does not throw away the frames already read: the next
//! step resumes filling the same batch, so batches stay aligned with
//! external trigger stacks. The partial batch is discarded only when the
//! hardware run it came from has ended.

use scope_hal::Sensor;
use scope_kernel::AcquisitionStateMachine;
use scope_middleware::{CommandSource, DataSink, StatusSink};
use scope_types::{DeviceError, FrameBatch};
use tracing::{debug, info, warn};

use crate::router::CommandRouter;
use crate::status::StatusPublisher;

pub struct AcquisitionLoop<S, C, P, D>
where
    S: Sensor,
    C: CommandSource,
    P: StatusSink,
    D: DataSink,
{
    machine: AcquisitionStateMachine<S>,
    router: CommandRouter,
    commands: C,
    status: StatusPublisher<P>,
    data: D,
    partial: Option<PartialBatch>,
    batches_sent: u64,
}

/// A batch whose frames have only partly arrived.
struct PartialBatch {
    /// [`AcquisitionStateMachine::streaming_runs`] when the batch began.
    run: u64,
    batch_size: u32,
    frame_bytes: usize,
    buffer: Vec<u8>,
    filled: usize,
}

impl<S, C, P, D> AcquisitionLoop<S, C, P, D>
where
    S: Sensor,
    C: CommandSource,
    P: StatusSink,
    D: DataSink,
{
    pub fn new(
        machine: AcquisitionStateMachine<S>,
        router: CommandRouter,
        commands: C,
        status: StatusPublisher<P>,
        data: D,
    ) -> Self {
        Self {
            machine,
            router,
            commands,
            status,
            data,
            partial: None,
            batches_sent: 0,
        }
    }

    /// Publish the current status once, so listeners learn the device is up.
    pub fn announce(&self) -> Result<(), DeviceError> {
        self.status.publish(&self.router.status_record(&self.machine))
    }

    /// Run until a shutdown command clears `process_alive`, then release the
    /// sensor.
    ///
    /// # Errors
    ///
    /// Fatal errors only ([`DeviceError::is_fatal`]); the sensor is released
    /// when the loop is dropped.
    pub fn run(mut self) -> Result<(), DeviceError> {
        info!(
            device = %self.router.config().name(),
            state = %self.machine.state(),
            "acquisition loop running"
        );
        self.announce()?;
        while self.router.is_alive() {
            self.step()?;
        }
        self.machine.close()?;
        info!(batches_sent = self.batches_sent, "acquisition loop stopped");
        Ok(())
    }

    /// One poll / dispatch / acquire iteration.
    pub fn step(&mut self) -> Result<(), DeviceError> {
        let line = if self.machine.is_streaming() {
            self.commands.try_next()?
        } else {
            Some(self.commands.next_blocking()?)
        };
        match line {
            Some(line) => self.router.dispatch(&line, &mut self.machine, &self.status),
            None => self.acquire_batch(),
        }
    }

    fn acquire_batch(&mut self) -> Result<(), DeviceError> {
        let run = self.machine.streaming_runs();
        let mut batch = match self.partial.take() {
            Some(batch) if batch.run == run => {
                debug!(filled = batch.filled, batch_size = batch.batch_size, "resuming batch");
                batch
            }
            stale => {
                if let Some(batch) = stale {
                    warn!(frames_read = batch.filled, batch_size = batch.batch_size, "partial batch discarded");
                }
                match self.begin_batch(run)? {
                    Some(batch) => batch,
                    None => return Ok(()),
                }
            }
        };

        while batch.filled < batch.batch_size as usize {
            let offset = batch.filled * batch.frame_bytes;
            let frame = &mut batch.buffer[offset..offset + batch.frame_bytes];
            if let Err(e) = self.machine.next_frame(frame) {
                self.partial = Some(batch);
                return self.frame_wait_failed(e);
            }
            batch.filled += 1;
        }

        let total = batch.buffer.len();
        let batch_size = batch.batch_size;
        let batch = FrameBatch::new(batch_size, batch.frame_bytes, batch.buffer)?;
        self.data.send_batch(batch)?;
        self.batches_sent += 1;
        debug!(batch_size, bytes = total, sent = self.batches_sent, "batch sent");
        Ok(())
    }

    /// Snapshot batch and frame size and reserve the batch buffer.
    fn begin_batch(&self, run: u64) -> Result<Option<PartialBatch>, DeviceError> {
        let batch_size = self.router.config().batch_size();
        let Some(frame_bytes) = self.machine.frame_bytes() else {
            return Ok(None);
        };
        let total = (batch_size as usize)
            .checked_mul(frame_bytes)
            .ok_or_else(|| DeviceError::ResourceExhausted {
                requested_bytes: usize::MAX,
                details: format!("{batch_size} x {frame_bytes} bytes overflows"),
            })?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(total)
            .map_err(|e| DeviceError::ResourceExhausted {
                requested_bytes: total,
                details: e.to_string(),
            })?;
        buffer.resize(total, 0);
        Ok(Some(PartialBatch {
            run,
            batch_size,
            frame_bytes,
            buffer,
            filled: 0,
        }))
    }

    /// A frame wait failed part way through a batch. The frames read so far
    /// are kept for the next step unless the sensor turns out to have
    /// stopped on its own.
    fn frame_wait_failed(&mut self, error: DeviceError) -> Result<(), DeviceError> {
        if error.is_fatal() {
            return Err(error);
        }
        if let Some(batch) = &self.partial {
            warn!(error = %error, frames_read = batch.filled, batch_size = batch.batch_size, "batch incomplete");
        }
        match self.machine.refresh() {
            Ok(true) => {
                self.partial = None;
                self.announce()
            }
            Ok(false) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "could not re-read acquisition state");
                Ok(())
            }
        }
    }

    pub fn machine(&self) -> &AcquisitionStateMachine<S> {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut AcquisitionStateMachine<S> {
        &mut self.machine
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn batches_sent(&self) -> u64 {
        self.batches_sent
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use scope_hal::HardwareSession;
    use scope_hal::sim::SimSensor;
    use scope_middleware::{CommandSubscriber, MessageBus};
    use scope_types::{
        AcquisitionState, Binning, DeviceConfig, Geometry, Property, PropertyValue, SensorSettings, StatusRecord,
        TriggerMode,
    };
    use tokio::sync::broadcast::{self, error::TryRecvError};

    type BusLoop = AcquisitionLoop<SimSensor, CommandSubscriber, MessageBus, MessageBus>;

    struct Harness {
        bus: MessageBus,
        status: broadcast::Receiver<String>,
        data: broadcast::Receiver<Arc<FrameBatch>>,
        acquisition: BusLoop,
    }

    impl Harness {
        fn new(sensor: SimSensor, height: u32, width: u32, trigger_mode: TriggerMode, batch_size: u32) -> Self {
            let bus = MessageBus::default();
            let commands = bus.subscribe_commands("ZylaCamera");
            let status = bus.subscribe_status();
            let data = bus.subscribe_data();

            let settings = SensorSettings {
                geometry: Geometry { height, width },
                binning: Binning::X4,
                trigger_mode,
                exposure_s: 0.05,
            };
            let config = DeviceConfig::new("ZylaCamera", "VSC-08793", settings, batch_size).unwrap();
            let session = HardwareSession::open(sensor, 4, Duration::from_millis(20)).unwrap();
            let mut machine = AcquisitionStateMachine::new(session, settings);
            machine.prepare().unwrap();

            let acquisition = AcquisitionLoop::new(
                machine,
                CommandRouter::new(config),
                commands,
                StatusPublisher::new(bus.clone(), vec!["hub".to_string()]),
                bus.clone(),
            );
            Self {
                bus,
                status,
                data,
                acquisition,
            }
        }

        fn command(&self, verb: &str) {
            self.bus.publish_command(format!("ZylaCamera {verb}")).unwrap();
        }

        fn next_status(&mut self) -> Option<StatusRecord> {
            match self.status.try_recv() {
                Ok(message) => Some(StatusRecord::from_wire(message.strip_prefix("hub ").unwrap()).unwrap()),
                Err(TryRecvError::Empty) => None,
                Err(e) => panic!("status lane: {e}"),
            }
        }

        fn next_batch(&mut self) -> Option<Arc<FrameBatch>> {
            match self.data.try_recv() {
                Ok(batch) => Some(batch),
                Err(TryRecvError::Empty) => None,
                Err(e) => panic!("data lane: {e}"),
            }
        }
    }

    fn sim() -> SimSensor {
        SimSensor::open("VSC-08793").unwrap()
    }

    #[test]
    fn start_stream_stop_scenario() {
        let mut h = Harness::new(sim(), 512, 512, TriggerMode::Internal, 1);

        h.command("start");
        h.acquisition.step().unwrap();
        assert!(h.next_status().unwrap().streaming);

        h.acquisition.step().unwrap();
        let batch = h.next_batch().unwrap();
        assert_eq!(batch.len(), 512 * 512 * 2);
        assert_eq!(batch.frame_count(), 1);

        h.command("stop");
        h.acquisition.step().unwrap();
        assert!(!h.next_status().unwrap().streaming);
        assert!(h.next_batch().is_none());
        assert_eq!(h.acquisition.machine().state(), AcquisitionState::Prepared);
    }

    #[test]
    fn set_shape_while_streaming_changes_batch_layout() {
        let sensor = sim().with_external_pulses(1000);
        let mut h = Harness::new(sensor, 512, 512, TriggerMode::ExternalExposure, 1);
        h.command("start");
        h.acquisition.step().unwrap();
        h.acquisition.step().unwrap();
        assert_eq!(h.next_batch().unwrap().len(), 512 * 512 * 2);

        h.command("set_shape 4 256 256");
        h.acquisition.step().unwrap();
        let status = h.next_status().unwrap();
        assert!(status.streaming);
        assert_eq!(status.batch_size, 4);

        h.acquisition.step().unwrap();
        let batch = h.next_batch().unwrap();
        assert_eq!(batch.len(), 4 * 256 * 256 * 2);
        assert_eq!(batch.frame_count(), 4);
    }

    #[test]
    fn set_shape_under_internal_trigger_keeps_single_frames() {
        let mut h = Harness::new(sim(), 512, 512, TriggerMode::Internal, 1);
        h.command("start");
        h.acquisition.step().unwrap();
        h.command("set_shape 4 256 256");
        h.acquisition.step().unwrap();
        assert_eq!(h.acquisition.router().config().batch_size(), 1);

        h.acquisition.step().unwrap();
        assert_eq!(h.next_batch().unwrap().len(), 256 * 256 * 2);
    }

    #[test]
    fn batch_frames_arrive_in_order() {
        let sensor = sim().with_external_pulses(1000);
        let mut h = Harness::new(sensor, 4, 4, TriggerMode::ExternalExposure, 3);
        h.command("start");
        h.acquisition.step().unwrap();
        h.acquisition.step().unwrap();

        let batch = h.next_batch().unwrap();
        for frame in 0..3u64 {
            let bytes = batch.frame(frame as usize).unwrap();
            let first = u16::from_le_bytes([bytes[0], bytes[1]]);
            assert_eq!(first, SimSensor::pixel(frame, 0, 0));
        }
    }

    #[test]
    fn commands_wait_for_the_current_batch() {
        let sensor = sim().with_external_pulses(1000);
        let mut h = Harness::new(sensor, 8, 8, TriggerMode::ExternalExposure, 5);
        h.command("start");
        h.acquisition.step().unwrap();

        // No command queued: a full batch is read.
        h.acquisition.step().unwrap();
        assert_eq!(h.next_batch().unwrap().frame_count(), 5);

        // A queued command is handled before any further frames.
        h.command("shutdown");
        let delivered = h.acquisition.machine().session().sensor().frames_delivered();
        h.acquisition.step().unwrap();
        assert_eq!(h.acquisition.machine().session().sensor().frames_delivered(), delivered);
        assert!(!h.acquisition.router().is_alive());
    }

    #[test]
    fn run_exits_on_shutdown_and_sends_no_more_data() {
        let mut h = Harness::new(sim(), 16, 16, TriggerMode::Internal, 1);
        h.command("start");
        h.command("shutdown");

        let Harness {
            mut status,
            mut data,
            acquisition,
            ..
        } = h;
        acquisition.run().unwrap();

        let mut records = Vec::new();
        while let Ok(message) = status.try_recv() {
            records.push(StatusRecord::from_wire(message.strip_prefix("hub ").unwrap()).unwrap());
        }
        assert_eq!(records.len(), 3);
        assert!(records[0].process_alive && !records[0].streaming);
        assert!(records[1].streaming);
        assert!(!records[2].process_alive && !records[2].streaming);
        assert!(matches!(data.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn timeout_drops_batch_and_detects_sensor_fault() {
        let sensor = sim().with_fault_after(1);
        let mut h = Harness::new(sensor, 8, 8, TriggerMode::Internal, 1);
        h.command("start");
        h.acquisition.step().unwrap();
        assert!(h.next_status().unwrap().streaming);

        h.acquisition.step().unwrap();
        assert!(h.next_batch().is_some());

        h.acquisition.step().unwrap();
        assert!(h.next_batch().is_none());
        let status = h.next_status().unwrap();
        assert!(!status.streaming);
        assert!(status.process_alive);
        assert_eq!(h.acquisition.machine().state(), AcquisitionState::Prepared);
    }

    #[test]
    fn missing_trigger_times_out_and_keeps_streaming() {
        let mut h = Harness::new(sim(), 8, 8, TriggerMode::ExternalExposure, 2);
        h.command("start");
        h.acquisition.step().unwrap();
        h.next_status();

        h.acquisition.step().unwrap();
        assert!(h.next_batch().is_none());
        assert!(h.next_status().is_none());
        assert!(h.acquisition.machine().is_streaming());

        h.acquisition.machine_mut().session_mut().sensor_mut().pulse(2);
        h.acquisition.step().unwrap();
        assert_eq!(h.next_batch().unwrap().frame_count(), 2);
    }

    #[test]
    fn exposure_command_reaches_sensor() {
        let mut h = Harness::new(sim(), 8, 8, TriggerMode::Internal, 1);
        h.command("set_exposure 0.01");
        h.acquisition.step().unwrap();
        assert!(h.next_status().is_some());
        assert_eq!(
            h.acquisition.machine().session().get(Property::ExposureTime).unwrap(),
            PropertyValue::Float(0.01)
        );
    }

    fn first_pixels(batch: &FrameBatch) -> Vec<u16> {
        (0..batch.frame_count() as usize)
            .map(|i| {
                let bytes = batch.frame(i).unwrap();
                u16::from_le_bytes([bytes[0], bytes[1]])
            })
            .collect()
    }

    #[test]
    fn slow_trigger_gap_resumes_the_same_batch() {
        let mut h = Harness::new(sim(), 4, 4, TriggerMode::ExternalExposure, 3);
        h.command("start");
        h.acquisition.step().unwrap();
        h.next_status();

        h.acquisition.machine_mut().session_mut().sensor_mut().pulse(2);
        h.acquisition.step().unwrap();
        assert!(h.next_batch().is_none());
        assert!(h.acquisition.machine().is_streaming());

        h.acquisition.machine_mut().session_mut().sensor_mut().pulse(3);
        h.acquisition.step().unwrap();
        let batch = h.next_batch().unwrap();
        let expected: Vec<u16> = (0..3).map(|f| SimSensor::pixel(f, 0, 0)).collect();
        assert_eq!(first_pixels(&batch), expected);
    }

    #[test]
    fn restart_discards_a_partial_batch() {
        let mut h = Harness::new(sim(), 4, 4, TriggerMode::ExternalExposure, 3);
        h.command("start");
        h.acquisition.step().unwrap();

        h.acquisition.machine_mut().session_mut().sensor_mut().pulse(1);
        h.acquisition.step().unwrap();
        assert!(h.next_batch().is_none());

        h.command("stop");
        h.acquisition.step().unwrap();
        h.command("start");
        h.acquisition.step().unwrap();

        h.acquisition.machine_mut().session_mut().sensor_mut().pulse(3);
        h.acquisition.step().unwrap();
        let batch = h.next_batch().unwrap();
        let expected: Vec<u16> = (1..4).map(|f| SimSensor::pixel(f, 0, 0)).collect();
        assert_eq!(first_pixels(&batch), expected);
    }
}

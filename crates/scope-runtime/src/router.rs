//! [`CommandRouter`] – turns command lines into state-machine transitions.
//!
//! The router owns the live [`DeviceConfig`] and the `process_alive` flag.
//! Each line is decoded once into a [`Command`], screened by the
//! [`ConfigVerifier`], applied, and answered with a fresh status record.
//!
//! # Error policy
//!
//! | Error | Handling |
//! |---|---|
//! | malformed line / [`DeviceError::InvalidConfig`] | warn, command ignored, no status |
//! | [`DeviceError::DeviceConfig`] and other hardware errors | warn, state kept, status only if the state moved anyway |
//! | fatal ([`DeviceError::is_fatal`]) | returned to the caller |

use scope_hal::Sensor;
use scope_kernel::{AcquisitionStateMachine, ConfigRequest, ConfigVerifier};
use scope_middleware::StatusSink;
use scope_types::{Command, DeviceConfig, DeviceError, Geometry, StatusRecord, TriggerMode};
use tracing::{debug, info, warn};

use crate::status::StatusPublisher;

pub struct CommandRouter {
    config: DeviceConfig,
    verifier: ConfigVerifier,
    process_alive: bool,
}

impl CommandRouter {
    pub fn new(config: DeviceConfig) -> Self {
        Self::with_verifier(config, ConfigVerifier::with_default_rules())
    }

    pub fn with_verifier(config: DeviceConfig, verifier: ConfigVerifier) -> Self {
        Self {
            config,
            verifier,
            process_alive: true,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_alive(&self) -> bool {
        self.process_alive
    }

    /// Snapshot of the device as the status channel reports it.
    pub fn status_record<S: Sensor>(&self, machine: &AcquisitionStateMachine<S>) -> StatusRecord {
        StatusRecord {
            device_name: self.config.name().to_string(),
            batch_size: self.config.batch_size(),
            streaming: machine.is_streaming(),
            process_alive: self.process_alive,
        }
    }

    /// Handle one command line.
    ///
    /// # Errors
    ///
    /// Only fatal errors are returned; see the module docs.
    pub fn dispatch<S: Sensor, P: StatusSink>(
        &mut self,
        line: &str,
        machine: &mut AcquisitionStateMachine<S>,
        status: &StatusPublisher<P>,
    ) -> Result<(), DeviceError> {
        let command = match Command::decode(line, self.config.name()) {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!(line, "command ignored");
                return Ok(());
            }
            Err(e) => {
                warn!(line, error = %e, "malformed command");
                return Ok(());
            }
        };
        let verb = command.verb();

        if let Some(request) = ConfigRequest::from_command(&command)
            && let Err(e) = self.verifier.verify(&request)
        {
            warn!(verb, error = %e, "configuration rejected");
            return Ok(());
        }

        let before = machine.state();
        match self.apply(command, machine) {
            Ok(true) => status.publish(&self.status_record(machine)),
            Ok(false) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(verb, error = %e, state = %machine.state(), "command failed");
                if machine.state() != before {
                    status.publish(&self.status_record(machine))?;
                }
                Ok(())
            }
        }
    }

    /// Apply a verified command. `Ok(true)` means a status record is due.
    fn apply<S: Sensor>(
        &mut self,
        command: Command,
        machine: &mut AcquisitionStateMachine<S>,
    ) -> Result<bool, DeviceError> {
        match command {
            Command::Start => machine.start(),
            Command::Stop => machine.stop(),
            Command::SetTriggerMode { mode } => {
                let mode = TriggerMode::try_from(mode)?;
                let mut settings = *self.config.settings();
                settings.trigger_mode = mode;
                machine.reconfigure(settings)?;
                self.config.set_trigger_mode(mode);
                info!(mode = mode.label(), batch_size = self.config.batch_size(), "trigger mode set");
                Ok(true)
            }
            Command::SetStackSize { batch_size } => {
                self.config.set_batch_size(to_batch(batch_size)?)?;
                info!(batch_size = self.config.batch_size(), "stack size set");
                Ok(true)
            }
            Command::SetShape {
                batch_size,
                height,
                width,
            } => {
                let geometry = Geometry::new(height, width)?;
                let batch_size = to_batch(batch_size)?;
                let mut settings = *self.config.settings();
                settings.geometry = geometry;
                machine.reconfigure(settings)?;
                self.config.set_geometry(geometry);
                self.config.set_batch_size(batch_size)?;
                info!(%geometry, batch_size = self.config.batch_size(), "shape set");
                Ok(true)
            }
            Command::SetExposure { seconds } => {
                machine.set_exposure(seconds)?;
                self.config.set_exposure(seconds);
                info!(seconds, "exposure set");
                Ok(true)
            }
            Command::PublishStatus => Ok(true),
            Command::Shutdown => {
                self.process_alive = false;
                info!("shutdown requested");
                if let Err(e) = machine.teardown() {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!(error = %e, "teardown during shutdown failed");
                }
                Ok(true)
            }
        }
    }
}

fn to_batch(batch_size: i64) -> Result<u32, DeviceError> {
    u32::try_from(batch_size)
        .map_err(|_| DeviceError::InvalidConfig(format!("batch size {batch_size} out of range")))
}

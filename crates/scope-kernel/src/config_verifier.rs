//! [`ConfigVerifier`] – configuration interlock / rule engine.
//!
//! Configuration commands are passed through [`ConfigVerifier::verify`]
//! before anything reaches the hardware. Every registered [`Rule`] is
//! evaluated in order; the first violation returns a
//! [`DeviceError::InvalidConfig`] and the command is **not** applied.
//!
//! Built-in rules:
//! - [`PositiveGeometryRule`] – rejects zero or negative frame dimensions.
//! - [`BatchSizeRule`] – rejects batch sizes below one or above a cap.
//! - [`TriggerModeRule`] – rejects trigger codes other than Internal or
//!   ExternalExposure.
//! - [`ExposureRule`] – rejects non-positive or non-finite exposures.

use scope_types::{Command, DeviceError, Geometry, TriggerMode};

/// Largest batch the default verifier accepts.
pub const MAX_BATCH_SIZE: i64 = 4096;

// ────────────────────────────────────────────────────────────────────────────
// Request
// ────────────────────────────────────────────────────────────────────────────

/// The configuration part of a command, as raw operator input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigRequest {
    Shape { batch_size: i64, height: i64, width: i64 },
    StackSize { batch_size: i64 },
    TriggerMode { code: i64 },
    Exposure { seconds: f64 },
}

impl ConfigRequest {
    /// `None` for commands that carry no configuration.
    pub fn from_command(command: &Command) -> Option<Self> {
        match *command {
            Command::SetShape {
                batch_size,
                height,
                width,
            } => Some(ConfigRequest::Shape {
                batch_size,
                height,
                width,
            }),
            Command::SetStackSize { batch_size } => Some(ConfigRequest::StackSize { batch_size }),
            Command::SetTriggerMode { mode } => Some(ConfigRequest::TriggerMode { code: mode }),
            Command::SetExposure { seconds } => Some(ConfigRequest::Exposure { seconds }),
            Command::Start | Command::Stop | Command::PublishStatus | Command::Shutdown => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single invariant a configuration request must satisfy.
pub trait Rule: Send + Sync {
    /// Human-readable name used in log lines.
    fn name(&self) -> &str;

    /// `Ok(())` when the request satisfies the invariant, or
    /// [`DeviceError::InvalidConfig`] when it does not.
    fn check(&self, request: &ConfigRequest) -> Result<(), DeviceError>;
}

// ────────────────────────────────────────────────────────────────────────────
// ConfigVerifier
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use scope_kernel::config_verifier::{ConfigRequest, ConfigVerifier};
///
/// let verifier = ConfigVerifier::with_default_rules();
///
/// let ok = ConfigRequest::Shape { batch_size: 4, height: 256, width: 256 };
/// assert!(verifier.verify(&ok).is_ok());
///
/// let flat = ConfigRequest::Shape { batch_size: 4, height: 0, width: 256 };
/// assert!(verifier.verify(&flat).is_err());
/// ```
#[derive(Default)]
pub struct ConfigVerifier {
    rules: Vec<Box<dyn Rule>>,
}

impl ConfigVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier with every built-in rule registered.
    pub fn with_default_rules() -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(PositiveGeometryRule));
        v.add_rule(Box::new(BatchSizeRule {
            max_batch_size: MAX_BATCH_SIZE,
        }));
        v.add_rule(Box::new(TriggerModeRule));
        v.add_rule(Box::new(ExposureRule));
        v
    }

    /// Register a new [`Rule`]. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, request: &ConfigRequest) -> Result<(), DeviceError> {
        for rule in &self.rules {
            rule.check(request)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

pub struct PositiveGeometryRule;

impl Rule for PositiveGeometryRule {
    fn name(&self) -> &str {
        "positive_geometry"
    }

    fn check(&self, request: &ConfigRequest) -> Result<(), DeviceError> {
        if let ConfigRequest::Shape { height, width, .. } = *request {
            Geometry::new(height, width)?;
        }
        Ok(())
    }
}

pub struct BatchSizeRule {
    /// Inclusive upper bound.
    pub max_batch_size: i64,
}

impl Rule for BatchSizeRule {
    fn name(&self) -> &str {
        "batch_size"
    }

    fn check(&self, request: &ConfigRequest) -> Result<(), DeviceError> {
        let batch_size = match *request {
            ConfigRequest::Shape { batch_size, .. } | ConfigRequest::StackSize { batch_size } => batch_size,
            _ => return Ok(()),
        };
        if !(1..=self.max_batch_size).contains(&batch_size) {
            return Err(DeviceError::InvalidConfig(format!(
                "batch size {batch_size} out of [1, {}]",
                self.max_batch_size
            )));
        }
        Ok(())
    }
}

pub struct TriggerModeRule;

impl Rule for TriggerModeRule {
    fn name(&self) -> &str {
        "trigger_mode"
    }

    fn check(&self, request: &ConfigRequest) -> Result<(), DeviceError> {
        if let ConfigRequest::TriggerMode { code } = *request {
            TriggerMode::try_from(code)?;
        }
        Ok(())
    }
}

pub struct ExposureRule;

impl Rule for ExposureRule {
    fn name(&self) -> &str {
        "exposure"
    }

    fn check(&self, request: &ConfigRequest) -> Result<(), DeviceError> {
        if let ConfigRequest::Exposure { seconds } = *request
            && !(seconds.is_finite() && seconds > 0.0)
        {
            return Err(DeviceError::InvalidConfig(format!(
                "exposure must be a positive number of seconds, got {seconds}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(batch_size: i64, height: i64, width: i64) -> ConfigRequest {
        ConfigRequest::Shape {
            batch_size,
            height,
            width,
        }
    }

    #[test]
    fn valid_shape_passes() {
        let v = ConfigVerifier::with_default_rules();
        assert!(v.verify(&shape(4, 256, 256)).is_ok());
    }

    #[test]
    fn zero_or_negative_geometry_rejected() {
        let v = ConfigVerifier::with_default_rules();
        for bad in [shape(1, 0, 10), shape(1, 10, 0), shape(1, -5, 10)] {
            assert!(matches!(v.verify(&bad), Err(DeviceError::InvalidConfig(_))));
        }
    }

    #[test]
    fn batch_size_bounds() {
        let v = ConfigVerifier::with_default_rules();
        assert!(v.verify(&ConfigRequest::StackSize { batch_size: 1 }).is_ok());
        assert!(v.verify(&ConfigRequest::StackSize { batch_size: MAX_BATCH_SIZE }).is_ok());
        assert!(v.verify(&ConfigRequest::StackSize { batch_size: 0 }).is_err());
        assert!(v.verify(&ConfigRequest::StackSize { batch_size: MAX_BATCH_SIZE + 1 }).is_err());
        assert!(v.verify(&shape(-1, 8, 8)).is_err());
    }

    #[test]
    fn unknown_trigger_code_rejected() {
        let v = ConfigVerifier::with_default_rules();
        assert!(v.verify(&ConfigRequest::TriggerMode { code: 1 }).is_ok());
        assert!(v.verify(&ConfigRequest::TriggerMode { code: 2 }).is_ok());
        assert!(v.verify(&ConfigRequest::TriggerMode { code: 3 }).is_err());
    }

    #[test]
    fn exposure_must_be_positive_and_finite() {
        let v = ConfigVerifier::with_default_rules();
        assert!(v.verify(&ConfigRequest::Exposure { seconds: 0.05 }).is_ok());
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(v.verify(&ConfigRequest::Exposure { seconds: bad }).is_err());
        }
    }

    #[test]
    fn empty_verifier_always_passes() {
        let v = ConfigVerifier::new();
        assert!(v.verify(&shape(0, 0, 0)).is_ok());
    }

    #[test]
    fn plain_commands_carry_no_request() {
        assert_eq!(ConfigRequest::from_command(&Command::Start), None);
        assert_eq!(
            ConfigRequest::from_command(&Command::SetStackSize { batch_size: 3 }),
            Some(ConfigRequest::StackSize { batch_size: 3 })
        );
    }

    #[test]
    fn first_failing_rule_short_circuits() {
        struct Named(&'static str);
        impl Rule for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn check(&self, _: &ConfigRequest) -> Result<(), DeviceError> {
                Err(DeviceError::InvalidConfig(self.0.to_string()))
            }
        }
        let mut v = ConfigVerifier::new();
        v.add_rule(Box::new(Named("first")));
        v.add_rule(Box::new(Named("second")));
        assert_eq!(
            v.verify(&ConfigRequest::StackSize { batch_size: 1 }),
            Err(DeviceError::InvalidConfig("first".to_string()))
        );
    }
}

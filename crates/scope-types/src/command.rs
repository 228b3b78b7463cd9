//! Inbound command decoding.
//!
//! Bus messages are UTF-8 text of the form `<topic> <verb> [args...]`. They
//! are decoded once, at the bus boundary, into a [`Command`]; everything past
//! this point matches on the enum instead of comparing strings.

use serde::{Deserialize, Serialize};

use crate::DeviceError;

/// A control-plane request addressed to one device.
///
/// Numeric arguments are kept as they arrived (signed) so that range checks
/// happen in one place, before anything reaches the hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Command {
    Start,
    Stop,
    SetTriggerMode { mode: i64 },
    SetStackSize { batch_size: i64 },
    SetShape { batch_size: i64, height: i64, width: i64 },
    SetExposure { seconds: f64 },
    PublishStatus,
    Shutdown,
}

impl Command {
    /// Decode `message` for the device called `device`.
    ///
    /// Returns `Ok(None)` for traffic that is not for this device (topic must
    /// match exactly, case-sensitive) and for verbs this device does not know;
    /// newer command sets share the bus.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidConfig`] when a known verb carries the wrong
    /// number of arguments or an argument does not parse.
    pub fn decode(message: &str, device: &str) -> Result<Option<Command>, DeviceError> {
        let mut tokens = message.split_whitespace();
        if tokens.next() != Some(device) {
            return Ok(None);
        }
        let Some(verb) = tokens.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = tokens.collect();

        let command = match verb {
            "start" => Command::Start,
            "stop" => Command::Stop,
            "publish_status" => Command::PublishStatus,
            "shutdown" => Command::Shutdown,
            "set_trigger_mode" => {
                let [mode] = expect_args::<1>(verb, &args)?;
                Command::SetTriggerMode { mode: int_arg(verb, mode)? }
            }
            "set_stack_size" => {
                let [n] = expect_args::<1>(verb, &args)?;
                Command::SetStackSize { batch_size: int_arg(verb, n)? }
            }
            "set_shape" => {
                let [batch, height, width] = expect_args::<3>(verb, &args)?;
                Command::SetShape {
                    batch_size: int_arg(verb, batch)?,
                    height: int_arg(verb, height)?,
                    width: int_arg(verb, width)?,
                }
            }
            "set_exposure" => {
                let [seconds] = expect_args::<1>(verb, &args)?;
                let seconds = seconds.parse::<f64>().map_err(|e| {
                    DeviceError::InvalidConfig(format!("{verb}: {seconds:?} is not a number: {e}"))
                })?;
                Command::SetExposure { seconds }
            }
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    /// The wire verb, for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::SetTriggerMode { .. } => "set_trigger_mode",
            Command::SetStackSize { .. } => "set_stack_size",
            Command::SetShape { .. } => "set_shape",
            Command::SetExposure { .. } => "set_exposure",
            Command::PublishStatus => "publish_status",
            Command::Shutdown => "shutdown",
        }
    }
}

fn expect_args<'a, const N: usize>(verb: &str, args: &[&'a str]) -> Result<[&'a str; N], DeviceError> {
    <[&str; N]>::try_from(args).map_err(|_| {
        DeviceError::InvalidConfig(format!(
            "{verb} takes {N} argument(s), got {}",
            args.len()
        ))
    })
}

fn int_arg(verb: &str, raw: &str) -> Result<i64, DeviceError> {
    raw.parse::<i64>()
        .map_err(|e| DeviceError::InvalidConfig(format!("{verb}: {raw:?} is not an integer: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "ZylaCamera";

    #[test]
    fn decodes_bare_verbs() {
        assert_eq!(Command::decode("ZylaCamera start", NAME).unwrap(), Some(Command::Start));
        assert_eq!(Command::decode("ZylaCamera stop", NAME).unwrap(), Some(Command::Stop));
        assert_eq!(
            Command::decode("ZylaCamera publish_status", NAME).unwrap(),
            Some(Command::PublishStatus)
        );
        assert_eq!(Command::decode("ZylaCamera shutdown", NAME).unwrap(), Some(Command::Shutdown));
    }

    #[test]
    fn decodes_set_shape_arguments_in_order() {
        let cmd = Command::decode("ZylaCamera set_shape 4 256 128", NAME).unwrap();
        assert_eq!(
            cmd,
            Some(Command::SetShape {
                batch_size: 4,
                height: 256,
                width: 128
            })
        );
    }

    #[test]
    fn keeps_negative_numbers_for_validation() {
        let cmd = Command::decode("ZylaCamera set_stack_size -3", NAME).unwrap();
        assert_eq!(cmd, Some(Command::SetStackSize { batch_size: -3 }));
    }

    #[test]
    fn other_devices_are_ignored() {
        assert_eq!(Command::decode("ZylaCamera1 start", NAME).unwrap(), None);
        assert_eq!(Command::decode("zylacamera start", NAME).unwrap(), None);
        assert_eq!(Command::decode("FlirCamera shutdown", NAME).unwrap(), None);
    }

    #[test]
    fn unknown_verbs_and_empty_messages_are_ignored() {
        assert_eq!(Command::decode("ZylaCamera set_gain 3", NAME).unwrap(), None);
        assert_eq!(Command::decode("ZylaCamera", NAME).unwrap(), None);
        assert_eq!(Command::decode("", NAME).unwrap(), None);
    }

    #[test]
    fn malformed_arguments_are_invalid_config() {
        assert!(matches!(
            Command::decode("ZylaCamera set_stack_size", NAME),
            Err(DeviceError::InvalidConfig(_))
        ));
        assert!(matches!(
            Command::decode("ZylaCamera set_shape 4 256", NAME),
            Err(DeviceError::InvalidConfig(_))
        ));
        assert!(matches!(
            Command::decode("ZylaCamera set_trigger_mode internal", NAME),
            Err(DeviceError::InvalidConfig(_))
        ));
        assert!(matches!(
            Command::decode("ZylaCamera set_exposure fast", NAME),
            Err(DeviceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn decodes_exposure_seconds() {
        let cmd = Command::decode("ZylaCamera set_exposure 0.01", NAME).unwrap();
        assert_eq!(cmd, Some(Command::SetExposure { seconds: 0.01 }));
        assert_eq!(cmd.unwrap().verb(), "set_exposure");
    }
}

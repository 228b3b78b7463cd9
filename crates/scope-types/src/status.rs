//! Outbound records: the status snapshot and the frame batch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::DeviceError;

/// Point-in-time snapshot of a device, emitted after every observable
/// transition. Carries no identity; discard it once sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub device_name: String,
    pub batch_size: u32,
    pub streaming: bool,
    pub process_alive: bool,
}

#[derive(Serialize, Deserialize)]
struct WireStatus {
    stack_size: u32,
    running_status: bool,
    device_status: bool,
}

impl StatusRecord {
    /// Compact JSON payload:
    /// `{"<name>": {"stack_size": n, "running_status": b, "device_status": b}}`.
    pub fn to_wire(&self) -> Result<String, DeviceError> {
        let mut body = BTreeMap::new();
        body.insert(
            self.device_name.as_str(),
            WireStatus {
                stack_size: self.batch_size,
                running_status: self.streaming,
                device_status: self.process_alive,
            },
        );
        serde_json::to_string(&body).map_err(|e| DeviceError::Serialization(e.to_string()))
    }

    /// Parse a payload produced by [`StatusRecord::to_wire`].
    pub fn from_wire(payload: &str) -> Result<Self, DeviceError> {
        let body: BTreeMap<String, WireStatus> =
            serde_json::from_str(payload).map_err(|e| DeviceError::Serialization(e.to_string()))?;
        let mut entries = body.into_iter();
        match (entries.next(), entries.next()) {
            (Some((device_name, s)), None) => Ok(Self {
                device_name,
                batch_size: s.stack_size,
                streaming: s.running_status,
                process_alive: s.device_status,
            }),
            _ => Err(DeviceError::Serialization(
                "status payload must hold exactly one device".to_string(),
            )),
        }
    }
}

/// `frame_count` consecutive frames of `frame_bytes` each, laid out back to
/// back for a single data-channel send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    frame_count: u32,
    frame_bytes: usize,
    data: Vec<u8>,
}

impl FrameBatch {
    /// Wrap a filled buffer. `data.len()` must equal
    /// `frame_count * frame_bytes`.
    pub fn new(frame_count: u32, frame_bytes: usize, data: Vec<u8>) -> Result<Self, DeviceError> {
        let expected = frame_count as usize * frame_bytes;
        if data.len() != expected {
            return Err(DeviceError::Serialization(format!(
                "batch holds {} bytes, expected {frame_count} x {frame_bytes}",
                data.len()
            )));
        }
        Ok(Self {
            frame_count,
            frame_bytes,
            data,
        })
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Frame `index` within the batch.
    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        self.data.chunks_exact(self.frame_bytes.max(1)).nth(index)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

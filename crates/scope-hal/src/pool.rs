//! [`FrameBufferPool`] – fixed set of hardware-writable frame slots.
//!
//! Every slot is in exactly one of two places: queued to the hardware (the
//! sensor holds the [`Slot`] value) or available (the pool holds it). Moving
//! the `Slot` is the ownership transfer, so the application cannot touch a
//! queued slot. The pool only counts how many are out.

use scope_types::DeviceError;
use tracing::{debug, info};

/// Slots kept in flight. Enough for the sensor to hide its internal latency;
/// not tied to the batch size and not changeable by commands.
pub const DEFAULT_SLOT_COUNT: usize = 10;

/// One frame-sized memory region exchanged with the hardware.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    bytes: Box<[u8]>,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Write access for whoever currently owns the slot (the sensor while it
    /// is queued).
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[derive(Debug, Default)]
pub struct FrameBufferPool {
    slot_count: usize,
    slot_byte_size: usize,
    available: Vec<Slot>,
    queued: usize,
}

impl FrameBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `slot_count` slots of `slot_byte_size` bytes each.
    ///
    /// # Errors
    ///
    /// * [`DeviceError::ResourceExhausted`] if the memory cannot be reserved.
    /// * [`DeviceError::InvalidConfig`] for a zero count or size.
    /// * [`DeviceError::HardwareFault`] if the pool is already allocated;
    ///   release it first.
    pub fn allocate(&mut self, slot_count: usize, slot_byte_size: usize) -> Result<(), DeviceError> {
        if self.is_allocated() {
            return Err(DeviceError::HardwareFault {
                component: "frame_pool".to_string(),
                details: "pool already allocated; release before reallocating".to_string(),
            });
        }
        if slot_count == 0 || slot_byte_size == 0 {
            return Err(DeviceError::InvalidConfig(format!(
                "frame pool needs a positive slot count and size, got {slot_count} x {slot_byte_size}"
            )));
        }
        let total = slot_count
            .checked_mul(slot_byte_size)
            .ok_or_else(|| DeviceError::ResourceExhausted {
                requested_bytes: usize::MAX,
                details: format!("{slot_count} x {slot_byte_size} bytes overflows the address space"),
            })?;

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(slot_count)
            .map_err(|e| exhausted(total, e))?;
        for index in 0..slot_count {
            let mut bytes = Vec::new();
            bytes
                .try_reserve_exact(slot_byte_size)
                .map_err(|e| exhausted(total, e))?;
            bytes.resize(slot_byte_size, 0);
            slots.push(Slot {
                index,
                bytes: bytes.into_boxed_slice(),
            });
        }

        info!(
            slot_count,
            slot_byte_size,
            total_mb = total as f64 / (1024.0 * 1024.0),
            "frame pool allocated"
        );
        self.slot_count = slot_count;
        self.slot_byte_size = slot_byte_size;
        self.available = slots;
        self.queued = 0;
        Ok(())
    }

    /// Hand an available slot to the hardware side.
    pub fn checkout(&mut self) -> Option<Slot> {
        let slot = self.available.pop()?;
        self.queued += 1;
        Some(slot)
    }

    /// Take back a slot the hardware has released.
    ///
    /// # Errors
    ///
    /// [`DeviceError::HardwareFault`] when the slot does not belong to this
    /// pool (wrong size or index) or nothing is checked out.
    pub fn checkin(&mut self, slot: Slot) -> Result<(), DeviceError> {
        if self.queued == 0 || slot.len() != self.slot_byte_size || slot.index >= self.slot_count {
            return Err(DeviceError::HardwareFault {
                component: "frame_pool".to_string(),
                details: format!(
                    "slot {} ({} bytes) is not an outstanding slot of this pool",
                    slot.index,
                    slot.len()
                ),
            });
        }
        self.queued -= 1;
        self.available.push(slot);
        Ok(())
    }

    /// Free every slot.
    ///
    /// # Errors
    ///
    /// [`DeviceError::BuffersInFlight`] while any slot is still queued; flush
    /// the hardware first.
    pub fn release(&mut self) -> Result<(), DeviceError> {
        if self.queued > 0 {
            return Err(DeviceError::BuffersInFlight(self.queued));
        }
        debug!(slot_count = self.slot_count, "frame pool released");
        self.available = Vec::new();
        self.slot_count = 0;
        self.slot_byte_size = 0;
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        self.slot_count > 0
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_byte_size(&self) -> usize {
        self.slot_byte_size
    }

    /// Slots currently owned by the hardware.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Slots currently owned by the application.
    pub fn available(&self) -> usize {
        self.available.len()
    }
}

fn exhausted(requested_bytes: usize, e: std::collections::TryReserveError) -> DeviceError {
    DeviceError::ResourceExhausted {
        requested_bytes,
        details: e.to_string(),
    }
}

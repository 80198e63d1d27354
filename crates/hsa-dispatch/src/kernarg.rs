//! Kernel-argument buffer packing.
//!
//! [`KernargWriter`] only does the bookkeeping: it decides where the next
//! argument lands inside a reserved kernarg allocation. The bytes themselves
//! are written through the runtime by the dispatch.

use crate::error::UsageError;
use crate::handle::DeviceAddress;

/// Round `offset` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Cursor over a reserved kernarg allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernargWriter {
    base: DeviceAddress,
    capacity: usize,
    offset: usize,
}

impl KernargWriter {
    pub fn new(base: DeviceAddress, capacity: usize) -> Self {
        Self { base, capacity, offset: 0 }
    }

    /// Base address written into the dispatch packet.
    pub fn base(&self) -> DeviceAddress {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reserve `size` bytes aligned to `align` and advance the cursor.
    ///
    /// Returns the argument's start offset. On error the cursor is left
    /// untouched.
    pub fn place(&mut self, size: usize, align: usize) -> Result<usize, UsageError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(UsageError::InvalidAlignment(align));
        }
        let start = align_up(self.offset, align);
        let end = start.checked_add(size).filter(|&end| end <= self.capacity).ok_or(
            UsageError::KernargOverflow { offset: start, size, capacity: self.capacity },
        )?;
        self.offset = end;
        Ok(start)
    }

    /// Address of the argument placed at `offset`.
    pub fn address_of(&self, offset: usize) -> DeviceAddress {
        self.base.offset(offset)
    }
}

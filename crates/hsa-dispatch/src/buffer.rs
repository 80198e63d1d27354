//! Dual-mapped buffer descriptor.

use crate::handle::DeviceAddress;

/// One allocation as seen from the host and from the agent.
///
/// A `Buffer` never owns memory. The runtime's region pools own the backing
/// allocations for the lifetime of the runtime; this is only a description of
/// where they live. When the buffer has no separate device-local mapping the
/// two addresses coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    size: usize,
    local: DeviceAddress,
    system: DeviceAddress,
}

impl Buffer {
    /// A device-local allocation with a host-visible staging mirror.
    pub fn dual(size: usize, local: DeviceAddress, system: DeviceAddress) -> Self {
        Self { size, local, system }
    }

    /// A single host-visible allocation used directly by the agent.
    pub fn shared(size: usize, address: DeviceAddress) -> Self {
        Self { size, local: address, system: address }
    }

    /// Address the kernel should be given.
    pub fn local_ptr(&self) -> DeviceAddress {
        self.local
    }

    /// Host-visible staging address.
    pub fn system_ptr(&self) -> DeviceAddress {
        self.system
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_local(&self) -> bool {
        self.local != self.system
    }
}

//! Kernels executed by the simulated agent.

use super::memory::{Accessor, SimMemory};
use crate::error::HsaResult;
use crate::handle::DeviceAddress;
use crate::packet::DispatchPacket;
use crate::status::HsaStatus;
use bytemuck::Pod;
use std::sync::Arc;
use thiserror::Error;

/// Magic prefix of a simulated code object.
pub const CODE_OBJECT_MAGIC: &[u8; 4] = b"SIMK";

/// A kernel aborted on the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({status:?})")]
pub struct KernelFault {
    pub status: HsaStatus,
    pub message: String,
}

impl KernelFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self { status: HsaStatus::Exception, message: message.into() }
    }
}

impl From<HsaStatus> for KernelFault {
    fn from(status: HsaStatus) -> Self {
        Self { status, message: "memory access fault".into() }
    }
}

pub type SimKernel = Arc<dyn Fn(&KernelContext<'_>) -> Result<(), KernelFault> + Send + Sync>;

/// View of one dispatch handed to a kernel.
pub struct KernelContext<'a> {
    packet: &'a DispatchPacket,
    memory: &'a SimMemory,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(packet: &'a DispatchPacket, memory: &'a SimMemory) -> Self {
        Self { packet, memory }
    }

    pub fn grid_size(&self) -> [u32; 3] {
        self.packet.grid_size
    }

    pub fn workgroup_size(&self) -> [u16; 3] {
        self.packet.workgroup_size
    }

    pub fn dimensions(&self) -> u16 {
        self.packet.dimensions
    }

    pub fn kernarg_address(&self) -> DeviceAddress {
        self.packet.kernarg_address
    }

    /// Read the argument at byte `offset` of the kernarg segment.
    pub fn kernarg<T: Pod>(&self, offset: usize) -> HsaResult<T> {
        if self.packet.kernarg_address.is_null() {
            return Err(HsaStatus::InvalidArgument);
        }
        self.read(self.packet.kernarg_address.offset(offset))
    }

    pub fn read<T: Pod>(&self, address: DeviceAddress) -> HsaResult<T> {
        let mut value = T::zeroed();
        self.memory.read(address, bytemuck::bytes_of_mut(&mut value), Accessor::Agent)?;
        Ok(value)
    }

    pub fn write<T: Pod>(&self, address: DeviceAddress, value: &T) -> HsaResult<()> {
        self.memory.write(address, bytemuck::bytes_of(value), Accessor::Agent)
    }

    /// Global work-item ids, x fastest.
    pub fn work_items(&self) -> impl Iterator<Item = [u32; 3]> + use<> {
        let [gx, gy, gz] = self.packet.grid_size;
        (0..gz).flat_map(move |z| (0..gy).flat_map(move |y| (0..gx).map(move |x| [x, y, z])))
    }
}

/// Build a code object exporting `symbols`.
pub fn encode_code_object(symbols: &[&str]) -> Vec<u8> {
    let mut out = CODE_OBJECT_MAGIC.to_vec();
    for name in symbols {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    out
}

/// Parse a code object into its symbol names.
pub fn decode_code_object(bytes: &[u8]) -> HsaResult<Vec<String>> {
    let body = bytes.strip_prefix(CODE_OBJECT_MAGIC).ok_or(HsaStatus::InvalidCodeObject)?;
    let body = body.strip_suffix(&[0u8]).ok_or(HsaStatus::InvalidCodeObject)?;
    body.split(|&b| b == 0)
        .map(|name| match std::str::from_utf8(name) {
            Ok(s) if !s.is_empty() => Ok(s.to_string()),
            _ => Err(HsaStatus::InvalidCodeObject),
        })
        .collect()
}

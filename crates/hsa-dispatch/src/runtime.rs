//! The device runtime seam.
//!
//! [`Runtime`] is everything the dispatch path needs from an HSA-style
//! runtime: agent and region queries, allocation, host access and copies,
//! queue and signal creation, and code-object loading. The crate ships
//! [`SimRuntime`](crate::sim::SimRuntime); a binding to a real runtime library
//! implements the same trait.

use crate::error::HsaResult;
use crate::handle::{Agent, CodeObject, DeviceAddress, Executable, KernelObject, Region};
use crate::queue::Queue;
use crate::signal::Signal;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub name: String,
    pub device_type: DeviceType,
    /// Largest queue the agent accepts, in packets.
    pub queue_max_size: u32,
    /// Largest number of work-items in one workgroup.
    pub workgroup_max_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Global,
    ReadOnly,
    Private,
    Group,
}

/// Global-segment region flags (`hsa_region_global_flag_t`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionFlags(pub u32);

impl RegionFlags {
    pub const KERNARG: Self = Self(1);
    pub const FINE_GRAINED: Self = Self(2);
    pub const COARSE_GRAINED: Self = Self(4);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RegionFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub segment: Segment,
    pub flags: RegionFlags,
    /// Pool capacity in bytes.
    pub size: usize,
    /// Whether the host may read and write allocations directly.
    pub host_accessible: bool,
}

pub trait Runtime: Send + Sync {
    /// All agents known to the runtime.
    fn agents(&self) -> HsaResult<Vec<Agent>>;

    fn agent_info(&self, agent: Agent) -> HsaResult<AgentInfo>;

    /// Regions reachable from `agent`.
    fn agent_regions(&self, agent: Agent) -> HsaResult<Vec<Region>>;

    fn region_info(&self, region: Region) -> HsaResult<RegionInfo>;

    fn memory_allocate(&self, region: Region, size: usize) -> HsaResult<DeviceAddress>;

    /// Blocking copy of `size` bytes between any two allocations.
    fn memory_copy(&self, dst: DeviceAddress, src: DeviceAddress, size: usize) -> HsaResult<()>;

    /// Host write into host-accessible memory.
    fn memory_write(&self, dst: DeviceAddress, bytes: &[u8]) -> HsaResult<()>;

    /// Host read from host-accessible memory.
    fn memory_read(&self, src: DeviceAddress, out: &mut [u8]) -> HsaResult<()>;

    /// Create a queue serviced by `agent`.
    fn queue_create(&self, agent: Agent, size: u32) -> HsaResult<Arc<Queue>>;

    fn signal_create(&self, initial: i64) -> HsaResult<Signal>;

    fn code_object_deserialize(&self, bytes: &[u8]) -> HsaResult<CodeObject>;

    fn executable_create(&self) -> HsaResult<Executable>;

    fn executable_load_code_object(
        &self,
        executable: Executable,
        agent: Agent,
        code_object: CodeObject,
    ) -> HsaResult<()>;

    fn executable_freeze(&self, executable: Executable) -> HsaResult<()>;

    /// Resolve a kernel symbol to the entry point written into packets.
    fn executable_symbol(
        &self,
        executable: Executable,
        name: &str,
        agent: Agent,
    ) -> HsaResult<KernelObject>;
}

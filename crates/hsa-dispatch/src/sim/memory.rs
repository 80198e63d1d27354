//! Simulated agent address space.
//!
//! Each region is a bump-allocated pool at its own base address. Allocations
//! are backed by host vectors; addresses are plain `u64`s so they can travel
//! through kernarg buffers like real device pointers.

use crate::error::HsaResult;
use crate::handle::{DeviceAddress, Region};
use crate::kernarg::align_up;
use crate::status::HsaStatus;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Allocation granularity inside a pool.
pub const ALLOCATION_ALIGN: usize = 64;

#[derive(Debug)]
struct Pool {
    base: u64,
    capacity: usize,
    used: usize,
    host_accessible: bool,
}

#[derive(Debug)]
struct Allocation {
    bytes: Vec<u8>,
    host_accessible: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    pools: HashMap<Region, Pool>,
    allocations: BTreeMap<u64, Allocation>,
}

#[derive(Debug, Default)]
pub struct SimMemory {
    state: Mutex<MemoryState>,
}

/// Who is touching memory: the host only reaches host-accessible pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    Host,
    Agent,
}

impl MemoryState {
    fn find(
        &mut self,
        address: DeviceAddress,
        len: usize,
        accessor: Accessor,
    ) -> HsaResult<(&mut Allocation, usize)> {
        let (&base, alloc) =
            self.allocations.range_mut(..=address.0).next_back().ok_or(HsaStatus::InvalidAllocation)?;
        let offset = (address.0 - base) as usize;
        if offset.checked_add(len).is_none_or(|end| end > alloc.bytes.len()) {
            return Err(HsaStatus::InvalidAllocation);
        }
        if accessor == Accessor::Host && !alloc.host_accessible {
            return Err(HsaStatus::InvalidAllocation);
        }
        Ok((alloc, offset))
    }
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a pool for `region`.
    pub fn add_pool(&self, region: Region, base: u64, capacity: usize, host_accessible: bool) {
        self.state().pools.insert(region, Pool { base, capacity, used: 0, host_accessible });
    }

    pub fn allocate(&self, region: Region, size: usize) -> HsaResult<DeviceAddress> {
        if size == 0 {
            return Err(HsaStatus::InvalidArgument);
        }
        let mut state = self.state();
        let pool = state.pools.get_mut(&region).ok_or(HsaStatus::InvalidRegion)?;
        let end = pool
            .used
            .checked_add(size)
            .filter(|&end| end <= pool.capacity)
            .ok_or(HsaStatus::OutOfResources)?;
        let address = pool.base + pool.used as u64;
        pool.used = align_up(end, ALLOCATION_ALIGN).min(pool.capacity);
        let host_accessible = pool.host_accessible;
        state.allocations.insert(address, Allocation { bytes: vec![0; size], host_accessible });
        Ok(DeviceAddress(address))
    }

    /// Bytes still available in `region`.
    pub fn available(&self, region: Region) -> Option<usize> {
        self.state().pools.get(&region).map(|p| p.capacity - p.used)
    }

    pub fn read(&self, src: DeviceAddress, out: &mut [u8], accessor: Accessor) -> HsaResult<()> {
        let mut state = self.state();
        let (alloc, offset) = state.find(src, out.len(), accessor)?;
        out.copy_from_slice(&alloc.bytes[offset..offset + out.len()]);
        Ok(())
    }

    pub fn write(&self, dst: DeviceAddress, bytes: &[u8], accessor: Accessor) -> HsaResult<()> {
        let mut state = self.state();
        let (alloc, offset) = state.find(dst, bytes.len(), accessor)?;
        alloc.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Agent-side copy between any two allocations.
    pub fn copy(&self, dst: DeviceAddress, src: DeviceAddress, size: usize) -> HsaResult<()> {
        let mut staging = vec![0u8; size];
        self.read(src, &mut staging, Accessor::Agent)?;
        self.write(dst, &staging, Accessor::Agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> SimMemory {
        let m = SimMemory::new();
        m.add_pool(Region(1), 0x1000_0000, 256, true);
        m.add_pool(Region(2), 0x2000_0000, 4096, false);
        m
    }

    #[test]
    fn allocations_are_aligned_and_bounded() {
        let m = memory();
        let a = m.allocate(Region(1), 16).unwrap();
        let b = m.allocate(Region(1), 16).unwrap();
        assert_eq!(a, DeviceAddress(0x1000_0000));
        assert_eq!(b.0 - a.0, ALLOCATION_ALIGN as u64);
        assert_eq!(m.allocate(Region(1), 512), Err(HsaStatus::OutOfResources));
        assert_eq!(m.allocate(Region(9), 8), Err(HsaStatus::InvalidRegion));
        assert_eq!(m.allocate(Region(1), 0), Err(HsaStatus::InvalidArgument));
    }

    #[test]
    fn oversized_request_on_used_pool_is_out_of_resources() {
        let m = memory();
        m.allocate(Region(1), 16).unwrap();
        assert_eq!(m.allocate(Region(1), usize::MAX), Err(HsaStatus::OutOfResources));
        assert_eq!(m.allocate(Region(1), usize::MAX - 8), Err(HsaStatus::OutOfResources));
        assert_eq!(m.available(Region(1)), Some(256 - ALLOCATION_ALIGN));
    }

    #[test]
    fn host_cannot_touch_device_local_pool() {
        let m = memory();
        let local = m.allocate(Region(2), 8).unwrap();
        assert_eq!(m.write(local, &[1; 8], Accessor::Host), Err(HsaStatus::InvalidAllocation));
        assert!(m.write(local, &[1; 8], Accessor::Agent).is_ok());
    }

    #[test]
    fn copy_moves_bytes_between_pools() {
        let m = memory();
        let sys = m.allocate(Region(1), 4).unwrap();
        let local = m.allocate(Region(2), 4).unwrap();
        m.write(sys, &[1, 2, 3, 4], Accessor::Host).unwrap();
        m.copy(local, sys, 4).unwrap();
        m.write(sys, &[0; 4], Accessor::Host).unwrap();
        m.copy(sys, local, 4).unwrap();
        let mut out = [0u8; 4];
        m.read(sys, &mut out, Accessor::Host).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let m = memory();
        let a = m.allocate(Region(1), 8).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(m.read(a, &mut out, Accessor::Host), Err(HsaStatus::InvalidAllocation));
        assert_eq!(
            m.read(DeviceAddress(0x10), &mut out[..1], Accessor::Host),
            Err(HsaStatus::InvalidAllocation)
        );
    }
}

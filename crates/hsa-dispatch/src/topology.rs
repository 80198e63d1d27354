//! Agent and region discovery.
//!
//! Picks the first GPU agent and the first CPU agent reported by the runtime
//! and sorts the GPU's global-segment regions into the three roles a dispatch
//! needs.

use crate::dispatch::Dispatch;
use crate::error::{DispatchError, Result, UsageError};
use crate::handle::{Agent, Region, RegionKind};
use crate::runtime::{DeviceType, RegionFlags, Runtime, Segment};
use tracing::{debug, info};

/// Handles resolved by [`discover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Topology {
    pub gpu: Agent,
    pub cpu: Agent,
    pub system_region: Region,
    pub kernarg_region: Region,
    /// Null when the GPU has no coarse-grained region.
    pub local_region: Region,
}

pub fn discover(runtime: &dyn Runtime) -> Result<Topology> {
    let mut topo = Topology::default();
    let agents = runtime
        .agents()
        .map_err(|s| DispatchError::runtime("hsa_iterate_agents failed", s))?;
    for agent in agents {
        let info = runtime
            .agent_info(agent)
            .map_err(|s| DispatchError::runtime("hsa_agent_get_info failed", s))?;
        match info.device_type {
            DeviceType::Gpu if topo.gpu.is_null() => {
                info!(agent = %info.name, "found GPU agent");
                topo.gpu = agent;
            }
            DeviceType::Cpu if topo.cpu.is_null() => topo.cpu = agent,
            _ => {}
        }
    }
    if topo.gpu.is_null() {
        return Err(UsageError::NoAgent.into());
    }

    let regions = runtime
        .agent_regions(topo.gpu)
        .map_err(|s| DispatchError::runtime("hsa_agent_iterate_regions failed", s))?;
    for region in regions {
        let info = runtime
            .region_info(region)
            .map_err(|s| DispatchError::runtime("hsa_region_get_info failed", s))?;
        if info.segment != Segment::Global {
            continue;
        }
        let slot = if info.flags.contains(RegionFlags::KERNARG) {
            &mut topo.kernarg_region
        } else if info.flags.contains(RegionFlags::FINE_GRAINED) {
            &mut topo.system_region
        } else if info.flags.contains(RegionFlags::COARSE_GRAINED) {
            &mut topo.local_region
        } else {
            continue;
        };
        if slot.is_null() {
            *slot = region;
        }
    }
    debug!(?topo, "topology discovered");

    if topo.kernarg_region.is_null() {
        return Err(UsageError::RegionUnbound(RegionKind::Kernarg).into());
    }
    Ok(topo)
}

/// Bind agents and regions of `topology` to `dispatch`.
pub fn bind_topology(dispatch: &mut Dispatch, topology: &Topology) -> Result<()> {
    dispatch.set_agent(topology.gpu)?;
    if !topology.cpu.is_null() {
        dispatch.set_cpu_agent(topology.cpu)?;
    }
    dispatch.set_system_region(topology.system_region);
    dispatch.set_kernarg_region(topology.kernarg_region);
    dispatch.set_local_region(topology.local_region);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRuntime;

    #[test]
    fn discovers_gpu_regions_by_flags() {
        let rt = SimRuntime::builder().build();
        let topo = discover(&rt).unwrap();
        assert_eq!(topo.gpu, rt.gpu_agent());
        assert_eq!(topo.cpu, rt.cpu_agent());
        assert_eq!(Some(topo.kernarg_region), rt.region_with(RegionFlags::KERNARG));
        assert_eq!(Some(topo.local_region), rt.region_with(RegionFlags::COARSE_GRAINED));
        assert_ne!(topo.system_region, topo.kernarg_region);
    }

    #[test]
    fn missing_local_region_stays_null() {
        let rt = SimRuntime::builder().local_region_size(None).build();
        assert!(discover(&rt).unwrap().local_region.is_null());
    }
}

//! In-process simulated HSA agent.
//!
//! [`SimRuntime`] exposes one GPU agent and one CPU agent. The GPU owns
//! three regions: fine-grained system memory, kernarg memory, and (optionally)
//! coarse-grained device-local memory that the host cannot touch directly.
//! Every queue gets a device-side packet processor thread that executes
//! kernels registered with [`SimRuntime::register_kernel`].
//!
//! ```
//! use hsa_dispatch::sim::SimRuntime;
//! use hsa_dispatch::Runtime;
//!
//! let rt = SimRuntime::builder().build();
//! rt.register_kernel("noop", |_ctx| Ok(()));
//! let blob = SimRuntime::code_object(&["noop"]);
//! assert!(rt.code_object_deserialize(&blob).is_ok());
//! ```

mod device;
pub mod kernel;
pub mod memory;

pub use kernel::{KernelContext, KernelFault, SimKernel, decode_code_object, encode_code_object};
pub use memory::{Accessor, SimMemory};

use crate::error::HsaResult;
use crate::handle::{Agent, CodeObject, DeviceAddress, Executable, KernelObject, Region};
use crate::queue::Queue;
use crate::runtime::{AgentInfo, DeviceType, RegionFlags, RegionInfo, Runtime, Segment};
use crate::signal::Signal;
use crate::status::HsaStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Sizes and limits of the simulated topology.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub agent_name: String,
    pub system_region_size: usize,
    pub kernarg_region_size: usize,
    /// `None` leaves the GPU without a device-local region.
    pub local_region_size: Option<usize>,
    pub queue_max_size: u32,
    pub workgroup_max_size: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            agent_name: "sim-gfx90a".to_string(),
            system_region_size: 64 << 20,
            kernarg_region_size: 1 << 20,
            local_region_size: Some(64 << 20),
            queue_max_size: 4096,
            workgroup_max_size: 1024,
        }
    }
}

/// Builder for [`SimRuntime`].
#[derive(Debug, Default)]
pub struct SimRuntimeBuilder {
    config: SimConfig,
}

impl SimRuntimeBuilder {
    pub fn agent_name(mut self, name: impl Into<String>) -> Self {
        self.config.agent_name = name.into();
        self
    }

    pub fn system_region_size(mut self, bytes: usize) -> Self {
        self.config.system_region_size = bytes;
        self
    }

    pub fn kernarg_region_size(mut self, bytes: usize) -> Self {
        self.config.kernarg_region_size = bytes;
        self
    }

    pub fn local_region_size(mut self, bytes: Option<usize>) -> Self {
        self.config.local_region_size = bytes;
        self
    }

    pub fn queue_max_size(mut self, packets: u32) -> Self {
        self.config.queue_max_size = packets;
        self
    }

    pub fn workgroup_max_size(mut self, items: u32) -> Self {
        self.config.workgroup_max_size = items;
        self
    }

    pub fn build(self) -> SimRuntime {
        SimRuntime::new(self.config)
    }
}

#[derive(Debug)]
struct SimAgent {
    info: AgentInfo,
    regions: Vec<Region>,
}

#[derive(Debug, Default)]
struct SimExecutable {
    frozen: bool,
    /// Symbol name -> agent it was loaded for.
    symbols: HashMap<String, Agent>,
}

/// State shared with packet processor threads.
pub(crate) struct SimShared {
    pub(crate) memory: SimMemory,
    kernels: RwLock<HashMap<KernelObject, SimKernel>>,
    signals: Mutex<HashMap<u64, Signal>>,
}

impl SimShared {
    pub(crate) fn kernel(&self, object: KernelObject) -> Option<SimKernel> {
        self.kernels.read().unwrap_or_else(|p| p.into_inner()).get(&object).cloned()
    }

    pub(crate) fn signal(&self, handle: u64) -> Option<Signal> {
        self.signals.lock().unwrap_or_else(|p| p.into_inner()).get(&handle).cloned()
    }
}

pub struct SimRuntime {
    shared: Arc<SimShared>,
    next_handle: AtomicU64,
    agents: HashMap<Agent, SimAgent>,
    regions: HashMap<Region, RegionInfo>,
    agent_order: Vec<Agent>,
    kernel_names: Mutex<HashMap<String, KernelObject>>,
    code_objects: Mutex<HashMap<CodeObject, Vec<String>>>,
    executables: Mutex<HashMap<Executable, SimExecutable>>,
    queues: Mutex<Vec<(Arc<Queue>, JoinHandle<()>)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl SimRuntime {
    pub fn builder() -> SimRuntimeBuilder {
        SimRuntimeBuilder::default()
    }

    pub fn new(config: SimConfig) -> Self {
        let shared = Arc::new(SimShared {
            memory: SimMemory::new(),
            kernels: RwLock::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
        });
        let mut rt = Self {
            shared,
            next_handle: AtomicU64::new(1),
            agents: HashMap::new(),
            regions: HashMap::new(),
            agent_order: Vec::new(),
            kernel_names: Mutex::new(HashMap::new()),
            code_objects: Mutex::new(HashMap::new()),
            executables: Mutex::new(HashMap::new()),
            queues: Mutex::new(Vec::new()),
        };

        let system = rt.add_region(
            RegionFlags::FINE_GRAINED,
            config.system_region_size,
            true,
        );
        let kernarg = rt.add_region(
            RegionFlags::KERNARG | RegionFlags::FINE_GRAINED,
            config.kernarg_region_size,
            true,
        );
        let mut gpu_regions = vec![system, kernarg];
        if let Some(size) = config.local_region_size {
            gpu_regions.push(rt.add_region(RegionFlags::COARSE_GRAINED, size, false));
        }

        rt.add_agent(
            AgentInfo {
                name: config.agent_name.clone(),
                device_type: DeviceType::Gpu,
                queue_max_size: config.queue_max_size,
                workgroup_max_size: config.workgroup_max_size,
            },
            gpu_regions,
        );
        rt.add_agent(
            AgentInfo {
                name: "sim-cpu".to_string(),
                device_type: DeviceType::Cpu,
                queue_max_size: 0,
                workgroup_max_size: 0,
            },
            vec![system, kernarg],
        );
        info!(agent = %config.agent_name, "simulated HSA runtime ready");
        rt
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn add_region(&mut self, flags: RegionFlags, size: usize, host_accessible: bool) -> Region {
        let region = Region(self.alloc_handle());
        // Each pool gets its own 1 TiB window of the address space.
        let base = region.0 << 40;
        self.shared.memory.add_pool(region, base, size, host_accessible);
        self.regions.insert(
            region,
            RegionInfo { segment: Segment::Global, flags, size, host_accessible },
        );
        region
    }

    fn add_agent(&mut self, info: AgentInfo, regions: Vec<Region>) {
        let agent = Agent(self.alloc_handle());
        self.agent_order.push(agent);
        self.agents.insert(agent, SimAgent { info, regions });
    }

    fn gpu(&self, agent: Agent) -> HsaResult<&SimAgent> {
        match self.agents.get(&agent) {
            Some(a) if a.info.device_type == DeviceType::Gpu => Ok(a),
            _ => Err(HsaStatus::InvalidAgent),
        }
    }

    /// First GPU agent.
    pub fn gpu_agent(&self) -> Agent {
        self.agent_order
            .iter()
            .copied()
            .find(|a| self.agents[a].info.device_type == DeviceType::Gpu)
            .unwrap_or_default()
    }

    /// First CPU agent.
    pub fn cpu_agent(&self) -> Agent {
        self.agent_order
            .iter()
            .copied()
            .find(|a| self.agents[a].info.device_type == DeviceType::Cpu)
            .unwrap_or_default()
    }

    /// GPU region carrying `flags`, if the topology has one.
    pub fn region_with(&self, flags: RegionFlags) -> Option<Region> {
        let gpu = self.agents.get(&self.gpu_agent())?;
        gpu.regions.iter().copied().find(|r| self.regions[r].flags.contains(flags))
    }

    /// Install a kernel; code objects naming `name` resolve to it.
    pub fn register_kernel<F>(&self, name: &str, kernel: F) -> KernelObject
    where
        F: Fn(&KernelContext<'_>) -> Result<(), KernelFault> + Send + Sync + 'static,
    {
        let mut names = lock(&self.kernel_names);
        let object = *names.entry(name.to_string()).or_insert_with(|| {
            // Kernel objects look like code addresses.
            KernelObject(0x7f00_0000_0000 | (self.alloc_handle() << 8))
        });
        self.shared
            .kernels
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(object, Arc::new(kernel));
        debug!(name, object = object.0, "registered sim kernel");
        object
    }

    /// A code object blob exporting `symbols`.
    pub fn code_object(symbols: &[&str]) -> Vec<u8> {
        encode_code_object(symbols)
    }

    /// Direct access to the simulated address space.
    pub fn memory(&self) -> &SimMemory {
        &self.shared.memory
    }
}

impl Runtime for SimRuntime {
    fn agents(&self) -> HsaResult<Vec<Agent>> {
        Ok(self.agent_order.clone())
    }

    fn agent_info(&self, agent: Agent) -> HsaResult<AgentInfo> {
        self.agents.get(&agent).map(|a| a.info.clone()).ok_or(HsaStatus::InvalidAgent)
    }

    fn agent_regions(&self, agent: Agent) -> HsaResult<Vec<Region>> {
        self.agents.get(&agent).map(|a| a.regions.clone()).ok_or(HsaStatus::InvalidAgent)
    }

    fn region_info(&self, region: Region) -> HsaResult<RegionInfo> {
        self.regions.get(&region).copied().ok_or(HsaStatus::InvalidRegion)
    }

    fn memory_allocate(&self, region: Region, size: usize) -> HsaResult<DeviceAddress> {
        self.shared.memory.allocate(region, size)
    }

    fn memory_copy(&self, dst: DeviceAddress, src: DeviceAddress, size: usize) -> HsaResult<()> {
        self.shared.memory.copy(dst, src, size)
    }

    fn memory_write(&self, dst: DeviceAddress, bytes: &[u8]) -> HsaResult<()> {
        self.shared.memory.write(dst, bytes, Accessor::Host)
    }

    fn memory_read(&self, src: DeviceAddress, out: &mut [u8]) -> HsaResult<()> {
        self.shared.memory.read(src, out, Accessor::Host)
    }

    fn queue_create(&self, agent: Agent, size: u32) -> HsaResult<Arc<Queue>> {
        let gpu = self.gpu(agent)?;
        if size > gpu.info.queue_max_size {
            return Err(HsaStatus::InvalidQueueCreation);
        }
        let doorbell = self.signal_create(-1)?;
        let queue = Arc::new(Queue::new(self.alloc_handle(), size, doorbell)?);

        let worker_queue = Arc::clone(&queue);
        let shared = Arc::clone(&self.shared);
        let max_wg = gpu.info.workgroup_max_size;
        let handle = std::thread::Builder::new()
            .name(format!("sim-queue-{}", queue.id()))
            .spawn(move || device::process_queue(worker_queue, shared, max_wg))
            .map_err(|_| HsaStatus::OutOfResources)?;
        debug!(queue = queue.id(), size, "created sim queue");
        lock(&self.queues).push((Arc::clone(&queue), handle));
        Ok(queue)
    }

    fn signal_create(&self, initial: i64) -> HsaResult<Signal> {
        let signal = Signal::new(self.alloc_handle(), initial);
        lock(&self.shared.signals).insert(signal.handle(), signal.clone());
        Ok(signal)
    }

    fn code_object_deserialize(&self, bytes: &[u8]) -> HsaResult<CodeObject> {
        let symbols = decode_code_object(bytes)?;
        let handle = CodeObject(self.alloc_handle());
        lock(&self.code_objects).insert(handle, symbols);
        Ok(handle)
    }

    fn executable_create(&self) -> HsaResult<Executable> {
        let handle = Executable(self.alloc_handle());
        lock(&self.executables).insert(handle, SimExecutable::default());
        Ok(handle)
    }

    fn executable_load_code_object(
        &self,
        executable: Executable,
        agent: Agent,
        code_object: CodeObject,
    ) -> HsaResult<()> {
        self.gpu(agent)?;
        let symbols =
            lock(&self.code_objects).get(&code_object).cloned().ok_or(HsaStatus::InvalidCodeObject)?;
        let mut executables = lock(&self.executables);
        let exe = executables.get_mut(&executable).ok_or(HsaStatus::InvalidExecutable)?;
        if exe.frozen {
            return Err(HsaStatus::FrozenExecutable);
        }
        exe.symbols.extend(symbols.into_iter().map(|s| (s, agent)));
        Ok(())
    }

    fn executable_freeze(&self, executable: Executable) -> HsaResult<()> {
        let mut executables = lock(&self.executables);
        let exe = executables.get_mut(&executable).ok_or(HsaStatus::InvalidExecutable)?;
        if exe.frozen {
            return Err(HsaStatus::FrozenExecutable);
        }
        exe.frozen = true;
        Ok(())
    }

    fn executable_symbol(
        &self,
        executable: Executable,
        name: &str,
        agent: Agent,
    ) -> HsaResult<KernelObject> {
        let executables = lock(&self.executables);
        let exe = executables.get(&executable).ok_or(HsaStatus::InvalidExecutable)?;
        if !exe.frozen {
            return Err(HsaStatus::InvalidExecutable);
        }
        if exe.symbols.get(name) != Some(&agent) {
            return Err(HsaStatus::InvalidSymbolName);
        }
        lock(&self.kernel_names).get(name).copied().ok_or(HsaStatus::InvalidSymbolName)
    }
}

impl Drop for SimRuntime {
    fn drop(&mut self) {
        let queues = std::mem::take(&mut *lock(&self.queues));
        for (queue, _) in &queues {
            queue.deactivate();
        }
        for (queue, handle) in queues {
            if handle.join().is_err() {
                tracing::error!(queue = queue.id(), "sim packet processor panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_topology_has_gpu_and_cpu() {
        let rt = SimRuntime::builder().build();
        let agents = rt.agents().unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(rt.agent_info(rt.gpu_agent()).unwrap().device_type, DeviceType::Gpu);
        assert_eq!(rt.agent_info(rt.cpu_agent()).unwrap().device_type, DeviceType::Cpu);
        assert!(rt.region_with(RegionFlags::KERNARG).is_some());
        assert!(rt.region_with(RegionFlags::COARSE_GRAINED).is_some());
    }

    #[test]
    fn topology_without_local_region() {
        let rt = SimRuntime::builder().local_region_size(None).build();
        assert!(rt.region_with(RegionFlags::COARSE_GRAINED).is_none());
    }

    #[test]
    fn cpu_agent_cannot_own_a_kernel_queue() {
        let rt = SimRuntime::builder().build();
        assert_eq!(rt.queue_create(rt.cpu_agent(), 16).unwrap_err(), HsaStatus::InvalidAgent);
        assert_eq!(
            rt.queue_create(rt.gpu_agent(), 8192).unwrap_err(),
            HsaStatus::InvalidQueueCreation
        );
    }

    #[test]
    fn symbol_resolution_requires_frozen_executable_and_registered_kernel() {
        let rt = SimRuntime::builder().build();
        let gpu = rt.gpu_agent();
        let object = rt.register_kernel("hello_world", |_| Ok(()));
        let co = rt.code_object_deserialize(&SimRuntime::code_object(&["hello_world", "ghost"])).unwrap();
        let exe = rt.executable_create().unwrap();
        rt.executable_load_code_object(exe, gpu, co).unwrap();
        assert_eq!(rt.executable_symbol(exe, "hello_world", gpu), Err(HsaStatus::InvalidExecutable));
        rt.executable_freeze(exe).unwrap();
        assert_eq!(rt.executable_load_code_object(exe, gpu, co), Err(HsaStatus::FrozenExecutable));
        assert_eq!(rt.executable_symbol(exe, "hello_world", gpu), Ok(object));
        assert_eq!(rt.executable_symbol(exe, "ghost", gpu), Err(HsaStatus::InvalidSymbolName));
        assert_eq!(rt.executable_symbol(exe, "missing", gpu), Err(HsaStatus::InvalidSymbolName));
    }

    #[test]
    fn registering_the_same_name_keeps_the_kernel_object() {
        let rt = SimRuntime::builder().build();
        let a = rt.register_kernel("k", |_| Ok(()));
        let b = rt.register_kernel("k", |_| Err(KernelFault::new("replaced")));
        assert_eq!(a, b);
    }
}

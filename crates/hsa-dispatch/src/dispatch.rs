//! Single-kernel dispatch orchestrator.
//!
//! A [`Dispatch`] owns everything needed to launch one kernel on one agent:
//! bound agent and regions, the queue, the kernarg buffer, the completion
//! signal and the packet. [`Dispatch::run`] walks the lifecycle
//!
//! ```text
//! Setup -> Init -> InitDispatch -> RunDispatch -> Wait -> Verify
//! ```
//!
//! and stops at the first stage that fails. Workload-specific behaviour
//! (buffers, kernel arguments, result checks, code loading) plugs in through
//! the [`Workload`] trait.

use crate::buffer::Buffer;
use crate::config::DispatchConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{DispatchError, Result, UsageError};
use crate::handle::{Agent, CodeObject, DeviceAddress, Executable, KernelObject, Region, RegionKind};
use crate::kernarg::KernargWriter;
use crate::packet::{DispatchPacket, PacketHeader, dimensions_of};
use crate::queue::Queue;
use crate::runtime::{AgentInfo, Runtime};
use crate::signal::{Signal, SignalCondition};
use crate::status::HsaStatus;
use bytemuck::Pod;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Lifecycle stage of [`Dispatch::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Setup,
    Init,
    InitDispatch,
    RunDispatch,
    Wait,
    Verify,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Setup,
        Stage::Init,
        Stage::InitDispatch,
        Stage::RunDispatch,
        Stage::Wait,
        Stage::Verify,
    ];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Setup => "Setup",
            Self::Init => "Init",
            Self::InitDispatch => "InitDispatch",
            Self::RunDispatch => "RunDispatch",
            Self::Wait => "Wait",
            Self::Verify => "Verify",
        };
        f.write_str(name)
    }
}

/// Workload hooks invoked by [`Dispatch::run`].
///
/// Every method has a default, so `()` is the empty workload.
pub trait Workload {
    /// Allocate buffers and pack kernel arguments.
    fn setup(&mut self, _dispatch: &mut Dispatch) -> Result<()> {
        Ok(())
    }

    /// Produce the code object holding the kernel.
    fn setup_code_object(&mut self, dispatch: &mut Dispatch) -> Result<CodeObject> {
        dispatch.load_code_object()
    }

    /// Link `code_object` and resolve the kernel entry point.
    fn setup_executable(
        &mut self,
        dispatch: &mut Dispatch,
        code_object: CodeObject,
    ) -> Result<KernelObject> {
        dispatch.link_executable(code_object)
    }

    /// Check results once the kernel has completed.
    fn verify(&mut self, _dispatch: &mut Dispatch) -> Result<()> {
        Ok(())
    }

    /// Called on entry to each stage.
    fn on_stage(&mut self, _stage: Stage) {}
}

impl Workload for () {}

pub struct Dispatch {
    runtime: Arc<dyn Runtime>,
    config: DispatchConfig,
    diagnostics: Diagnostics,

    agent: Agent,
    cpu_agent: Agent,
    agent_info: Option<AgentInfo>,
    system_region: Region,
    kernarg_region: Region,
    local_region: Region,

    queue: Option<Arc<Queue>>,
    code_object_bytes: Option<Arc<[u8]>>,
    executable: Executable,
    kernel_object: KernelObject,
    signal: Option<Signal>,

    kernarg: Option<KernargWriter>,
    workgroup_size: [u16; 3],
    grid_size: [u32; 3],
    packet: DispatchPacket,
    packet_index: Option<u64>,
    /// InitDispatch wrote a body that RunDispatch has not published yet.
    body_written: bool,
    /// A published packet has not been seen to complete.
    in_flight: bool,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("agent", &self.agent)
            .field("queue", &self.queue.as_ref().map(|q| q.id()))
            .field("kernel_object", &self.kernel_object)
            .field("kernarg", &self.kernarg)
            .field("workgroup_size", &self.workgroup_size)
            .field("grid_size", &self.grid_size)
            .field("packet_index", &self.packet_index)
            .finish_non_exhaustive()
    }
}

impl Dispatch {
    pub fn new(runtime: Arc<dyn Runtime>, config: DispatchConfig) -> Self {
        Self {
            runtime,
            config,
            diagnostics: Diagnostics::new(),
            agent: Agent::NULL,
            cpu_agent: Agent::NULL,
            agent_info: None,
            system_region: Region::NULL,
            kernarg_region: Region::NULL,
            local_region: Region::NULL,
            queue: None,
            code_object_bytes: None,
            executable: Executable::NULL,
            kernel_object: KernelObject::NULL,
            signal: None,
            kernarg: None,
            workgroup_size: [1, 1, 1],
            grid_size: [1, 1, 1],
            packet: DispatchPacket::default(),
            packet_index: None,
            body_written: false,
            in_flight: false,
        }
    }

    fn fail(&mut self, err: impl Into<DispatchError>) -> DispatchError {
        self.diagnostics.record(err.into())
    }

    fn runtime_fail(&mut self, context: &str, status: HsaStatus) -> DispatchError {
        self.fail(DispatchError::runtime(context, status))
    }

    // ---- accessors ----

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// The diagnostic buffer as one string.
    pub fn output(&self) -> String {
        self.diagnostics.output()
    }

    pub fn agent(&self) -> Agent {
        self.agent
    }

    pub fn cpu_agent(&self) -> Agent {
        self.cpu_agent
    }

    pub fn agent_info(&self) -> Option<&AgentInfo> {
        self.agent_info.as_ref()
    }

    pub fn queue(&self) -> Option<&Arc<Queue>> {
        self.queue.as_ref()
    }

    pub fn completion_signal(&self) -> Option<&Signal> {
        self.signal.as_ref()
    }

    pub fn kernel_object(&self) -> KernelObject {
        self.kernel_object
    }

    /// Packet index of the most recent submission.
    pub fn packet_index(&self) -> Option<u64> {
        self.packet_index
    }

    /// The packet as last written by InitDispatch.
    pub fn packet(&self) -> &DispatchPacket {
        &self.packet
    }

    // ---- binding ----

    pub fn has_agent(&self) -> bool {
        !self.agent.is_null()
    }

    /// Bind the agent kernels run on. Fails if one is already bound.
    pub fn set_agent(&mut self, agent: Agent) -> Result<()> {
        if self.has_agent() {
            return Err(self.fail(UsageError::AgentAlreadyBound));
        }
        if agent.is_null() {
            return Err(self.fail(UsageError::NullHandle("agent")));
        }
        self.agent = agent;
        Ok(())
    }

    /// Bind the host CPU agent. Fails if one is already bound.
    pub fn set_cpu_agent(&mut self, agent: Agent) -> Result<()> {
        if !self.cpu_agent.is_null() {
            return Err(self.fail(UsageError::CpuAgentAlreadyBound));
        }
        if agent.is_null() {
            return Err(self.fail(UsageError::NullHandle("cpu agent")));
        }
        self.cpu_agent = agent;
        Ok(())
    }

    pub fn set_system_region(&mut self, region: Region) {
        self.system_region = region;
    }

    pub fn set_kernarg_region(&mut self, region: Region) {
        self.kernarg_region = region;
    }

    pub fn set_local_region(&mut self, region: Region) {
        self.local_region = region;
    }

    pub fn region(&self, kind: RegionKind) -> Region {
        match kind {
            RegionKind::System => self.system_region,
            RegionKind::Kernarg => self.kernarg_region,
            RegionKind::Local => self.local_region,
        }
    }

    /// Submit to an existing queue instead of creating one in Init.
    pub fn attach_queue(&mut self, queue: Arc<Queue>) {
        self.queue = Some(queue);
    }

    /// Kernel binary consumed by the default code object loader.
    pub fn set_code_object_bytes(&mut self, bytes: impl Into<Arc<[u8]>>) {
        self.code_object_bytes = Some(bytes.into());
    }

    // ---- launch shape ----

    pub fn set_workgroup_size(&mut self, x: u16, y: u16, z: u16) {
        self.workgroup_size = [x, y, z];
    }

    pub fn set_workgroup_size_1d(&mut self, x: u16) {
        self.set_workgroup_size(x, 1, 1);
    }

    pub fn set_grid_size(&mut self, x: u32, y: u32, z: u32) {
        self.grid_size = [x, y, z];
    }

    pub fn set_grid_size_1d(&mut self, x: u32) {
        self.set_grid_size(x, 1, 1);
    }

    pub fn workgroup_size(&self) -> [u16; 3] {
        self.workgroup_size
    }

    pub fn grid_size(&self) -> [u32; 3] {
        self.grid_size
    }

    // ---- kernel arguments ----

    /// Reserve `size` bytes of kernarg memory. At most once per dispatch.
    pub fn allocate_kernarg(&mut self, size: usize) -> Result<()> {
        if self.kernarg_region.is_null() {
            return Err(self.fail(UsageError::RegionUnbound(RegionKind::Kernarg)));
        }
        if self.kernarg.is_some() {
            return Err(self.fail(UsageError::KernargAlreadyAllocated));
        }
        let base = self
            .runtime
            .memory_allocate(self.kernarg_region, size)
            .map_err(|s| self.runtime_fail("hsa_memory_allocate(kernarg) failed", s))?;
        debug!(%base, size, "allocated kernarg buffer");
        self.kernarg = Some(KernargWriter::new(base, size));
        Ok(())
    }

    /// Append `bytes` at the next offset aligned to `align`.
    pub fn kernarg_raw(&mut self, bytes: &[u8], align: usize) -> Result<()> {
        let Some(mut writer) = self.kernarg.clone() else {
            return Err(self.fail(UsageError::KernargNotAllocated));
        };
        let start = writer.place(bytes.len(), align).map_err(|e| self.fail(e))?;
        self.runtime
            .memory_write(writer.address_of(start), bytes)
            .map_err(|s| self.runtime_fail("kernarg write failed", s))?;
        trace!(offset = start, len = bytes.len(), align, "kernarg");
        self.kernarg = Some(writer);
        Ok(())
    }

    /// Append a scalar argument aligned to its own size.
    pub fn kernarg<T: Pod>(&mut self, value: &T) -> Result<()> {
        self.kernarg_raw(bytemuck::bytes_of(value), std::mem::size_of::<T>())
    }

    /// Append the agent-visible address of `buffer`.
    pub fn kernarg_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        self.kernarg(&buffer.local_ptr())
    }

    /// Bytes of kernarg memory consumed so far.
    pub fn kernarg_offset(&self) -> usize {
        self.kernarg.as_ref().map_or(0, KernargWriter::offset)
    }

    /// Base of the kernarg buffer, null until allocated.
    pub fn kernarg_address(&self) -> DeviceAddress {
        self.kernarg.as_ref().map_or(DeviceAddress::NULL, KernargWriter::base)
    }

    // ---- memory ----

    fn allocate_in(&mut self, kind: RegionKind, size: usize) -> Option<DeviceAddress> {
        let region = self.region(kind);
        if region.is_null() {
            self.fail(UsageError::RegionUnbound(kind));
            return None;
        }
        match self.runtime.memory_allocate(region, size) {
            Ok(address) => {
                trace!(%kind, %address, size, "allocated");
                Some(address)
            }
            Err(status) => {
                self.runtime_fail(&format!("hsa_memory_allocate({kind}) failed"), status);
                None
            }
        }
    }

    pub fn allocate_local_memory(&mut self, size: usize) -> Option<DeviceAddress> {
        self.allocate_in(RegionKind::Local, size)
    }

    pub fn allocate_system_memory(&mut self, size: usize) -> Option<DeviceAddress> {
        self.allocate_in(RegionKind::System, size)
    }

    pub fn copy_to_local(&mut self, dst: DeviceAddress, src: DeviceAddress, size: usize) -> Result<()> {
        self.runtime
            .memory_copy(dst, src, size)
            .map_err(|s| self.runtime_fail("hsa_memory_copy(system->local) failed", s))
    }

    pub fn copy_from_local(
        &mut self,
        dst: DeviceAddress,
        src: DeviceAddress,
        size: usize,
    ) -> Result<()> {
        self.runtime
            .memory_copy(dst, src, size)
            .map_err(|s| self.runtime_fail("hsa_memory_copy(local->system) failed", s))
    }

    /// System memory plus, when a local region is bound, a local mirror.
    pub fn allocate_buffer(&mut self, size: usize) -> Option<Buffer> {
        let system = self.allocate_system_memory(size)?;
        if self.local_region.is_null() {
            return Some(Buffer::shared(size, system));
        }
        let local = self.allocate_local_memory(size)?;
        Some(Buffer::dual(size, local, system))
    }

    /// Push the host copy of `buffer` to its local mirror, if it has one.
    pub fn copy_to(&mut self, buffer: &Buffer) -> Result<()> {
        if buffer.is_local() {
            self.copy_to_local(buffer.local_ptr(), buffer.system_ptr(), buffer.size())?;
        }
        Ok(())
    }

    /// Pull the local mirror of `buffer` back to host memory, if it has one.
    pub fn copy_from(&mut self, buffer: &Buffer) -> Result<()> {
        if buffer.is_local() {
            self.copy_from_local(buffer.system_ptr(), buffer.local_ptr(), buffer.size())?;
        }
        Ok(())
    }

    pub fn write_system(&mut self, address: DeviceAddress, bytes: &[u8]) -> Result<()> {
        self.runtime
            .memory_write(address, bytes)
            .map_err(|s| self.runtime_fail("host write failed", s))
    }

    pub fn read_system(&mut self, address: DeviceAddress, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.runtime
            .memory_read(address, &mut out)
            .map_err(|s| self.runtime_fail("host read failed", s))?;
        Ok(out)
    }

    pub fn write_pod<T: Pod>(&mut self, address: DeviceAddress, values: &[T]) -> Result<()> {
        self.write_system(address, bytemuck::cast_slice(values))
    }

    pub fn read_pod<T: Pod>(&mut self, address: DeviceAddress, count: usize) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        self.runtime
            .memory_read(address, bytemuck::cast_slice_mut(&mut out))
            .map_err(|s| self.runtime_fail("host read failed", s))?;
        Ok(out)
    }

    // ---- code loading ----

    /// Deserialize the blob given to [`Dispatch::set_code_object_bytes`].
    pub fn load_code_object(&mut self) -> Result<CodeObject> {
        let Some(bytes) = self.code_object_bytes.clone() else {
            return Err(self.fail(UsageError::NoCodeObject));
        };
        let code_object = self
            .runtime
            .code_object_deserialize(&bytes)
            .map_err(|s| self.runtime_fail("hsa_code_object_deserialize failed", s))?;
        debug!(code_object = code_object.handle(), len = bytes.len(), "code object loaded");
        Ok(code_object)
    }

    /// Build and freeze an executable for the bound agent and resolve the
    /// configured kernel symbol.
    pub fn link_executable(&mut self, code_object: CodeObject) -> Result<KernelObject> {
        if code_object.is_null() {
            return Err(self.fail(UsageError::NoCodeObject));
        }
        if !self.has_agent() {
            return Err(self.fail(UsageError::NoAgent));
        }
        let rt = Arc::clone(&self.runtime);
        let executable =
            rt.executable_create().map_err(|s| self.runtime_fail("hsa_executable_create failed", s))?;
        rt.executable_load_code_object(executable, self.agent, code_object)
            .map_err(|s| self.runtime_fail("hsa_executable_load_code_object failed", s))?;
        rt.executable_freeze(executable)
            .map_err(|s| self.runtime_fail("hsa_executable_freeze failed", s))?;
        self.executable = executable;

        let name = self.config.kernel_name.clone();
        let kernel = rt.executable_symbol(executable, &name, self.agent).map_err(|s| {
            self.runtime_fail(&format!("hsa_executable_get_symbol({name}) failed"), s)
        })?;
        debug!(kernel = %name, object = kernel.handle(), "kernel resolved");
        Ok(kernel)
    }

    pub fn executable(&self) -> Executable {
        self.executable
    }

    // ---- lifecycle ----

    /// Run every stage in order, stopping at the first failure.
    pub fn run<W: Workload + ?Sized>(&mut self, workload: &mut W) -> Result<()> {
        let result = self.run_stages(workload);
        match &result {
            Ok(()) => {
                info!("Success");
                self.diagnostics.note("Success");
            }
            Err(err) => {
                info!(error = %err, "Failed");
                self.diagnostics.note("Failed");
            }
        }
        result
    }

    fn run_stages<W: Workload + ?Sized>(&mut self, workload: &mut W) -> Result<()> {
        self.enter(workload, Stage::Setup);
        let recorded = self.diagnostics.lines().len();
        let setup = workload.setup(self);
        self.hook_result(recorded, setup)?;

        self.enter(workload, Stage::Init);
        self.init(workload)?;

        self.enter(workload, Stage::InitDispatch);
        self.init_dispatch()?;

        self.enter(workload, Stage::RunDispatch);
        self.run_dispatch()?;

        self.enter(workload, Stage::Wait);
        self.wait()?;

        self.enter(workload, Stage::Verify);
        let recorded = self.diagnostics.lines().len();
        let verify = workload.verify(self);
        self.hook_result(recorded, verify)
    }

    fn enter<W: Workload + ?Sized>(&mut self, workload: &mut W, stage: Stage) {
        debug!(%stage, "entering stage");
        workload.on_stage(stage);
    }

    /// Record a hook failure unless the hook already left a diagnostic.
    fn hook_result(&mut self, recorded: usize, result: Result<()>) -> Result<()> {
        result.map_err(|err| self.hook_error(recorded, err))
    }

    /// Resolve agent info, queue, kernel object and completion signal.
    ///
    /// Anything already resolved by a previous run is reused.
    pub fn init<W: Workload + ?Sized>(&mut self, workload: &mut W) -> Result<()> {
        if !self.has_agent() {
            return Err(self.fail(UsageError::NoAgent));
        }

        let info = match self.agent_info.clone() {
            Some(info) => info,
            None => {
                let info = self
                    .runtime
                    .agent_info(self.agent)
                    .map_err(|s| self.runtime_fail("hsa_agent_get_info failed", s))?;
                info!(agent = %info.name, "Using agent: {}", info.name);
                self.diagnostics.note(format!("Using agent: {}", info.name));
                self.agent_info = Some(info.clone());
                info
            }
        };

        if self.queue.is_none() {
            let size = self.config.queue_size.unwrap_or(info.queue_max_size);
            if size == 0 || !size.is_power_of_two() {
                return Err(self.fail(UsageError::InvalidQueueSize(size)));
            }
            let queue = self
                .runtime
                .queue_create(self.agent, size)
                .map_err(|s| self.runtime_fail("hsa_queue_create failed", s))?;
            debug!(queue = queue.id(), size, "queue created");
            self.queue = Some(queue);
        }

        if self.kernel_object.is_null() {
            let recorded = self.diagnostics.lines().len();
            let code_object = match workload.setup_code_object(self) {
                Ok(co) => co,
                Err(err) => return Err(self.hook_error(recorded, err)),
            };
            let recorded = self.diagnostics.lines().len();
            let kernel = match workload.setup_executable(self, code_object) {
                Ok(kernel) => kernel,
                Err(err) => return Err(self.hook_error(recorded, err)),
            };
            if kernel.is_null() {
                return Err(self.fail(UsageError::NoExecutable));
            }
            self.kernel_object = kernel;
        }

        if self.signal.is_none() {
            let signal = self
                .runtime
                .signal_create(1)
                .map_err(|s| self.runtime_fail("hsa_signal_create failed", s))?;
            self.signal = Some(signal);
        }
        Ok(())
    }

    fn hook_error(&mut self, recorded: usize, err: DispatchError) -> DispatchError {
        if self.diagnostics.lines().len() == recorded { self.fail(err) } else { err }
    }

    fn submission(&mut self) -> Result<(Arc<Queue>, Signal)> {
        match (self.queue.clone(), self.signal.clone()) {
            (Some(queue), Some(signal)) => Ok((queue, signal)),
            _ => Err(self.fail(UsageError::NotInitialized)),
        }
    }

    /// Reserve a packet slot and write the packet body.
    pub fn init_dispatch(&mut self) -> Result<()> {
        let (queue, mut signal) = self.submission()?;
        if self.in_flight {
            // The last packet was abandoned by a timed-out wait and will still
            // decrement its signal; give this packet its own.
            signal = self
                .runtime
                .signal_create(1)
                .map_err(|s| self.runtime_fail("hsa_signal_create failed", s))?;
            debug!(signal = signal.handle(), "replaced in-flight completion signal");
            self.signal = Some(signal.clone());
            self.in_flight = false;
        }
        signal.store_relaxed(1);

        let Some(index) = queue.reserve(self.config.wait_timeout()) else {
            return Err(self.runtime_fail(
                &format!("queue {} has no free slot", queue.id()),
                HsaStatus::OutOfResources,
            ));
        };

        self.packet = DispatchPacket {
            header: PacketHeader::kernel_dispatch(self.config.barrier, self.config.fence_scope),
            dimensions: dimensions_of(self.workgroup_size, self.grid_size),
            workgroup_size: self.workgroup_size,
            grid_size: self.grid_size,
            private_segment_size: 0,
            group_segment_size: 0,
            kernel_object: self.kernel_object,
            kernarg_address: self.kernarg_address(),
            completion_signal: signal.handle(),
        };
        self.packet.write_body(queue.slot(index));
        self.packet_index = Some(index);
        self.body_written = true;
        debug!(queue = queue.id(), index, slot = queue.slot_index(index), "packet body written");
        Ok(())
    }

    /// Publish the header and ring the doorbell.
    pub fn run_dispatch(&mut self) -> Result<()> {
        let (queue, _) = self.submission()?;
        let Some(index) = self.packet_index.filter(|_| self.body_written) else {
            return Err(self.fail(UsageError::NoPacket));
        };
        self.packet.publish(queue.slot(index));
        queue.ring_doorbell(index);
        self.body_written = false;
        self.in_flight = true;
        debug!(queue = queue.id(), index, "doorbell rung");
        Ok(())
    }

    /// Block until the completion signal reaches 0.
    pub fn wait(&mut self) -> Result<()> {
        let (queue, signal) = self.submission()?;
        let timeout = self.config.wait_timeout();
        let start = Instant::now();
        let value = signal.wait_acquire(SignalCondition::Eq, 0, timeout);
        if value != 0 {
            return Err(self.fail(DispatchError::WaitTimeout { elapsed: start.elapsed(), value }));
        }
        self.in_flight = false;
        if let Some(fault) = self.packet_index.and_then(|index| queue.take_fault(index)) {
            let context = format!("kernel dispatch failed: {}", fault.message);
            return Err(self.runtime_fail(&context, fault.status));
        }
        debug!(elapsed = ?start.elapsed(), "dispatch completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRuntime;

    fn dispatch() -> (Arc<SimRuntime>, Dispatch) {
        let rt = Arc::new(SimRuntime::builder().kernarg_region_size(256).build());
        let d = Dispatch::new(rt.clone(), DispatchConfig::default());
        (rt, d)
    }

    #[test]
    fn stage_order_is_the_lifecycle() {
        let names: Vec<_> = Stage::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["Setup", "Init", "InitDispatch", "RunDispatch", "Wait", "Verify"]);
    }

    #[test]
    fn set_agent_twice_keeps_first_binding() {
        let (rt, mut d) = dispatch();
        d.set_agent(rt.gpu_agent()).unwrap();
        let err = d.set_agent(rt.cpu_agent()).unwrap_err();
        assert_eq!(err, DispatchError::Usage(UsageError::AgentAlreadyBound));
        assert_eq!(d.agent(), rt.gpu_agent());
        assert_eq!(d.diagnostics().lines().len(), 1);
    }

    #[test]
    fn null_agent_is_rejected() {
        let (_rt, mut d) = dispatch();
        assert!(d.set_agent(Agent::NULL).unwrap_err().is_usage());
        assert!(!d.has_agent());
    }

    #[test]
    fn kernarg_without_region_keeps_cursor_at_zero() {
        let (_rt, mut d) = dispatch();
        let err = d.allocate_kernarg(16).unwrap_err();
        assert_eq!(err, DispatchError::Usage(UsageError::RegionUnbound(RegionKind::Kernarg)));
        assert_eq!(d.kernarg_offset(), 0);
        assert_eq!(
            d.kernarg(&1u32).unwrap_err(),
            DispatchError::Usage(UsageError::KernargNotAllocated)
        );
        assert_eq!(d.output(), "no kernarg memory region bound\nkernarg buffer not allocated");
    }

    #[test]
    fn kernarg_allocated_once_and_packed_in_order() {
        let (rt, mut d) = dispatch();
        d.set_kernarg_region(rt.region_with(crate::runtime::RegionFlags::KERNARG).unwrap());
        d.allocate_kernarg(16).unwrap();
        assert_eq!(
            d.allocate_kernarg(16).unwrap_err(),
            DispatchError::Usage(UsageError::KernargAlreadyAllocated)
        );
        d.kernarg(&7u8).unwrap();
        d.kernarg(&0xdead_beefu32).unwrap();
        assert_eq!(d.kernarg_offset(), 8);
        d.kernarg(&1u64).unwrap();
        assert_eq!(d.kernarg_offset(), 16);
        let err = d.kernarg(&1u8).unwrap_err();
        assert!(matches!(err, DispatchError::Usage(UsageError::KernargOverflow { .. })));
        assert_eq!(d.kernarg_offset(), 16);
        assert_eq!(d.read_pod::<u32>(d.kernarg_address().offset(4), 1).unwrap(), [0xdead_beef]);
    }

    #[test]
    fn buffer_without_local_region_is_shared() {
        let (rt, mut d) = dispatch();
        d.set_system_region(rt.region_with(crate::runtime::RegionFlags::FINE_GRAINED).unwrap());
        let buf = d.allocate_buffer(32).unwrap();
        assert!(!buf.is_local());
        assert!(d.copy_to(&buf).is_ok());
        assert!(d.copy_from(&buf).is_ok());
    }

    #[test]
    fn allocation_from_unbound_region_is_none() {
        let (_rt, mut d) = dispatch();
        assert_eq!(d.allocate_local_memory(8), None);
        assert_eq!(d.output(), "no local memory region bound");
    }

    #[test]
    fn exhausted_pool_allocation_is_none() {
        let (rt, mut d) = dispatch();
        d.set_local_region(rt.region_with(crate::runtime::RegionFlags::COARSE_GRAINED).unwrap());
        assert!(d.allocate_local_memory(64).is_some());
        assert_eq!(d.allocate_local_memory(usize::MAX), None);
        assert!(d.output().starts_with("hsa_memory_allocate(local) failed: HSA_STATUS_ERROR_OUT_OF_RESOURCES"));
    }

    #[test]
    fn stages_out_of_order_are_usage_errors() {
        let (rt, mut d) = dispatch();
        rt.register_kernel("hello_world", |_| Ok(()));
        assert_eq!(d.init_dispatch(), Err(DispatchError::Usage(UsageError::NotInitialized)));
        assert_eq!(d.wait(), Err(DispatchError::Usage(UsageError::NotInitialized)));

        d.set_agent(rt.gpu_agent()).unwrap();
        d.set_code_object_bytes(SimRuntime::code_object(&["hello_world"]));
        d.init(&mut ()).unwrap();
        assert_eq!(d.run_dispatch(), Err(DispatchError::Usage(UsageError::NoPacket)));

        d.init_dispatch().unwrap();
        d.run_dispatch().unwrap();
        assert_eq!(d.run_dispatch(), Err(DispatchError::Usage(UsageError::NoPacket)));
        d.wait().unwrap();
        assert_eq!(d.completion_signal().unwrap().load_acquire(), 0);
    }

    #[test]
    fn run_without_agent_fails_in_init() {
        let (_rt, mut d) = dispatch();
        let err = d.run(&mut ()).unwrap_err();
        assert_eq!(err, DispatchError::Usage(UsageError::NoAgent));
        assert_eq!(d.diagnostics().lines().last().map(String::as_str), Some("Failed"));
    }
}

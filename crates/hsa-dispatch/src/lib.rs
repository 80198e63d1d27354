//! `hsa-dispatch`: single-kernel AQL dispatch harness for HSA-style agents.
//!
//! The crate prepares memory, packs kernel arguments, builds one kernel
//! dispatch packet, submits it through a user-mode ring queue and blocks on
//! the completion signal.
//!
//! | Module        | Role                                                  |
//! |---------------|-------------------------------------------------------|
//! | `packet`      | 64-byte dispatch packet and header encoding           |
//! | `queue`       | Ring queue, write/read indices, doorbell              |
//! | `kernarg`     | Alignment-respecting kernarg cursor                   |
//! | `dispatch`    | Lifecycle orchestrator and [`Workload`] hooks         |
//! | `topology`    | Agent and region discovery                            |
//! | `runtime`     | [`Runtime`] trait the device side implements          |
//! | `sim`         | In-process simulated agent                            |
//! | `config`      | TOML + `HSA_DISPATCH_*` environment configuration     |
//!
//! # Usage
//!
//! ```rust
//! use hsa_dispatch::sim::SimRuntime;
//! use hsa_dispatch::{Dispatch, DispatchConfig, discover, bind_topology};
//! use std::sync::Arc;
//!
//! let rt = Arc::new(SimRuntime::builder().build());
//! rt.register_kernel("hello_world", |_ctx| Ok(()));
//!
//! let mut dispatch = Dispatch::new(rt.clone(), DispatchConfig::default());
//! bind_topology(&mut dispatch, &discover(rt.as_ref()).unwrap()).unwrap();
//! dispatch.set_code_object_bytes(SimRuntime::code_object(&["hello_world"]));
//! dispatch.set_grid_size_1d(64);
//! dispatch.run(&mut ()).unwrap();
//! assert_eq!(dispatch.completion_signal().unwrap().load_acquire(), 0);
//! ```

pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod kernarg;
pub mod packet;
pub mod queue;
pub mod runtime;
pub mod signal;
pub mod sim;
pub mod status;
pub mod topology;

pub use buffer::Buffer;
pub use config::{ConfigError, DispatchConfig};
pub use diagnostics::Diagnostics;
pub use dispatch::{Dispatch, Stage, Workload};
pub use error::{DispatchError, HsaResult, Result, UsageError};
pub use handle::{Agent, CodeObject, DeviceAddress, Executable, KernelObject, Region, RegionKind};
pub use packet::{DispatchPacket, FenceScope, PacketHeader, PacketType};
pub use queue::Queue;
pub use runtime::{AgentInfo, DeviceType, RegionFlags, RegionInfo, Runtime, Segment};
pub use signal::{Signal, SignalCondition};
pub use status::HsaStatus;
pub use topology::{Topology, bind_topology, discover};

//! Dispatch error types.

use crate::handle::RegionKind;
use crate::status::HsaStatus;
use std::time::Duration;
use thiserror::Error;

/// A local precondition was violated by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("agent is already bound to this dispatch")]
    AgentAlreadyBound,

    #[error("CPU agent is already bound to this dispatch")]
    CpuAgentAlreadyBound,

    #[error("null {0} handle")]
    NullHandle(&'static str),

    #[error("no agent bound")]
    NoAgent,

    #[error("no {0} memory region bound")]
    RegionUnbound(RegionKind),

    #[error("kernarg buffer already allocated")]
    KernargAlreadyAllocated,

    #[error("kernarg buffer not allocated")]
    KernargNotAllocated,

    #[error("kernarg overflow: {size} bytes at offset {offset} exceed capacity {capacity}")]
    KernargOverflow { offset: usize, size: usize, capacity: usize },

    #[error("kernarg alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("queue size {0} is not a non-zero power of two")]
    InvalidQueueSize(u32),

    #[error("no code object loaded")]
    NoCodeObject,

    #[error("no executable linked")]
    NoExecutable,

    #[error("dispatch not initialized: no queue or completion signal")]
    NotInitialized,

    #[error("no packet written for this dispatch")]
    NoPacket,
}

/// Errors produced while preparing, submitting or waiting on a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The runtime (or the device behind it) reported a non-success status.
    #[error("{context}: {status}")]
    Runtime { context: String, status: HsaStatus },

    #[error("kernel execution timed out after {elapsed:?} (signal value {value})")]
    WaitTimeout { elapsed: Duration, value: i64 },

    #[error("verification failed: {0}")]
    Verification(String),
}

impl DispatchError {
    pub fn runtime(context: impl Into<String>, status: HsaStatus) -> Self {
        Self::Runtime { context: context.into(), status }
    }

    /// Runtime status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<HsaStatus> {
        match self {
            Self::Runtime { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Result of a raw runtime call.
pub type HsaResult<T> = std::result::Result<T, HsaStatus>;

//! HSA runtime status codes.
//!
//! Numeric values follow `hsa_status_t`, so a status coming back from a real
//! runtime library maps onto the same variant as one produced by the
//! simulated agent.

/// HSA status codes (subset used by the dispatch path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HsaStatus {
    Success = 0x0,
    InfoBreak = 0x1,
    Error = 0x1000,
    InvalidArgument = 0x1001,
    InvalidQueueCreation = 0x1002,
    InvalidAllocation = 0x1003,
    InvalidAgent = 0x1004,
    InvalidRegion = 0x1005,
    InvalidSignal = 0x1006,
    InvalidQueue = 0x1007,
    OutOfResources = 0x1008,
    InvalidPacketFormat = 0x1009,
    ResourceFree = 0x100A,
    NotInitialized = 0x100B,
    IncompatibleArguments = 0x100D,
    InvalidIndex = 0x100E,
    InvalidCodeObject = 0x1010,
    InvalidExecutable = 0x1011,
    FrozenExecutable = 0x1012,
    InvalidSymbolName = 0x1013,
    Exception = 0x1016,
}

impl HsaStatus {
    /// Raw `hsa_status_t` value.
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::InfoBreak)
    }

    /// Human-readable description, in the spirit of `hsa_status_string`.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "HSA_STATUS_SUCCESS: The function has been executed successfully.",
            Self::InfoBreak => {
                "HSA_STATUS_INFO_BREAK: A traversal over a list of elements has been interrupted."
            }
            Self::Error => "HSA_STATUS_ERROR: A generic error has occurred.",
            Self::InvalidArgument => {
                "HSA_STATUS_ERROR_INVALID_ARGUMENT: One of the actual arguments does not meet a precondition."
            }
            Self::InvalidQueueCreation => {
                "HSA_STATUS_ERROR_INVALID_QUEUE_CREATION: The requested queue creation is not valid."
            }
            Self::InvalidAllocation => {
                "HSA_STATUS_ERROR_INVALID_ALLOCATION: The requested allocation is not valid."
            }
            Self::InvalidAgent => "HSA_STATUS_ERROR_INVALID_AGENT: The agent is invalid.",
            Self::InvalidRegion => "HSA_STATUS_ERROR_INVALID_REGION: The memory region is invalid.",
            Self::InvalidSignal => "HSA_STATUS_ERROR_INVALID_SIGNAL: The signal is invalid.",
            Self::InvalidQueue => "HSA_STATUS_ERROR_INVALID_QUEUE: The queue is invalid.",
            Self::OutOfResources => {
                "HSA_STATUS_ERROR_OUT_OF_RESOURCES: The runtime failed to allocate the necessary resources."
            }
            Self::InvalidPacketFormat => {
                "HSA_STATUS_ERROR_INVALID_PACKET_FORMAT: The AQL packet is malformed."
            }
            Self::ResourceFree => {
                "HSA_STATUS_ERROR_RESOURCE_FREE: An error has been detected while releasing a resource."
            }
            Self::NotInitialized => {
                "HSA_STATUS_ERROR_NOT_INITIALIZED: The runtime has not been initialized."
            }
            Self::IncompatibleArguments => {
                "HSA_STATUS_ERROR_INCOMPATIBLE_ARGUMENTS: The arguments passed to a function are not compatible."
            }
            Self::InvalidIndex => "HSA_STATUS_ERROR_INVALID_INDEX: The index is invalid.",
            Self::InvalidCodeObject => {
                "HSA_STATUS_ERROR_INVALID_CODE_OBJECT: The code object is invalid."
            }
            Self::InvalidExecutable => {
                "HSA_STATUS_ERROR_INVALID_EXECUTABLE: The executable is invalid."
            }
            Self::FrozenExecutable => {
                "HSA_STATUS_ERROR_FROZEN_EXECUTABLE: The executable is frozen."
            }
            Self::InvalidSymbolName => {
                "HSA_STATUS_ERROR_INVALID_SYMBOL_NAME: There is no symbol with the given name."
            }
            Self::Exception => {
                "HSA_STATUS_ERROR_EXCEPTION: An HSAIL operation resulted in a hardware exception."
            }
        }
    }
}

impl std::fmt::Display for HsaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

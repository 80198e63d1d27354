//! AQL kernel dispatch packet.
//!
//! A packet occupies one 64-byte ring slot, viewed as sixteen little-endian
//! `u32` words. Word 0 carries `header | setup << 16`; publishing a packet
//! means writing words 1..16 first and then release-storing word 0. A
//! consumer that acquire-loads word 0 and sees a kernel-dispatch header is
//! guaranteed to see the complete body.

use crate::handle::{DeviceAddress, KernelObject};
use serde::{Deserialize, Serialize};

pub const PACKET_SIZE: usize = 64;
pub const PACKET_WORDS: usize = PACKET_SIZE / 4;

pub const HEADER_TYPE_SHIFT: u16 = 0;
pub const HEADER_TYPE_WIDTH: u16 = 8;
pub const HEADER_BARRIER_SHIFT: u16 = 8;
pub const HEADER_ACQUIRE_FENCE_SCOPE_SHIFT: u16 = 9;
pub const HEADER_RELEASE_FENCE_SCOPE_SHIFT: u16 = 11;
pub const FENCE_SCOPE_WIDTH: u16 = 2;
pub const SETUP_DIMENSIONS_SHIFT: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    VendorSpecific = 0,
    Invalid = 1,
    KernelDispatch = 2,
    BarrierAnd = 3,
    AgentDispatch = 4,
    BarrierOr = 5,
}

impl PacketType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::VendorSpecific),
            1 => Some(Self::Invalid),
            2 => Some(Self::KernelDispatch),
            3 => Some(Self::BarrierAnd),
            4 => Some(Self::AgentDispatch),
            5 => Some(Self::BarrierOr),
            _ => None,
        }
    }
}

/// Memory fence scope applied around a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceScope {
    None,
    Agent,
    #[default]
    System,
}

impl FenceScope {
    fn bits(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Agent => 1,
            Self::System => 2,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits {
            1 => Self::Agent,
            2 => Self::System,
            _ => Self::None,
        }
    }
}

impl std::fmt::Display for FenceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Agent => write!(f, "agent"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for FenceScope {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(format!("unknown fence scope: {other}")),
        }
    }
}

/// Decoded form of the 16-bit packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub barrier: bool,
    pub acquire_scope: FenceScope,
    pub release_scope: FenceScope,
}

impl PacketHeader {
    pub fn kernel_dispatch(barrier: bool, scope: FenceScope) -> Self {
        Self {
            packet_type: PacketType::KernelDispatch,
            barrier,
            acquire_scope: scope,
            release_scope: scope,
        }
    }

    /// Header value marking a slot as not yet ready.
    pub fn invalid() -> Self {
        Self {
            packet_type: PacketType::Invalid,
            barrier: false,
            acquire_scope: FenceScope::None,
            release_scope: FenceScope::None,
        }
    }

    pub fn encode(self) -> u16 {
        let mut header = (self.packet_type as u16) << HEADER_TYPE_SHIFT;
        if self.barrier {
            header |= 1 << HEADER_BARRIER_SHIFT;
        }
        header |= self.acquire_scope.bits() << HEADER_ACQUIRE_FENCE_SCOPE_SHIFT;
        header |= self.release_scope.bits() << HEADER_RELEASE_FENCE_SCOPE_SHIFT;
        header
    }

    /// Decode a raw header; `None` for an unknown packet type.
    pub fn decode(raw: u16) -> Option<Self> {
        let type_mask = (1u16 << HEADER_TYPE_WIDTH) - 1;
        let scope_mask = (1u16 << FENCE_SCOPE_WIDTH) - 1;
        Some(Self {
            packet_type: PacketType::from_raw(((raw >> HEADER_TYPE_SHIFT) & type_mask) as u8)?,
            barrier: (raw >> HEADER_BARRIER_SHIFT) & 1 == 1,
            acquire_scope: FenceScope::from_bits(
                (raw >> HEADER_ACQUIRE_FENCE_SCOPE_SHIFT) & scope_mask,
            ),
            release_scope: FenceScope::from_bits(
                (raw >> HEADER_RELEASE_FENCE_SCOPE_SHIFT) & scope_mask,
            ),
        })
    }
}

/// Destination for packet words.
///
/// Ring slots implement this with atomics; tests implement it to record the
/// order in which words are written.
pub trait PacketSink {
    /// Store one body word (index 1..16).
    fn store_body_word(&self, index: usize, value: u32);

    /// Store word 0 with release ordering.
    fn store_header_word(&self, value: u32);
}

/// Kernel dispatch packet body plus the header it will be published with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPacket {
    pub header: PacketHeader,
    /// Number of grid dimensions (1..=3).
    pub dimensions: u16,
    pub workgroup_size: [u16; 3],
    pub grid_size: [u32; 3],
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: KernelObject,
    pub kernarg_address: DeviceAddress,
    pub completion_signal: u64,
}

impl Default for DispatchPacket {
    fn default() -> Self {
        Self {
            header: PacketHeader::kernel_dispatch(true, FenceScope::System),
            dimensions: 1,
            workgroup_size: [1, 1, 1],
            grid_size: [1, 1, 1],
            private_segment_size: 0,
            group_segment_size: 0,
            kernel_object: KernelObject::NULL,
            kernarg_address: DeviceAddress::NULL,
            completion_signal: 0,
        }
    }
}

/// Dimensionality implied by a launch shape: the highest axis with extent
/// greater than one, never less than one.
pub fn dimensions_of(workgroup: [u16; 3], grid: [u32; 3]) -> u16 {
    if workgroup[2] > 1 || grid[2] > 1 {
        3
    } else if workgroup[1] > 1 || grid[1] > 1 {
        2
    } else {
        1
    }
}

fn split(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

fn join(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

impl DispatchPacket {
    pub fn setup(&self) -> u16 {
        self.dimensions << SETUP_DIMENSIONS_SHIFT
    }

    /// Word 0: `header | setup << 16`.
    pub fn header_word(&self) -> u32 {
        u32::from(self.header.encode()) | (u32::from(self.setup()) << 16)
    }

    /// Words 1..16 in slot order.
    pub fn body_words(&self) -> [u32; PACKET_WORDS - 1] {
        let [wx, wy, wz] = self.workgroup_size;
        let (ko_lo, ko_hi) = split(self.kernel_object.handle());
        let (ka_lo, ka_hi) = split(self.kernarg_address.0);
        let (cs_lo, cs_hi) = split(self.completion_signal);
        [
            u32::from(wx) | (u32::from(wy) << 16),
            u32::from(wz),
            self.grid_size[0],
            self.grid_size[1],
            self.grid_size[2],
            self.private_segment_size,
            self.group_segment_size,
            ko_lo,
            ko_hi,
            ka_lo,
            ka_hi,
            0,
            0,
            cs_lo,
            cs_hi,
        ]
    }

    /// Write every field except the header.
    pub fn write_body<S: PacketSink + ?Sized>(&self, sink: &S) {
        for (i, word) in self.body_words().into_iter().enumerate() {
            sink.store_body_word(i + 1, word);
        }
    }

    /// Release-store the header, handing the slot to the consumer.
    pub fn publish<S: PacketSink + ?Sized>(&self, sink: &S) {
        sink.store_header_word(self.header_word());
    }

    /// Decode a full slot image. `None` if the header type is unknown.
    pub fn from_words(words: &[u32; PACKET_WORDS]) -> Option<Self> {
        let header = PacketHeader::decode(words[0] as u16)?;
        let setup = (words[0] >> 16) as u16;
        Some(Self {
            header,
            dimensions: (setup >> SETUP_DIMENSIONS_SHIFT) & 0b11,
            workgroup_size: [words[1] as u16, (words[1] >> 16) as u16, words[2] as u16],
            grid_size: [words[3], words[4], words[5]],
            private_segment_size: words[6],
            group_segment_size: words[7],
            kernel_object: KernelObject(join(words[8], words[9])),
            kernarg_address: DeviceAddress(join(words[10], words[11])),
            completion_signal: join(words[14], words[15]),
        })
    }
}

//! Opaque runtime handles.
//!
//! Handles are plain `u64` tokens handed out by a [`Runtime`](crate::Runtime).
//! The dispatch core never creates or destroys the objects behind them; a
//! zero handle means "unbound".

use bytemuck::{Pod, Zeroable};

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// The unbound handle.
            pub const NULL: Self = Self(0);

            #[must_use]
            pub fn handle(self) -> u64 {
                self.0
            }

            #[must_use]
            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

opaque_handle!(
    /// A compute device or host CPU.
    Agent
);
opaque_handle!(
    /// An allocator pool with a specific placement capability.
    Region
);
opaque_handle!(
    /// A deserialized code object.
    CodeObject
);
opaque_handle!(
    /// A linked executable.
    Executable
);
opaque_handle!(
    /// Kernel entry point as written into a dispatch packet.
    KernelObject
);

/// Address in the agent-visible address space.
///
/// `Pod` so a pointer argument can be packed into the kernarg buffer with the
/// same path as any other scalar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
#[repr(transparent)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Which role a bound region plays for a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Host-visible, fine-grained memory.
    System,
    /// Kernel-argument memory.
    Kernarg,
    /// Device-local, coarse-grained memory.
    Local,
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Kernarg => write!(f, "kernarg"),
            Self::Local => write!(f, "local"),
        }
    }
}

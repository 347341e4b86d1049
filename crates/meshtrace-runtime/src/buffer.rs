//! Mesh buffers
//!
//! Only replicated buffers exist here: the same address range on every chip
//! of the mesh, each chip holding its own contents.

/// What a buffer is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    /// General DRAM buffer
    Dram,
    /// Resident trace commands, carved from the trace region
    Trace,
}

/// How pages are laid out across banks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorMemoryLayout {
    /// Pages round-robin over every bank
    Interleaved,
    /// Pages pinned to specific banks
    Sharded,
}

/// Per-chip buffer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLocalBufferConfig {
    /// Page size in bytes
    pub page_size: u32,
    /// Buffer usage
    pub buffer_type: BufferType,
    /// Page layout
    pub buffer_layout: TensorMemoryLayout,
}

/// Mesh-wide parameters of a replicated buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatedBufferConfig {
    /// Size on each chip, in bytes
    pub size: u64,
}

/// Byte window inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    /// Offset from the buffer start
    pub offset: u64,
    /// Length
    pub size: u64,
}

impl BufferRegion {
    /// Window of `size` bytes at `offset`
    #[must_use]
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }
}

/// A buffer replicated over every chip of a mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshBuffer {
    address: u64,
    size: u64,
    config: DeviceLocalBufferConfig,
}

impl MeshBuffer {
    pub(crate) const fn new(address: u64, size: u64, config: DeviceLocalBufferConfig) -> Self {
        Self {
            address,
            size,
            config,
        }
    }

    /// Device address, identical on every chip
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Size on each chip
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Page size
    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.config.page_size
    }

    /// Number of whole pages
    #[must_use]
    pub const fn num_pages(&self) -> u64 {
        self.size / self.config.page_size as u64
    }

    /// Per-chip parameters
    #[must_use]
    pub const fn device_local_config(&self) -> &DeviceLocalBufferConfig {
        &self.config
    }

    /// Whether `region` lies inside the buffer
    #[must_use]
    pub fn contains(&self, region: &BufferRegion) -> bool {
        region
            .offset
            .checked_add(region.size)
            .is_some_and(|end| end <= self.size)
    }
}

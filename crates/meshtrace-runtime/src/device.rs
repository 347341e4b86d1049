//! Software chip handle
//!
//! One [`Device`] per mesh coordinate. It owns the chip's system memory
//! manager, its sub-device partitioning and a DRAM model of the trace
//! region. Every property the mesh compares across chips is read from here.

use meshtrace_hw::mesh::MeshCoordinate;

use crate::config::MeshConfig;
use crate::error::{Result, TraceError};
use crate::sysmem::SystemMemoryManager;
use crate::topology::{CoreCoord, SubDeviceManager, SubDeviceTopology, WorkerTopology};

/// Chip properties that must agree across a mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    /// DRAM banks
    pub num_dram_banks: u32,
    /// Trace region capacity in bytes
    pub trace_region_size: u64,
    /// NOC coordinate of the dispatcher core
    pub dispatch_core: CoreCoord,
}

/// Software model of one chip
#[derive(Debug)]
pub struct Device {
    id: u32,
    coord: MeshCoordinate,
    properties: DeviceProperties,
    sub_devices: SubDeviceManager,
    sysmem: SystemMemoryManager,
    trace_region: Vec<u8>,
}

impl Device {
    /// Bring up a chip at `coord` from the mesh configuration
    ///
    /// # Errors
    ///
    /// Returns error if the sub-device partitioning is invalid.
    pub fn new(id: u32, coord: MeshCoordinate, config: &MeshConfig) -> Result<Self> {
        let properties = DeviceProperties {
            num_dram_banks: config.num_dram_banks,
            trace_region_size: config.trace_region_size,
            dispatch_core: config.dispatch_core,
        };
        Self::with_properties(id, coord, properties, config.sub_devices.clone(), config)
    }

    /// Bring up a chip whose properties differ from the mesh configuration
    ///
    /// # Errors
    ///
    /// Returns error if the sub-device partitioning is invalid.
    pub fn with_properties(
        id: u32,
        coord: MeshCoordinate,
        properties: DeviceProperties,
        sub_devices: Vec<SubDeviceTopology>,
        config: &MeshConfig,
    ) -> Result<Self> {
        let sub_devices = SubDeviceManager::new(sub_devices)?;
        tracing::debug!("Opening device {id} at {coord}");
        Ok(Self {
            id,
            coord,
            properties,
            sub_devices,
            sysmem: SystemMemoryManager::new(
                id,
                config.num_command_queues,
                config.issue_queue_size,
                config.fetch_queue_entries,
            ),
            trace_region: Vec::new(),
        })
    }

    /// Chip id
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Position in the mesh
    #[must_use]
    pub const fn coord(&self) -> &MeshCoordinate {
        &self.coord
    }

    /// Mesh-wide comparable properties
    #[must_use]
    pub const fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Sub-device partitioning
    #[must_use]
    pub const fn sub_device_manager(&self) -> &SubDeviceManager {
        &self.sub_devices
    }

    /// Number of sub-devices
    #[must_use]
    pub fn num_sub_devices(&self) -> usize {
        self.sub_devices.num_sub_devices()
    }

    /// System memory manager
    #[must_use]
    pub const fn sysmem(&self) -> &SystemMemoryManager {
        &self.sysmem
    }

    /// System memory manager, mutably
    pub fn sysmem_mut(&mut self) -> &mut SystemMemoryManager {
        &mut self.sysmem
    }

    /// System memory manager and topology, borrowed together
    pub fn dispatch_parts(&mut self) -> (&mut SystemMemoryManager, &SubDeviceManager) {
        (&mut self.sysmem, &self.sub_devices)
    }

    /// Write `data` into the trace region at `addr`
    ///
    /// # Errors
    ///
    /// Returns error if the write leaves the trace region.
    pub fn write_trace_region(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        let end = addr
            .checked_add(size)
            .filter(|&end| end <= self.properties.trace_region_size)
            .ok_or(TraceError::WriteOutOfBounds {
                offset: addr,
                size,
                buffer_size: self.properties.trace_region_size,
            })?;
        #[allow(clippy::cast_possible_truncation)]
        let (start, end) = (addr as usize, end as usize);
        if self.trace_region.len() < end {
            self.trace_region.resize(end, 0);
        }
        self.trace_region[start..end].copy_from_slice(data);
        tracing::trace!("Device {}: wrote {size}B at {addr:#x}", self.id);
        Ok(())
    }

    /// Read `len` bytes of the trace region at `addr`; unwritten bytes read as zero
    #[must_use]
    pub fn read_trace_region(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        #[allow(clippy::cast_possible_truncation)]
        let start = addr as usize;
        if start < self.trace_region.len() {
            let avail = (self.trace_region.len() - start).min(len);
            out[..avail].copy_from_slice(&self.trace_region[start..start + avail]);
        }
        out
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Closing device {} at {}", self.id, self.coord);
    }
}

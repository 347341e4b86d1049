//! Mesh device: a grid of chips driven as one
//!
//! Owns the chips, the mesh-wide trace region allocator, the trace buffer
//! pool and one [`MeshCommandQueue`] per hardware command queue.
//!
//! ```text
//! begin_mesh_trace ─▶ enqueue_traced_program* ─▶ end_mesh_trace ─▶ replay_mesh_trace*
//!        │                                            │                    │
//!   pool entry created                     descriptor assembled,    replay command on
//!   (no buffer yet)                        trace buffer written     every chip
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use meshtrace_hw::mesh::{MeshCoordinate, MeshCoordinateRange, MeshShape};
use meshtrace_hw::memmap::ProgrammableCoreType;
use tracing::{debug, info};

use crate::allocator::TraceRegionAllocator;
use crate::buffer::{
    BufferRegion, BufferType, DeviceLocalBufferConfig, MeshBuffer, ReplicatedBufferConfig,
    TensorMemoryLayout,
};
use crate::command_queue::{MeshCommandQueue, TracedProgram};
use crate::config::{DispatchConfig, MeshConfig};
use crate::device::Device;
use crate::error::{Result, TraceError};
use crate::grid::DeviceGrid;
use crate::mesh_trace::{populate_mesh_buffer, MeshTraceBuffer, MeshTraceId, TraceIdAllocator};
use crate::topology::{CoreCoord, SubDeviceId, SubDeviceManager, WorkerTopology};
use crate::worker::DeviceTasks;

/// A mesh of chips with trace capture and replay
#[derive(Debug)]
pub struct MeshDevice {
    id: u32,
    dispatch: DispatchConfig,
    grid: DeviceGrid,
    sub_devices: SubDeviceManager,
    trace_allocator: TraceRegionAllocator,
    trace_buffer_pool: HashMap<MeshTraceId, Arc<MeshTraceBuffer>>,
    command_queues: Vec<MeshCommandQueue>,
    trace_ids: TraceIdAllocator,
}

impl MeshDevice {
    /// Open a mesh of identical chips described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn create(config: &MeshConfig) -> Result<Self> {
        config.validate()?;
        let devices = MeshCoordinateRange::from_shape(&config.shape)
            .iter()
            .enumerate()
            .map(|(index, coord)| {
                let id = u32::try_from(index)
                    .map_err(|_| TraceError::out_of_range("device index", index, u32::MAX))?;
                Device::new(id, coord, config)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_devices(config, devices)
    }

    /// Build a mesh over already opened chips, row-major over `config.shape`
    ///
    /// Chip properties come from the chips themselves; the trace region
    /// size and sub-device partitioning must agree across them.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the chips do not fill
    /// the shape, or they disagree on a mesh-wide property.
    pub fn from_devices(config: &MeshConfig, devices: Vec<Device>) -> Result<Self> {
        config.validate()?;
        let grid = DeviceGrid::new(config.shape.clone(), devices)?;
        let trace_region_size =
            grid.reference_value("trace_region_size", |d| d.properties().trace_region_size)?;
        let sub_devices =
            grid.reference_value("sub_device_topology", |d| d.sub_device_manager().clone())?;
        let command_queues = (0..config.num_command_queues)
            .map(|cq_id| MeshCommandQueue::new(cq_id, config, sub_devices.clone()))
            .collect();
        info!(
            "Opened mesh {} ({}, {} devices, {trace_region_size}B trace region)",
            config.mesh_id,
            config.shape,
            grid.num_devices()
        );
        Ok(Self {
            id: config.mesh_id,
            dispatch: config.dispatch,
            grid,
            sub_devices,
            trace_allocator: TraceRegionAllocator::new(config.mesh_id, trace_region_size),
            trace_buffer_pool: HashMap::new(),
            command_queues,
            trace_ids: TraceIdAllocator::new(),
        })
    }

    /// Mesh id
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Mesh shape
    #[must_use]
    pub const fn shape(&self) -> &MeshShape {
        self.grid.shape()
    }

    /// Number of chips
    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.grid.num_devices()
    }

    /// All chips, row-major
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        self.grid.devices()
    }

    /// Chip at `coord`
    ///
    /// # Errors
    ///
    /// Returns error if `coord` is outside the mesh.
    pub fn device(&self, coord: &MeshCoordinate) -> Result<&Device> {
        self.grid.device(coord)
    }

    /// Dispatcher layout
    #[must_use]
    pub const fn dispatch_config(&self) -> &DispatchConfig {
        &self.dispatch
    }

    pub(crate) const fn grid(&self) -> &DeviceGrid {
        &self.grid
    }

    pub(crate) fn grid_mut(&mut self) -> &mut DeviceGrid {
        &mut self.grid
    }

    /// A property that must agree across chips
    ///
    /// # Errors
    ///
    /// Returns `TraceError::DeviceMismatch` if any chip differs from the first.
    pub fn reference_value<T, F>(&self, property: &'static str, f: F) -> Result<T>
    where
        T: PartialEq + std::fmt::Debug,
        F: Fn(&Device) -> T,
    {
        self.grid.reference_value(property, f)
    }

    /// DRAM banks per chip
    ///
    /// # Errors
    ///
    /// Returns `TraceError::DeviceMismatch` if chips disagree.
    pub fn num_dram_banks(&self) -> Result<u32> {
        self.reference_value("num_dram_banks", |d| d.properties().num_dram_banks)
    }

    /// Trace region bytes per chip
    ///
    /// # Errors
    ///
    /// Returns `TraceError::DeviceMismatch` if chips disagree.
    pub fn trace_region_size(&self) -> Result<u64> {
        self.reference_value("trace_region_size", |d| d.properties().trace_region_size)
    }

    /// Dispatcher core coordinate
    ///
    /// # Errors
    ///
    /// Returns `TraceError::DeviceMismatch` if chips disagree.
    pub fn dispatch_core(&self) -> Result<CoreCoord> {
        self.reference_value("dispatch_core", |d| d.properties().dispatch_core)
    }

    /// Sub-devices per chip
    #[must_use]
    pub fn num_sub_devices(&self) -> usize {
        self.sub_devices.num_sub_devices()
    }

    /// Worker cores of `core_type` in `sub_device`
    ///
    /// # Errors
    ///
    /// Returns error if the sub-device is unknown.
    pub fn num_worker_cores(&self, core_type: ProgrammableCoreType, sub_device: SubDeviceId) -> Result<u32> {
        self.sub_devices.get(sub_device)?;
        Ok(self.sub_devices.num_worker_cores(core_type, sub_device))
    }

    /// Bytes held by live trace buffers
    #[must_use]
    pub const fn trace_buffers_size(&self) -> u64 {
        self.trace_allocator.trace_buffers_size()
    }

    /// Allocate a buffer at the same address on every chip
    ///
    /// # Errors
    ///
    /// Returns `TraceError::TraceRegionExhausted` if the trace region cannot
    /// hold it, or `TraceError::InvalidConfig` for anything but an
    /// interleaved trace buffer of whole pages.
    pub fn create_replicated_buffer(
        &mut self,
        global: ReplicatedBufferConfig,
        local: DeviceLocalBufferConfig,
    ) -> Result<MeshBuffer> {
        if local.buffer_type != BufferType::Trace
            || local.buffer_layout != TensorMemoryLayout::Interleaved
        {
            return Err(TraceError::invalid_config(format!(
                "unsupported buffer {:?}/{:?}, only interleaved trace buffers are backed",
                local.buffer_type, local.buffer_layout
            )));
        }
        if local.page_size == 0 || global.size % u64::from(local.page_size) != 0 {
            return Err(TraceError::invalid_config(format!(
                "buffer size {} is not a multiple of page size {}",
                global.size, local.page_size
            )));
        }
        let address = self
            .trace_allocator
            .allocate(global.size, u64::from(local.page_size))?;
        Ok(MeshBuffer::new(address, global.size, local))
    }

    /// Return a buffer's space to the trace region
    pub fn deallocate_buffer(&mut self, buffer: &MeshBuffer) {
        if self.trace_allocator.free(buffer.address()).is_none() {
            tracing::warn!("Buffer at {:#x} was not allocated", buffer.address());
        }
    }

    /// Write `data` into `region` of `buffer` on every chip of `range`
    ///
    /// # Errors
    ///
    /// Returns error if `range` leaves the mesh or `region` leaves the
    /// buffer.
    pub fn enqueue_write_shard_to_sub_grid(
        &mut self,
        buffer: &MeshBuffer,
        data: Bytes,
        range: &MeshCoordinateRange,
        region: BufferRegion,
    ) -> Result<()> {
        let mut tasks = DeviceTasks::new(self.grid.num_devices());
        self.grid
            .stage_shard_write(&mut tasks, buffer, data, range, region)?;
        self.grid.synchronize(tasks)
    }

    /// Command queue `cq_id`
    ///
    /// # Errors
    ///
    /// Returns `TraceError::OutOfRange` if the queue does not exist.
    pub fn command_queue(&self, cq_id: u8) -> Result<&MeshCommandQueue> {
        self.command_queues
            .get(usize::from(cq_id))
            .ok_or_else(|| TraceError::out_of_range("command queue", cq_id, self.command_queues.len()))
    }

    fn queue_and_grid(&mut self, cq_id: u8) -> Result<(&mut MeshCommandQueue, &mut DeviceGrid)> {
        let num_cqs = self.command_queues.len();
        let cq = self
            .command_queues
            .get_mut(usize::from(cq_id))
            .ok_or_else(|| TraceError::out_of_range("command queue", cq_id, num_cqs))?;
        Ok((cq, &mut self.grid))
    }

    /// Fresh trace id
    pub fn next_trace_id(&self) -> MeshTraceId {
        self.trace_ids.next_id()
    }

    /// Register an empty trace under `trace_id`
    ///
    /// # Errors
    ///
    /// Returns `TraceError::DuplicateTraceId` if the id is taken.
    pub fn create_mesh_trace(&mut self, trace_id: MeshTraceId) -> Result<Arc<MeshTraceBuffer>> {
        if self.trace_buffer_pool.contains_key(&trace_id) {
            return Err(TraceError::DuplicateTraceId {
                trace_id: trace_id.get(),
            });
        }
        let trace = Arc::new(MeshTraceBuffer::new(trace_id));
        self.trace_buffer_pool.insert(trace_id, Arc::clone(&trace));
        debug!("Registered trace {trace_id} on mesh {}", self.id);
        Ok(trace)
    }

    /// Trace registered under `trace_id`
    ///
    /// # Errors
    ///
    /// Returns `TraceError::TraceNotFound` if no such trace exists.
    pub fn get_mesh_trace(&self, trace_id: MeshTraceId) -> Result<Arc<MeshTraceBuffer>> {
        self.trace_buffer_pool
            .get(&trace_id)
            .cloned()
            .ok_or(TraceError::TraceNotFound {
                trace_id: trace_id.get(),
            })
    }

    /// Drop a trace and free its buffer
    ///
    /// # Errors
    ///
    /// Returns `TraceError::TraceNotFound` if no such trace exists, or
    /// `TraceError::CaptureInProgress` if it is still being captured.
    pub fn release_mesh_trace(&mut self, trace_id: MeshTraceId) -> Result<()> {
        if let Some(cq) = self
            .command_queues
            .iter()
            .find(|cq| cq.capturing_trace() == Some(trace_id))
        {
            return Err(TraceError::CaptureInProgress {
                cq_id: cq.id(),
                trace_id: trace_id.get(),
            });
        }
        let trace = self
            .trace_buffer_pool
            .remove(&trace_id)
            .ok_or(TraceError::TraceNotFound {
                trace_id: trace_id.get(),
            })?;
        if let Some(buffer) = trace.mesh_buffer() {
            self.deallocate_buffer(buffer);
        }
        info!(
            "Released trace {trace_id} ({}B of trace buffers still in use)",
            self.trace_allocator.trace_buffers_size()
        );
        Ok(())
    }

    /// Start capturing `trace_id` on `cq_id`
    ///
    /// # Errors
    ///
    /// Returns error if the queue is unknown or already capturing, or the id
    /// is taken.
    pub fn begin_mesh_trace(&mut self, cq_id: u8, trace_id: MeshTraceId) -> Result<()> {
        if let Some(active) = self.command_queue(cq_id)?.capturing_trace() {
            return Err(TraceError::CaptureInProgress {
                cq_id,
                trace_id: active.get(),
            });
        }
        self.create_mesh_trace(trace_id)?;
        let (cq, grid) = self.queue_and_grid(cq_id)?;
        cq.record_begin(trace_id, grid)
    }

    /// Record one program launch into the capture open on `cq_id`
    ///
    /// # Errors
    ///
    /// Returns error if no capture is open or the program is out of range.
    pub fn enqueue_traced_program(&mut self, cq_id: u8, program: &TracedProgram) -> Result<()> {
        let (cq, grid) = self.queue_and_grid(cq_id)?;
        cq.enqueue_traced_program(program, grid)
    }

    /// Finish capturing `trace_id` and write it to a trace buffer
    ///
    /// If the buffer cannot be created the trace stays registered without
    /// one; replaying it fails until it is released and recaptured.
    ///
    /// # Errors
    ///
    /// Returns error if no capture of `trace_id` is open on `cq_id`, chips
    /// disagree on their bank count, or the trace region is exhausted.
    pub fn end_mesh_trace(&mut self, cq_id: u8, trace_id: MeshTraceId) -> Result<()> {
        let dispatch = self.dispatch;
        let (cq, grid) = self.queue_and_grid(cq_id)?;
        let descriptor = cq.record_end(trace_id, grid, &dispatch)?;
        let buffer = populate_mesh_buffer(self, &descriptor)?;
        self.trace_buffer_pool.insert(
            trace_id,
            Arc::new(MeshTraceBuffer::materialized(trace_id, descriptor, buffer)),
        );
        Ok(())
    }

    /// Replay a materialized trace on `cq_id`
    ///
    /// # Errors
    ///
    /// Returns error if the trace is unknown or has no buffer, the queue is
    /// capturing, or a chip rejects the replay command.
    pub fn replay_mesh_trace(&mut self, cq_id: u8, trace_id: MeshTraceId) -> Result<()> {
        let trace = self.get_mesh_trace(trace_id)?;
        let dispatch = self.dispatch;
        let md = trace.dispatch_metadata(&dispatch)?;
        let (cq, grid) = self.queue_and_grid(cq_id)?;
        cq.enqueue_trace(&md, grid, &dispatch)?;
        info!("Replayed trace {trace_id} on command queue {cq_id}");
        Ok(())
    }
}

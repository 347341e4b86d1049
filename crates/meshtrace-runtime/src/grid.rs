//! Chips of a mesh and the pool that drives them
//!
//! Chips are stored row-major, so a coordinate's linear index is also its
//! slot in the pool.

use std::fmt::Debug;

use bytes::Bytes;
use meshtrace_hw::mesh::{MeshCoordinate, MeshCoordinateRange, MeshShape};

use crate::buffer::{BufferRegion, MeshBuffer};
use crate::device::Device;
use crate::error::{Result, TraceError};
use crate::mesh_trace::BypassSource;
use crate::worker::{DeviceTasks, DeviceWorkerPool};

/// Every chip of a mesh, in row-major order
#[derive(Debug)]
pub struct DeviceGrid {
    shape: MeshShape,
    devices: Vec<Device>,
    workers: DeviceWorkerPool,
}

impl DeviceGrid {
    /// Grid over `devices`, which must be row-major over `shape`
    ///
    /// # Errors
    ///
    /// Returns error if the grid is empty, the chip count does not match
    /// the shape, or the worker pool cannot start.
    pub fn new(shape: MeshShape, devices: Vec<Device>) -> Result<Self> {
        if devices.is_empty() {
            return Err(TraceError::EmptyMesh);
        }
        if devices.len() != shape.mesh_size() {
            return Err(TraceError::invalid_config(format!(
                "{} devices given for a {shape} mesh",
                devices.len()
            )));
        }
        for (index, device) in devices.iter().enumerate() {
            if device.coord().to_linear_index(&shape) != Some(index) {
                return Err(TraceError::invalid_config(format!(
                    "device {} at {} is not in row-major slot {index}",
                    device.id(),
                    device.coord()
                )));
            }
        }
        let workers = DeviceWorkerPool::new(devices.len())?;
        Ok(Self {
            shape,
            devices,
            workers,
        })
    }

    /// Mesh shape
    #[must_use]
    pub const fn shape(&self) -> &MeshShape {
        &self.shape
    }

    /// Number of chips
    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// All chips, row-major
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// All chips, mutably
    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    /// Slot of the chip at `coord`
    ///
    /// # Errors
    ///
    /// Returns `TraceError::OutOfRange` if `coord` is outside the mesh.
    pub fn device_index(&self, coord: &MeshCoordinate) -> Result<usize> {
        coord
            .to_linear_index(&self.shape)
            .ok_or_else(|| TraceError::out_of_range("coordinate", coord, &self.shape))
    }

    /// Chip at `coord`
    ///
    /// # Errors
    ///
    /// Returns `TraceError::OutOfRange` if `coord` is outside the mesh.
    pub fn device(&self, coord: &MeshCoordinate) -> Result<&Device> {
        Ok(&self.devices[self.device_index(coord)?])
    }

    /// Chip at `coord`, mutably
    ///
    /// # Errors
    ///
    /// Returns `TraceError::OutOfRange` if `coord` is outside the mesh.
    pub fn device_mut(&mut self, coord: &MeshCoordinate) -> Result<&mut Device> {
        let index = self.device_index(coord)?;
        Ok(&mut self.devices[index])
    }

    /// A property that must agree across chips
    ///
    /// # Errors
    ///
    /// Returns `TraceError::DeviceMismatch` naming the first chip whose value
    /// differs from chip 0.
    pub fn reference_value<T, F>(&self, property: &'static str, f: F) -> Result<T>
    where
        T: PartialEq + Debug,
        F: Fn(&Device) -> T,
    {
        let mut devices = self.devices.iter();
        let reference = devices.next().map(&f).ok_or(TraceError::EmptyMesh)?;
        for (index, device) in devices.enumerate() {
            let value = f(device);
            if value != reference {
                return Err(TraceError::device_mismatch(
                    property,
                    index + 1,
                    format!("{reference:?}"),
                    format!("{value:?}"),
                ));
            }
        }
        Ok(reference)
    }

    /// Queue a write of `data` into `buffer` on every chip of `range`
    ///
    /// # Errors
    ///
    /// Returns error if `range` leaves the mesh, `region` leaves the buffer,
    /// or `data` is not exactly `region.size` bytes.
    pub fn stage_shard_write(
        &self,
        tasks: &mut DeviceTasks<'_>,
        buffer: &MeshBuffer,
        data: Bytes,
        range: &MeshCoordinateRange,
        region: BufferRegion,
    ) -> Result<()> {
        if !MeshCoordinateRange::from_shape(&self.shape).contains_range(range) {
            return Err(TraceError::out_of_range("device range", range, &self.shape));
        }
        if !buffer.contains(&region) || data.len() as u64 != region.size {
            return Err(TraceError::WriteOutOfBounds {
                offset: region.offset,
                size: data.len() as u64,
                buffer_size: buffer.size(),
            });
        }
        let addr = buffer.address() + region.offset;
        for coord in range {
            let data = data.clone();
            tasks.push_work(self.device_index(&coord)?, move |device| {
                device.write_trace_region(addr, &data)
            });
        }
        Ok(())
    }

    /// Run `tasks` on the chips and join
    ///
    /// # Errors
    ///
    /// Returns the first task error.
    pub fn synchronize(&mut self, tasks: DeviceTasks<'_>) -> Result<()> {
        self.workers.synchronize(&mut self.devices, tasks)
    }

    /// Switch bypass of `cq_id` on or off on every chip, dropping what it held
    pub fn set_bypass_mode(&mut self, enable: bool, cq_id: u8) {
        for device in &mut self.devices {
            device.sysmem_mut().set_bypass_mode(enable, true, cq_id);
        }
    }

    /// The bypass buffers of command queue `cq_id`
    pub fn bypass(&mut self, cq_id: u8) -> QueueBypass<'_> {
        QueueBypass { grid: self, cq_id }
    }
}

/// Bypass buffers of one command queue across a grid
#[derive(Debug)]
pub struct QueueBypass<'a> {
    grid: &'a mut DeviceGrid,
    cq_id: u8,
}

impl BypassSource for QueueBypass<'_> {
    fn take_bypass_data(&mut self, coord: &MeshCoordinate) -> Result<Bytes> {
        let cq_id = self.cq_id;
        Ok(self.grid.device_mut(coord)?.sysmem_mut().take_bypass_data(cq_id))
    }
}

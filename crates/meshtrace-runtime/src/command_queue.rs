//! Mesh command queue
//!
//! Owns the host-side dispatch state of one hardware command queue across
//! the mesh and drives trace capture on it:
//!
//! 1. [`record_begin`](MeshCommandQueue::record_begin) shadows the dispatch
//!    state and switches this queue's bypass mode on across the mesh.
//!    Other queues keep issuing, or capturing, on their own buffers.
//! 2. Each traced program lands in the bypass buffer of the first chip of
//!    its range and leaves a staging record.
//! 3. [`record_end`](MeshCommandQueue::record_end) assembles the staged
//!    records into a [`MeshTraceDescriptor`] and restores dispatch state.
//!
//! Replay goes through [`enqueue_trace`](MeshCommandQueue::enqueue_trace).

use bytes::Bytes;
use meshtrace_hw::mesh::{MeshCoordinateRange, MeshShape};
use meshtrace_hw::memmap::ProgrammableCoreType;
use tracing::{debug, info};

use crate::config::{DispatchConfig, MeshConfig};
use crate::error::{Result, TraceError};
use crate::dispatch_state::HostDispatchState;
use crate::grid::DeviceGrid;
use crate::mesh_trace::{MeshTraceDescriptor, MeshTraceId, MeshTraceStagingMetadata};
use crate::topology::{SubDeviceId, SubDeviceManager, WorkerTopology};
use crate::trace_dispatch::{issue_trace_commands, TraceDispatchMetadata};
use crate::worker::DeviceTasks;

/// Command bytes of one program launch, as recorded into a trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedProgram {
    /// Chips the program runs on
    pub device_range: MeshCoordinateRange,
    /// Sub-device whose workers run it
    pub sub_device: SubDeviceId,
    /// Dispatch commands for the launch
    pub commands: Bytes,
    /// Go signal multicast to Tensix workers
    pub multicast_go: bool,
    /// Go signal unicast to active Ethernet workers
    pub unicast_go: bool,
    /// Kernel-config bytes per core class
    pub kernel_config_sizes: [u32; ProgrammableCoreType::COUNT],
}

impl TracedProgram {
    /// Multicast-only program with a 1 KiB Tensix kernel config
    #[must_use]
    pub fn new(device_range: MeshCoordinateRange, sub_device: SubDeviceId, commands: Bytes) -> Self {
        Self {
            device_range,
            sub_device,
            commands,
            multicast_go: true,
            unicast_go: false,
            kernel_config_sizes: [1024, 0],
        }
    }

    /// Same program with the given go-signal fan-out
    #[must_use]
    pub fn with_go_signals(mut self, multicast: bool, unicast: bool) -> Self {
        self.multicast_go = multicast;
        self.unicast_go = unicast;
        self
    }

    /// Same program with the given kernel-config sizes
    #[must_use]
    pub fn with_kernel_config_sizes(mut self, sizes: [u32; ProgrammableCoreType::COUNT]) -> Self {
        self.kernel_config_sizes = sizes;
        self
    }
}

#[derive(Debug)]
struct TraceCapture {
    trace_id: MeshTraceId,
    descriptor: MeshTraceDescriptor,
    staging: Vec<MeshTraceStagingMetadata>,
}

/// One hardware command queue, mesh wide
#[derive(Debug)]
pub struct MeshCommandQueue {
    cq_id: u8,
    topology: SubDeviceManager,
    host_state: HostDispatchState,
    capture: Option<TraceCapture>,
}

impl MeshCommandQueue {
    pub(crate) fn new(cq_id: u8, config: &MeshConfig, topology: SubDeviceManager) -> Self {
        Self {
            cq_id,
            topology,
            host_state: HostDispatchState::new(config.launch_msg_ring_entries, &config.kernel_config),
            capture: None,
        }
    }

    /// Queue id
    #[must_use]
    pub const fn id(&self) -> u8 {
        self.cq_id
    }

    /// Host-side dispatch state
    #[must_use]
    pub const fn host_state(&self) -> &HostDispatchState {
        &self.host_state
    }

    /// Trace being captured, if any
    #[must_use]
    pub fn capturing_trace(&self) -> Option<MeshTraceId> {
        self.capture.as_ref().map(|c| c.trace_id)
    }

    fn ensure_idle(&self) -> Result<()> {
        match &self.capture {
            Some(capture) => Err(TraceError::CaptureInProgress {
                cq_id: self.cq_id,
                trace_id: capture.trace_id.get(),
            }),
            None => Ok(()),
        }
    }

    /// Start capturing `trace_id`
    ///
    /// # Errors
    ///
    /// Returns `TraceError::CaptureInProgress` if a capture is already open.
    pub(crate) fn record_begin(&mut self, trace_id: MeshTraceId, grid: &mut DeviceGrid) -> Result<()> {
        self.ensure_idle()?;
        self.host_state.save_and_reset(self.topology.num_sub_devices());
        grid.set_bypass_mode(true, self.cq_id);
        self.capture = Some(TraceCapture {
            trace_id,
            descriptor: MeshTraceDescriptor::new(),
            staging: Vec::new(),
        });
        info!("Capturing trace {trace_id} on command queue {}", self.cq_id);
        Ok(())
    }

    /// Record one program launch into the open capture
    ///
    /// # Errors
    ///
    /// Returns error if no capture is open, the range leaves the mesh, or
    /// the sub-device is unknown.
    pub(crate) fn enqueue_traced_program(
        &mut self,
        program: &TracedProgram,
        grid: &mut DeviceGrid,
    ) -> Result<()> {
        let capture = self
            .capture
            .as_mut()
            .ok_or(TraceError::NoActiveCapture { cq_id: self.cq_id })?;
        if !MeshCoordinateRange::from_shape(grid.shape()).contains_range(&program.device_range) {
            return Err(TraceError::out_of_range(
                "device range",
                &program.device_range,
                grid.shape(),
            ));
        }
        self.topology.get(program.sub_device)?;
        let mut num_workers = 0;
        if program.multicast_go {
            num_workers += self
                .topology
                .num_worker_cores(ProgrammableCoreType::Tensix, program.sub_device);
        }
        if program.unicast_go {
            num_workers += self
                .topology
                .num_worker_cores(ProgrammableCoreType::ActiveEth, program.sub_device);
        }

        let channel = self.host_state.channel_mut(program.sub_device);
        channel.launch_program(
            num_workers,
            program.multicast_go,
            program.unicast_go,
            &program.kernel_config_sizes,
        )?;

        let sysmem_manager_coord = program.device_range.start_coord().clone();
        let offset = grid
            .device_mut(&sysmem_manager_coord)?
            .sysmem_mut()
            .write_bypass(&program.commands, self.cq_id);
        capture.staging.push(MeshTraceStagingMetadata {
            device_range: program.device_range.clone(),
            sysmem_manager_coord,
            offset,
            size: program.commands.len(),
        });
        let desc = capture.descriptor.descriptor_mut(program.sub_device);
        desc.num_completion_worker_cores = channel.expected_completions;
        desc.num_traced_programs_needing_go_signal_multicast += u32::from(program.multicast_go);
        desc.num_traced_programs_needing_go_signal_unicast += u32::from(program.unicast_go);
        debug!(
            "Trace {}: {}B for {} on {}",
            capture.trace_id,
            program.commands.len(),
            program.device_range,
            program.sub_device
        );
        Ok(())
    }

    /// Close the capture of `trace_id` and assemble its descriptor
    ///
    /// Bypass mode is switched off and dispatch state restored even when
    /// assembly fails.
    ///
    /// # Errors
    ///
    /// Returns error if no capture of `trace_id` is open or a staging record
    /// is inconsistent with the captured bytes.
    pub(crate) fn record_end(
        &mut self,
        trace_id: MeshTraceId,
        grid: &mut DeviceGrid,
        dispatch: &DispatchConfig,
    ) -> Result<MeshTraceDescriptor> {
        let capture = match self.capture.take() {
            Some(capture) if capture.trace_id == trace_id => capture,
            Some(other) => {
                let err = TraceError::CaptureInProgress {
                    cq_id: self.cq_id,
                    trace_id: other.trace_id.get(),
                };
                self.capture = Some(other);
                return Err(err);
            }
            None => return Err(TraceError::NoActiveCapture { cq_id: self.cq_id }),
        };

        let TraceCapture {
            mut descriptor,
            staging,
            ..
        } = capture;
        let shape: MeshShape = grid.shape().clone();
        let assembled = descriptor.assemble_dispatch_commands(
            &mut grid.bypass(self.cq_id),
            &staging,
            &shape,
            dispatch.host_alignment,
        );

        grid.set_bypass_mode(false, self.cq_id);
        self.host_state.restore(self.topology.num_sub_devices());
        self.host_state.discard_shadow();
        assembled?;

        info!(
            "Trace {trace_id} captured: {} programs, {}B over {} range(s)",
            staging.len(),
            descriptor.total_trace_size(),
            descriptor.ordered_trace_data().len()
        );
        Ok(descriptor)
    }

    /// Replay a materialized trace on every chip
    ///
    /// Each chip gets the same replay command, built against the dispatch
    /// state before the replay; afterwards that state is advanced to what
    /// the trace leaves behind.
    ///
    /// # Errors
    ///
    /// Returns error if a capture is open on this queue or a chip's issue
    /// queue cannot take the command.
    pub(crate) fn enqueue_trace(
        &mut self,
        md: &TraceDispatchMetadata,
        grid: &mut DeviceGrid,
        dispatch: &DispatchConfig,
    ) -> Result<()> {
        self.ensure_idle()?;
        let cq_id = self.cq_id;
        let expected = self.host_state.expected_completions();
        let mut tasks = DeviceTasks::new(grid.num_devices());
        for index in 0..grid.num_devices() {
            let expected = &expected;
            tasks.push_work(index, move |device| {
                let dispatch_core = device.properties().dispatch_core;
                let (sysmem, topology) = device.dispatch_parts();
                issue_trace_commands(sysmem, topology, dispatch, dispatch_core, md, cq_id, expected)
            });
        }
        grid.synchronize(tasks)?;
        self.host_state.apply_post_trace(&md.trace_worker_descriptors);
        Ok(())
    }
}

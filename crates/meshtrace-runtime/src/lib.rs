//! Trace capture, mesh-trace assembly and replay dispatch for accelerator meshes.
//!
//! A trace is a recorded sequence of program launches. Capturing one on a
//! mesh produces, for every disjoint range of chips, the exact command
//! bytes those chips saw; the bytes are written once into a resident trace
//! buffer and can then be replayed with a single short command per chip.
//!
//! # Pipeline
//!
//! ```text
//! record_begin        save dispatch state, divert this queue's commands to bypass
//!     │
//! traced programs     bytes -> first chip's bypass, staging record kept
//!     │
//! record_end          fold staging records into disjoint ranges,
//!     │               append end marker, restore dispatch state
//!     │
//! materialize         pick page size, allocate replicated trace buffer,
//!     │               write each range's blob to exactly its chips
//!     │
//! replay              notify, go signals, waits, exec_buf per chip;
//!                     advance dispatch state past the trace
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use bytes::Bytes;
//! use meshtrace_hw::mesh::MeshCoordinateRange;
//! use meshtrace_runtime::{MeshConfig, MeshDevice, SubDeviceId, TracedProgram};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut mesh = MeshDevice::create(&MeshConfig::from_env()?)?;
//! let trace_id = mesh.next_trace_id();
//!
//! mesh.begin_mesh_trace(0, trace_id)?;
//! let all = MeshCoordinateRange::from_shape(mesh.shape());
//! mesh.enqueue_traced_program(0, &TracedProgram::new(all, SubDeviceId(0), Bytes::from(vec![0u8; 64])))?;
//! mesh.end_mesh_trace(0, trace_id)?;
//!
//! mesh.replay_mesh_trace(0, trace_id)?;
//! mesh.release_mesh_trace(trace_id)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Trace buffer page sizes
//!
//! | Trace bytes | Banks | Page | Waste |
//! |-------------|-------|------|-------|
//! | 10,000 | 8 | 2048 | 6,384 |
//! | 4,096 | 4 | 1024 | 0 |
//! | 40,000 | 12 | 4096 | 9,152 |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod allocator;
mod buffer;
mod command;
mod command_queue;
mod config;
mod device;
mod dispatch_state;
mod error;
mod grid;
mod mesh_device;
pub mod mesh_trace;
mod sysmem;
mod topology;
pub mod trace_dispatch;
mod worker;

pub use allocator::TraceRegionAllocator;
pub use buffer::{
    BufferRegion, BufferType, DeviceLocalBufferConfig, MeshBuffer, ReplicatedBufferConfig,
    TensorMemoryLayout,
};
pub use command::{parse_commands, relayed_cmd_size, CommandRecord, DeviceCommand};
pub use command_queue::{MeshCommandQueue, TracedProgram};
pub use config::{DispatchConfig, KernelConfigArea, MeshConfig};
pub use device::{Device, DeviceProperties};
pub use dispatch_state::{
    ConfigBufferReservation, ConfigBufferSync, DispatchChannelState, HostDispatchState,
    LaunchMessageRingBufferState, WorkerConfigBufferMgr,
};
pub use error::{Result, TraceError};
pub use grid::{DeviceGrid, QueueBypass};
pub use mesh_device::MeshDevice;
pub use mesh_trace::{
    MeshTraceBuffer, MeshTraceData, MeshTraceDescriptor, MeshTraceId, MeshTraceStagingMetadata,
    TraceIdAllocator,
};
pub use sysmem::{IssuedCommand, SystemMemoryManager};
pub use topology::{CoreCoord, SubDeviceId, SubDeviceManager, SubDeviceTopology, WorkerTopology};
pub use trace_dispatch::{TraceDispatchMetadata, TraceWorkerDescriptor};
pub use worker::{DeviceTask, DeviceTasks, DeviceWorkerPool};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        DispatchConfig, MeshConfig, MeshDevice, MeshTraceDescriptor, MeshTraceId, Result,
        SubDeviceId, TraceError, TracedProgram,
    };
}

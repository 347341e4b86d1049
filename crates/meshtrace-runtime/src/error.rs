//! Error types for mesh trace operations

use thiserror::Error;

/// Result type alias for mesh trace operations
pub type Result<T> = std::result::Result<T, TraceError>;

/// Errors that can occur while capturing, materializing or replaying a trace
///
/// Every variant is terminal for the operation that raised it. Nothing in
/// this crate retries.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Trace buffers would outgrow the configured trace region
    #[error(
        "Creating trace buffers of size {requested}B on mesh {mesh_id}, but only {region_size}B is allocated for trace region"
    )]
    TraceRegionExhausted {
        /// Mesh that owns the region
        mesh_id: u32,
        /// Total trace buffer bytes after the failed allocation
        requested: u64,
        /// Configured trace region capacity
        region_size: u64,
    },

    /// A trace id was registered twice
    #[error("Trace buffer with id {trace_id} already exists")]
    DuplicateTraceId {
        /// Offending id
        trace_id: u32,
    },

    /// Lookup of an unknown trace id
    #[error("Trace instance with id {trace_id} is not initialized")]
    TraceNotFound {
        /// Requested id
        trace_id: u32,
    },

    /// Replay of a trace whose buffer was never written
    #[error("Trace {trace_id} has no device buffer (capture not ended?)")]
    TraceNotMaterialized {
        /// Requested id
        trace_id: u32,
    },

    /// A property expected to be identical across the mesh differs
    #[error("Device at index {index} returned {property} = {actual}, expected {expected}")]
    DeviceMismatch {
        /// Property being compared
        property: &'static str,
        /// Index of the diverging device
        index: usize,
        /// Value reported by the first device
        expected: String,
        /// Value reported by the diverging device
        actual: String,
    },

    /// Mesh has no devices
    #[error("Mesh has no devices")]
    EmptyMesh,

    /// A capture is already recording on this command queue
    #[error("Trace capture of {trace_id} already in progress on command queue {cq_id}")]
    CaptureInProgress {
        /// Command queue
        cq_id: u8,
        /// Trace being recorded
        trace_id: u32,
    },

    /// Capture-only operation without an active capture
    #[error("No trace capture in progress on command queue {cq_id}")]
    NoActiveCapture {
        /// Command queue
        cq_id: u8,
    },

    /// Staging window points past the captured bytes
    #[error("Staging window {offset}+{size} exceeds {available} captured bytes on device {coord}")]
    StagingOutOfBounds {
        /// Device holding the bypass data
        coord: String,
        /// Window start
        offset: usize,
        /// Window length
        size: usize,
        /// Bytes captured on that device
        available: usize,
    },

    /// Index or coordinate outside its valid range
    #[error("{what} {value} out of range ({limit})")]
    OutOfRange {
        /// Kind of index
        what: &'static str,
        /// Offending value
        value: String,
        /// Valid range description
        limit: String,
    },

    /// Buffer write outside the buffer
    #[error("Write of {size}B at offset {offset} exceeds buffer of {buffer_size}B")]
    WriteOutOfBounds {
        /// Write offset
        offset: u64,
        /// Write length
        size: u64,
        /// Buffer size
        buffer_size: u64,
    },

    /// Command sequence larger than the issue queue
    #[error("Issue queue of {capacity}B cannot hold a {requested}B command sequence")]
    IssueQueueFull {
        /// Requested bytes
        requested: usize,
        /// Queue capacity
        capacity: usize,
    },

    /// A per-device worker panicked while running its tasks
    #[error("Worker for device {device} panicked")]
    WorkerPanicked {
        /// Device index
        device: usize,
    },

    /// Worker pool could not be built
    #[error("Failed to start device worker pool: {reason}")]
    WorkerPool {
        /// Reason reported by the thread pool builder
        reason: String,
    },

    /// Configuration rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason for rejection
        reason: String,
    },
}

impl TraceError {
    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an out-of-range error
    pub fn out_of_range(what: &'static str, value: impl ToString, limit: impl ToString) -> Self {
        Self::OutOfRange {
            what,
            value: value.to_string(),
            limit: limit.to_string(),
        }
    }

    /// Create a cross-device mismatch error
    pub fn device_mismatch(
        property: &'static str,
        index: usize,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::DeviceMismatch {
            property,
            index,
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

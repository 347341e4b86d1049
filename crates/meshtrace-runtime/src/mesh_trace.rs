//! Mesh trace assembly and materialization
//!
//! During capture every traced program writes its command bytes into the
//! bypass buffer of the first chip of its target range, and a staging
//! record remembers `(range, chip, offset, size)`. At the end of capture
//! [`MeshTraceDescriptor::assemble_dispatch_commands`] folds those records
//! into a list of disjoint ranges, each with the exact command history of
//! the chips it covers:
//!
//! ```text
//! A -> [(0,0)..(1,1)]          B -> [(0,0)..(0,0)]
//!
//! after A:  [(0,0)..(1,1)] = A
//! after B:  [(1,0)..(1,1)] = A
//!           [(0,1)..(0,1)] = A
//!           [(0,0)..(0,0)] = A B
//! ```
//!
//! While folding, an entry only collects slices of the captured bytes;
//! [`MeshTraceDescriptor::finalize`] terminates every entry and joins each
//! one into a single blob. Chips that no record touched get an entry
//! holding just the end marker, so every chip's buffer is terminated.
//!
//! [`populate_mesh_buffer`] then lays each entry out page aligned in a
//! replicated trace buffer and writes it to exactly its sub-grid.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Bytes, BytesMut};
use meshtrace_hw::align_up;
use meshtrace_hw::mesh::{subtract, MeshCoordinate, MeshCoordinateRange, MeshCoordinateRangeSet, MeshShape};
use tracing::{debug, info};

use crate::buffer::{
    BufferRegion, BufferType, DeviceLocalBufferConfig, MeshBuffer, ReplicatedBufferConfig,
    TensorMemoryLayout,
};
use crate::command::{relayed_cmd_size, DeviceCommand};
use crate::config::DispatchConfig;
use crate::error::{Result, TraceError};
use crate::mesh_device::MeshDevice;
use crate::topology::SubDeviceId;
use crate::trace_dispatch::{
    compute_interleaved_trace_buf_page_size, compute_trace_cmd_size, TraceDispatchMetadata,
    TraceWorkerDescriptor,
};
use crate::worker::DeviceTasks;

/// Identifier of a mesh trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshTraceId(u32);

impl MeshTraceId {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MeshTraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out increasing trace ids
///
/// One allocator per process (or per test); ids are never reused.
#[derive(Debug, Default)]
pub struct TraceIdAllocator {
    next: AtomicU32,
}

impl TraceIdAllocator {
    /// Allocator whose first id is 0
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    /// Allocator whose first id is `first`
    #[must_use]
    pub const fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Next unused id
    pub fn next_id(&self) -> MeshTraceId {
        MeshTraceId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where one traced program's commands were captured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshTraceStagingMetadata {
    /// Chips the program runs on
    pub device_range: MeshCoordinateRange,
    /// Chip whose bypass buffer holds the bytes
    pub sysmem_manager_coord: MeshCoordinate,
    /// Start of the bytes in that buffer
    pub offset: usize,
    /// Length of the bytes
    pub size: usize,
}

/// Commands for one disjoint range of chips
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshTraceData {
    /// Chips this entry is written to
    pub device_range: MeshCoordinateRange,
    /// Their command history, in capture order
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingTraceData {
    device_range: MeshCoordinateRange,
    chunks: Vec<Bytes>,
}

impl PendingTraceData {
    fn appended(&self, device_range: MeshCoordinateRange, cmds: &Bytes) -> Self {
        let mut chunks = Vec::with_capacity(self.chunks.len() + 1);
        chunks.extend(self.chunks.iter().cloned());
        chunks.push(cmds.clone());
        Self {
            device_range,
            chunks,
        }
    }

    fn freeze(self) -> MeshTraceData {
        let mut data = BytesMut::with_capacity(self.chunks.iter().map(Bytes::len).sum());
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }
        MeshTraceData {
            device_range: self.device_range,
            data: data.freeze(),
        }
    }
}

/// Source of captured bytes, keyed by chip
pub trait BypassSource {
    /// Move the captured bytes of the chip at `coord` out of its bypass buffer
    ///
    /// # Errors
    ///
    /// Returns error if no chip sits at `coord`.
    fn take_bypass_data(&mut self, coord: &MeshCoordinate) -> Result<Bytes>;
}

/// Assembled trace: disjoint per-range command blobs plus sub-device summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshTraceDescriptor {
    descriptors: BTreeMap<SubDeviceId, TraceWorkerDescriptor>,
    pending: Vec<PendingTraceData>,
    ordered_trace_data: Vec<MeshTraceData>,
    total_trace_size: usize,
    sub_device_ids: Vec<SubDeviceId>,
}

impl MeshTraceDescriptor {
    /// Empty descriptor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disjoint entries, in assembly order
    ///
    /// Empty until [`finalize`](Self::finalize).
    #[must_use]
    pub fn ordered_trace_data(&self) -> &[MeshTraceData] {
        &self.ordered_trace_data
    }

    /// Captured bytes plus one end marker
    #[must_use]
    pub const fn total_trace_size(&self) -> usize {
        self.total_trace_size
    }

    /// Sub-devices the trace touches, ascending
    #[must_use]
    pub fn sub_device_ids(&self) -> &[SubDeviceId] {
        &self.sub_device_ids
    }

    /// Per-sub-device summary
    #[must_use]
    pub const fn descriptors(&self) -> &BTreeMap<SubDeviceId, TraceWorkerDescriptor> {
        &self.descriptors
    }

    /// Summary for `sub_device`, created empty on first use
    pub fn descriptor_mut(&mut self, sub_device: SubDeviceId) -> &mut TraceWorkerDescriptor {
        self.descriptors.entry(sub_device).or_default()
    }

    /// Merge one captured record into the entry list
    ///
    /// Entries whose range lies inside `device_range` get `cmds` appended.
    /// Entries only partly covered are split into the uncovered pieces,
    /// which keep their old bytes, and the covered piece, which gets old
    /// bytes plus `cmds`. Chips of `device_range` that no entry covered yet
    /// get a fresh entry holding `cmds`.
    ///
    /// Appending shares `cmds` rather than copying the entry.
    pub fn fold(&mut self, device_range: &MeshCoordinateRange, cmds: Bytes) {
        let mut uncovered = MeshCoordinateRangeSet::from(device_range.clone());
        let mut split_entries = Vec::new();
        let mut replaced = Vec::new();

        for (index, entry) in self.pending.iter_mut().enumerate() {
            let Some(intersection) = entry.device_range.intersection(device_range) else {
                continue;
            };
            uncovered = uncovered.subtract_range(&intersection);
            if intersection == entry.device_range {
                entry.chunks.push(cmds.clone());
                continue;
            }
            for complement in subtract(&entry.device_range, &intersection).into_ranges() {
                split_entries.push(PendingTraceData {
                    device_range: complement,
                    chunks: entry.chunks.clone(),
                });
            }
            debug!(
                "Splitting {} at {intersection}",
                entry.device_range
            );
            split_entries.push(entry.appended(intersection, &cmds));
            replaced.push(index);
        }

        if !split_entries.is_empty() {
            let kept = std::mem::take(&mut self.pending)
                .into_iter()
                .enumerate()
                .filter(|(index, _)| !replaced.contains(index))
                .map(|(_, entry)| entry);
            split_entries.extend(kept);
            self.pending = split_entries;
        }

        for range in uncovered.into_ranges() {
            self.pending.push(PendingTraceData {
                device_range: range,
                chunks: vec![cmds.clone()],
            });
        }
        self.total_trace_size += cmds.len();
    }

    /// Terminate every entry with the end-of-buffer marker and join it
    ///
    /// Chips of `mesh_range` outside every entry get an entry of their own
    /// holding only the marker. The marker is counted once in the total
    /// size.
    pub fn finalize(&mut self, mesh_range: &MeshCoordinateRange, exec_buf_end: &Bytes) {
        let mut uncovered = MeshCoordinateRangeSet::from(mesh_range.clone());
        for entry in &mut self.pending {
            if let Some(intersection) = entry.device_range.intersection(mesh_range) {
                uncovered = uncovered.subtract_range(&intersection);
                entry.chunks.push(exec_buf_end.clone());
            }
        }
        for range in uncovered.into_ranges() {
            debug!("{range} has no traced programs, terminating it empty");
            self.pending.push(PendingTraceData {
                device_range: range,
                chunks: vec![exec_buf_end.clone()],
            });
        }
        self.ordered_trace_data
            .extend(self.pending.drain(..).map(PendingTraceData::freeze));
        self.total_trace_size += exec_buf_end.len();
        self.sub_device_ids = self.descriptors.keys().copied().collect();
    }

    /// Fold every staged record, in order, then terminate the trace
    ///
    /// Bytes are moved out of each chip's bypass buffer on first use.
    ///
    /// # Errors
    ///
    /// Returns error if a record names an unknown chip or points past the
    /// bytes captured on it.
    pub fn assemble_dispatch_commands<S: BypassSource + ?Sized>(
        &mut self,
        source: &mut S,
        staging: &[MeshTraceStagingMetadata],
        mesh_shape: &MeshShape,
        host_alignment: u32,
    ) -> Result<()> {
        let mut bypass: HashMap<MeshCoordinate, Bytes> = HashMap::new();
        for md in staging {
            if !bypass.contains_key(&md.sysmem_manager_coord) {
                let data = source.take_bypass_data(&md.sysmem_manager_coord)?;
                bypass.insert(md.sysmem_manager_coord.clone(), data);
            }
            let data = &bypass[&md.sysmem_manager_coord];
            let end = md
                .offset
                .checked_add(md.size)
                .filter(|&end| end <= data.len())
                .ok_or_else(|| TraceError::StagingOutOfBounds {
                    coord: md.sysmem_manager_coord.to_string(),
                    offset: md.offset,
                    size: md.size,
                    available: data.len(),
                })?;
            let cmds = data.slice(md.offset..end);
            debug!("Folding {}B for {}", cmds.len(), md.device_range);
            self.fold(&md.device_range, cmds);
        }
        self.finalize(
            &MeshCoordinateRange::from_shape(mesh_shape),
            &exec_buf_end_marker(host_alignment),
        );
        Ok(())
    }
}

/// The command that ends a resident trace buffer
#[must_use]
pub fn exec_buf_end_marker(host_alignment: u32) -> Bytes {
    let mut command = DeviceCommand::new(relayed_cmd_size(host_alignment) as usize, host_alignment);
    command.add_prefetch_exec_buf_end();
    command.freeze()
}

/// A captured trace and, once materialized, its device buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshTraceBuffer {
    trace_id: MeshTraceId,
    desc: MeshTraceDescriptor,
    mesh_buffer: Option<MeshBuffer>,
}

impl MeshTraceBuffer {
    /// Trace with an empty descriptor and no buffer
    #[must_use]
    pub fn new(trace_id: MeshTraceId) -> Self {
        Self {
            trace_id,
            desc: MeshTraceDescriptor::new(),
            mesh_buffer: None,
        }
    }

    /// Trace whose descriptor was written to `mesh_buffer`
    #[must_use]
    pub const fn materialized(
        trace_id: MeshTraceId,
        desc: MeshTraceDescriptor,
        mesh_buffer: MeshBuffer,
    ) -> Self {
        Self {
            trace_id,
            desc,
            mesh_buffer: Some(mesh_buffer),
        }
    }

    /// Trace id
    #[must_use]
    pub const fn trace_id(&self) -> MeshTraceId {
        self.trace_id
    }

    /// Assembled descriptor
    #[must_use]
    pub const fn desc(&self) -> &MeshTraceDescriptor {
        &self.desc
    }

    /// Device buffer, if materialized
    #[must_use]
    pub const fn mesh_buffer(&self) -> Option<&MeshBuffer> {
        self.mesh_buffer.as_ref()
    }

    /// Replay parameters for this trace
    ///
    /// # Errors
    ///
    /// Returns error if the trace has no buffer, or its address or page
    /// count does not fit the replay command.
    pub fn dispatch_metadata(&self, dispatch: &DispatchConfig) -> Result<TraceDispatchMetadata> {
        let buffer = self
            .mesh_buffer
            .as_ref()
            .ok_or(TraceError::TraceNotMaterialized {
                trace_id: self.trace_id.get(),
            })?;
        let trace_buffer_address = u32::try_from(buffer.address())
            .map_err(|_| TraceError::out_of_range("trace buffer address", buffer.address(), u32::MAX))?;
        let trace_buffer_num_pages = u32::try_from(buffer.num_pages())
            .map_err(|_| TraceError::out_of_range("trace buffer pages", buffer.num_pages(), u32::MAX))?;
        Ok(TraceDispatchMetadata {
            cmd_sequence_size: compute_trace_cmd_size(self.desc.sub_device_ids.len(), dispatch),
            trace_worker_descriptors: self.desc.descriptors.clone(),
            sub_device_ids: self.desc.sub_device_ids.clone(),
            trace_buffer_address,
            trace_buffer_page_size: buffer.page_size(),
            trace_buffer_num_pages,
        })
    }
}

/// Allocate a replicated trace buffer on `mesh` and write `desc` into it
///
/// Each entry is zero padded to a whole page and written to the chips of
/// its range; entries sharing a range are laid out back to back.
///
/// # Errors
///
/// Returns error if chips disagree on their bank count, the trace region
/// is too small, or a write fails.
pub fn populate_mesh_buffer(mesh: &mut MeshDevice, desc: &MeshTraceDescriptor) -> Result<MeshBuffer> {
    let unpadded = desc.total_trace_size() as u64;
    let num_banks = mesh.num_dram_banks()?;
    let page_size = compute_interleaved_trace_buf_page_size(unpadded, num_banks);
    let padded = align_up(unpadded, u64::from(page_size));

    let buffer = mesh.create_replicated_buffer(
        ReplicatedBufferConfig { size: padded },
        DeviceLocalBufferConfig {
            page_size,
            buffer_type: BufferType::Trace,
            buffer_layout: TensorMemoryLayout::Interleaved,
        },
    )?;
    info!(
        "Trace buffer on mesh {}: {padded}B ({unpadded}B used) at {:#x}, page {page_size}B",
        mesh.id(),
        buffer.address()
    );

    if let Err(e) = write_trace_entries(mesh, desc, &buffer) {
        mesh.deallocate_buffer(&buffer);
        return Err(e);
    }
    Ok(buffer)
}

#[allow(clippy::cast_possible_truncation)]
fn write_trace_entries(mesh: &mut MeshDevice, desc: &MeshTraceDescriptor, buffer: &MeshBuffer) -> Result<()> {
    let page_size = u64::from(buffer.page_size());
    let mut write_offsets: HashMap<&MeshCoordinateRange, u64> = HashMap::new();
    let mut tasks = DeviceTasks::new(mesh.num_devices());
    for entry in desc.ordered_trace_data() {
        let offset = write_offsets.entry(&entry.device_range).or_insert(0);
        let write_size = align_up(entry.data.len() as u64, page_size);
        let mut padded = BytesMut::with_capacity(write_size as usize);
        padded.extend_from_slice(&entry.data);
        padded.resize(write_size as usize, 0);
        debug!(
            "{}: {write_size}B at offset {}",
            entry.device_range, *offset
        );
        mesh.grid().stage_shard_write(
            &mut tasks,
            buffer,
            padded.freeze(),
            &entry.device_range,
            BufferRegion::new(*offset, write_size),
        )?;
        *offset += write_size;
    }
    mesh.grid_mut().synchronize(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(c: &[u32]) -> MeshCoordinate {
        MeshCoordinate::new(c.to_vec())
    }

    fn range(s: &[u32], e: &[u32]) -> MeshCoordinateRange {
        MeshCoordinateRange::new(coord(s), coord(e))
    }

    fn bytes(b: &[u8]) -> Bytes {
        Bytes::copy_from_slice(b)
    }

    /// Terminate with an empty marker so entries hold just the folded bytes
    fn finish(mut desc: MeshTraceDescriptor, shape: [u32; 2]) -> MeshTraceDescriptor {
        desc.finalize(&MeshCoordinateRange::from_shape(&MeshShape::new(shape)), &Bytes::new());
        desc
    }

    fn entry_for<'a>(desc: &'a MeshTraceDescriptor, c: &MeshCoordinate) -> Option<&'a MeshTraceData> {
        desc.ordered_trace_data()
            .iter()
            .find(|e| e.device_range.contains(c))
    }

    #[test]
    fn test_identical_ranges_concatenate() {
        let mut desc = MeshTraceDescriptor::new();
        let r = range(&[0, 0], &[0, 0]);
        desc.fold(&r, bytes(&[1, 2]));
        desc.fold(&r, bytes(&[3]));
        assert!(desc.ordered_trace_data().is_empty());
        let desc = finish(desc, [1, 1]);
        assert_eq!(desc.ordered_trace_data().len(), 1);
        assert_eq!(&desc.ordered_trace_data()[0].data[..], &[1, 2, 3]);
        assert_eq!(desc.total_trace_size(), 3);
    }

    #[test]
    fn test_partial_overlap_splits_entry() {
        let mut desc = MeshTraceDescriptor::new();
        desc.fold(&range(&[0, 0], &[1, 1]), bytes(&[0xA]));
        desc.fold(&range(&[0, 0], &[0, 0]), bytes(&[0xB]));

        let desc = finish(desc, [2, 2]);
        let entries = desc.ordered_trace_data();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.iter().map(|e| e.device_range.num_coords()).sum::<usize>(), 4);
        assert_eq!(&entry_for(&desc, &coord(&[0, 0])).unwrap().data[..], &[0xA, 0xB]);
        for c in [[1, 0], [0, 1], [1, 1]] {
            assert_eq!(&entry_for(&desc, &coord(&c)).unwrap().data[..], &[0xA]);
        }
    }

    #[test]
    fn test_disjoint_records_append_entries() {
        let mut desc = MeshTraceDescriptor::new();
        desc.fold(&range(&[0, 0], &[0, 3]), bytes(&[1]));
        desc.fold(&range(&[1, 0], &[1, 3]), bytes(&[2]));
        let desc = finish(desc, [2, 4]);
        assert_eq!(desc.ordered_trace_data().len(), 2);
        assert_eq!(desc.ordered_trace_data()[1].device_range, range(&[1, 0], &[1, 3]));
    }

    #[test]
    fn test_record_covering_entry_and_more() {
        let mut desc = MeshTraceDescriptor::new();
        desc.fold(&range(&[0, 0], &[0, 0]), bytes(&[1]));
        desc.fold(&range(&[0, 0], &[0, 1]), bytes(&[2]));
        let desc = finish(desc, [1, 2]);
        assert_eq!(&entry_for(&desc, &coord(&[0, 0])).unwrap().data[..], &[1, 2]);
        assert_eq!(&entry_for(&desc, &coord(&[0, 1])).unwrap().data[..], &[2]);
        assert_eq!(desc.ordered_trace_data().len(), 2);
    }

    #[test]
    fn test_finalize_appends_marker_and_counts_once() {
        let marker = exec_buf_end_marker(64);
        assert_eq!(marker.len(), 64);

        let mut desc = MeshTraceDescriptor::new();
        desc.fold(&range(&[0, 0], &[0, 1]), bytes(&[1; 10]));
        desc.fold(&range(&[0, 0], &[0, 0]), bytes(&[2; 6]));
        desc.descriptor_mut(SubDeviceId(1)).num_completion_worker_cores = 5;
        desc.descriptor_mut(SubDeviceId(0)).num_completion_worker_cores = 9;
        desc.finalize(&MeshCoordinateRange::from_shape(&MeshShape::new([2, 2])), &marker);

        assert_eq!(desc.total_trace_size(), 10 + 6 + 64);
        for entry in desc.ordered_trace_data() {
            assert!(entry.data.ends_with(&marker));
        }
        // Row 1 saw no programs and holds only the marker.
        assert_eq!(entry_for(&desc, &coord(&[1, 1])).unwrap().data, marker);
        assert_eq!(desc.ordered_trace_data().len(), 3);
        assert_eq!(desc.sub_device_ids(), &[SubDeviceId(0), SubDeviceId(1)]);
    }

    struct FakeBypass(HashMap<MeshCoordinate, Bytes>);

    impl BypassSource for FakeBypass {
        fn take_bypass_data(&mut self, coord: &MeshCoordinate) -> Result<Bytes> {
            self.0
                .remove(coord)
                .ok_or_else(|| TraceError::out_of_range("coordinate", coord, "mesh"))
        }
    }

    #[test]
    fn test_assemble_slices_staging_windows() {
        let mut source = FakeBypass(HashMap::from([(coord(&[0, 0]), bytes(&[1, 2, 3, 4, 5]))]));
        let staging = [
            MeshTraceStagingMetadata {
                device_range: range(&[0, 0], &[0, 1]),
                sysmem_manager_coord: coord(&[0, 0]),
                offset: 0,
                size: 2,
            },
            MeshTraceStagingMetadata {
                device_range: range(&[0, 1], &[0, 1]),
                sysmem_manager_coord: coord(&[0, 0]),
                offset: 2,
                size: 3,
            },
        ];
        let mut desc = MeshTraceDescriptor::new();
        desc.assemble_dispatch_commands(&mut source, &staging, &MeshShape::new([1, 2]), 32)
            .unwrap();
        let marker = exec_buf_end_marker(32);
        assert_eq!(desc.total_trace_size(), 5 + marker.len());
        let d01 = &entry_for(&desc, &coord(&[0, 1])).unwrap().data;
        assert_eq!(&d01[..5], &[1, 2, 3, 4, 5]);
        let d00 = &entry_for(&desc, &coord(&[0, 0])).unwrap().data;
        assert_eq!(&d00[..2], &[1, 2]);
        assert_eq!(d00.len(), 2 + marker.len());
    }

    #[test]
    fn test_assemble_rejects_window_past_capture() {
        let mut source = FakeBypass(HashMap::from([(coord(&[0, 0]), bytes(&[1, 2]))]));
        let staging = [MeshTraceStagingMetadata {
            device_range: range(&[0, 0], &[0, 0]),
            sysmem_manager_coord: coord(&[0, 0]),
            offset: 1,
            size: 2,
        }];
        let err = MeshTraceDescriptor::new()
            .assemble_dispatch_commands(&mut source, &staging, &MeshShape::new([1, 1]), 32)
            .unwrap_err();
        assert!(matches!(err, TraceError::StagingOutOfBounds { available: 2, .. }));
    }

    #[test]
    fn test_long_append_chain_keeps_every_record() {
        let mut desc = MeshTraceDescriptor::new();
        let whole = range(&[0, 0], &[1, 3]);
        for i in 0..1000u16 {
            desc.fold(&whole, Bytes::copy_from_slice(&i.to_le_bytes()));
        }
        assert_eq!(desc.pending.len(), 1);
        assert_eq!(desc.pending[0].chunks.len(), 1000);
        let desc = finish(desc, [2, 4]);
        let data = &desc.ordered_trace_data()[0].data;
        assert_eq!(data.len(), 2000);
        assert_eq!(&data[1998..], &999u16.to_le_bytes());
    }

    #[test]
    fn test_trace_ids_increase() {
        let ids = TraceIdAllocator::starting_at(5);
        assert_eq!(ids.next_id(), MeshTraceId::new(5));
        assert_eq!(ids.next_id().get(), 6);
        assert_eq!(TraceIdAllocator::new().next_id().get(), 0);
    }

    #[test]
    fn test_unmaterialized_trace_has_no_metadata() {
        let trace = MeshTraceBuffer::new(MeshTraceId::new(3));
        assert!(matches!(
            trace.dispatch_metadata(&DispatchConfig::default()),
            Err(TraceError::TraceNotMaterialized { trace_id: 3 })
        ));
    }
}

//! Host-side dispatch synchronization state
//!
//! The host dispatcher tracks three things per sub-device (dispatch
//! channel):
//!
//! - how many worker completions it expects before the next wait
//! - where the next launch message goes in the workers' launch ring
//! - which parts of the kernel-config scratch area are still in use
//!
//! A trace replays on-device with its own assumptions about all three, so
//! capture swaps the live state out ([`HostDispatchState::save_and_reset`]),
//! records against a zeroed state, and swaps it back
//! ([`HostDispatchState::restore`]). After a replay the live state is moved
//! forward to what the trace leaves behind
//! ([`HostDispatchState::apply_post_trace`]).

use std::collections::{BTreeMap, VecDeque};

use meshtrace_hw::memmap::DISPATCH_MESSAGE_ENTRIES;
use tracing::{debug, warn};

use crate::config::KernelConfigArea;
use crate::error::{Result, TraceError};
use crate::topology::SubDeviceId;
use crate::trace_dispatch::TraceWorkerDescriptor;

/// Write pointers into the workers' launch message ring
///
/// Multicast (Tensix) and unicast (Ethernet) launches occupy separate rings
/// of the same size. Pointers wrap modulo the ring size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchMessageRingBufferState {
    num_entries: u32,
    mcast_wptr: u32,
    unicast_wptr: u32,
    generation: u32,
}

impl LaunchMessageRingBufferState {
    /// Ring of `num_entries` slots, both pointers at zero
    ///
    /// # Panics
    ///
    /// Panics if `num_entries` is not a power of two.
    #[must_use]
    pub const fn new(num_entries: u32) -> Self {
        assert!(num_entries.is_power_of_two(), "launch ring size must be a power of two");
        Self {
            num_entries,
            mcast_wptr: 0,
            unicast_wptr: 0,
            generation: 0,
        }
    }

    /// Ring size
    #[must_use]
    pub const fn num_entries(&self) -> u32 {
        self.num_entries
    }

    /// Next multicast slot
    #[must_use]
    pub const fn mcast_wptr(&self) -> u32 {
        self.mcast_wptr
    }

    /// Next unicast slot
    #[must_use]
    pub const fn unicast_wptr(&self) -> u32 {
        self.unicast_wptr
    }

    /// Number of resets seen
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    const fn wrap(&self, value: u32) -> u32 {
        value & (self.num_entries - 1)
    }

    /// Advance the multicast pointer by `n` launches
    pub fn inc_mcast_wptr(&mut self, n: u32) {
        self.mcast_wptr = self.wrap(self.mcast_wptr.wrapping_add(n));
    }

    /// Advance the unicast pointer by `n` launches
    pub fn inc_unicast_wptr(&mut self, n: u32) {
        self.unicast_wptr = self.wrap(self.unicast_wptr.wrapping_add(n));
    }

    /// Place the multicast pointer at `value`
    pub fn set_mcast_wptr(&mut self, value: u32) {
        self.mcast_wptr = self.wrap(value);
    }

    /// Place the unicast pointer at `value`
    pub fn set_unicast_wptr(&mut self, value: u32) {
        self.unicast_wptr = self.wrap(value);
    }

    /// Both pointers back to slot zero, new generation
    pub fn reset(&mut self) {
        self.mcast_wptr = 0;
        self.unicast_wptr = 0;
        self.generation = self.generation.wrapping_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ConfigBufferEntry {
    addr: u32,
    size: u32,
    sync_count: u32,
}

impl ConfigBufferEntry {
    const fn overlaps(&self, addr: u32, size: u32) -> bool {
        addr < self.addr + self.size && self.addr < addr + size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigRing {
    base: u32,
    size: u32,
    next: u32,
    entries: VecDeque<ConfigBufferEntry>,
}

impl ConfigRing {
    fn placement(&self, size: u32) -> u32 {
        if self.next + size > self.base + self.size {
            self.base
        } else {
            self.next
        }
    }
}

/// Completion count the dispatcher must reach before a reservation is safe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigBufferSync {
    /// The reservation overlaps in-flight data
    pub need_sync: bool,
    /// Completion count that frees every overlapped entry
    pub sync_count: u32,
}

/// Result of [`WorkerConfigBufferMgr::reserve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBufferReservation {
    /// Wait needed before writing
    pub sync: ConfigBufferSync,
    /// Address per core class
    pub addrs: Vec<u32>,
    sizes: Vec<u32>,
}

/// Ring allocator over the kernel-config scratch area, one ring per core class
///
/// Entries stay reserved until the dispatcher has seen the completion count
/// they were tagged with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerConfigBufferMgr {
    rings: Vec<ConfigRing>,
}

impl WorkerConfigBufferMgr {
    /// Allocator over the given areas, in core class order
    #[must_use]
    pub fn new(areas: &[KernelConfigArea]) -> Self {
        let mut mgr = Self::default();
        for area in areas {
            mgr.init_add_buffer(area.base, area.size);
        }
        mgr
    }

    /// Add the area for the next core class
    pub fn init_add_buffer(&mut self, base: u32, size: u32) {
        self.rings.push(ConfigRing {
            base,
            size,
            next: base,
            entries: VecDeque::new(),
        });
    }

    /// Number of managed core classes
    #[must_use]
    pub fn num_rings(&self) -> usize {
        self.rings.len()
    }

    /// Entries still in flight, summed over core classes
    #[must_use]
    pub fn num_in_flight(&self) -> usize {
        self.rings.iter().map(|r| r.entries.len()).sum()
    }

    /// True if every ring is held by a single whole-area entry
    #[must_use]
    pub fn is_completely_full(&self) -> bool {
        self.rings.iter().all(|r| {
            r.entries.len() == 1
                && r.entries[0].addr == r.base
                && r.entries[0].size == r.size
        })
    }

    /// Pick addresses for `sizes` (one per core class) without committing
    ///
    /// # Panics
    ///
    /// Panics if `sizes` does not name every core class or a size exceeds
    /// its area.
    #[must_use]
    pub fn reserve(&self, sizes: &[u32]) -> ConfigBufferReservation {
        assert_eq!(sizes.len(), self.rings.len(), "one size per core class");
        let mut sync = ConfigBufferSync::default();
        let mut addrs = Vec::with_capacity(sizes.len());
        for (ring, &size) in self.rings.iter().zip(sizes) {
            assert!(
                size <= ring.size,
                "kernel config of {size}B exceeds {}B area",
                ring.size
            );
            if size == 0 {
                addrs.push(ring.next);
                continue;
            }
            let addr = ring.placement(size);
            for entry in ring.entries.iter().filter(|e| e.overlaps(addr, size)) {
                sync.need_sync = true;
                sync.sync_count = sync.sync_count.max(entry.sync_count);
            }
            addrs.push(addr);
        }
        ConfigBufferReservation {
            sync,
            addrs,
            sizes: sizes.to_vec(),
        }
    }

    /// Retire every entry whose completion count has been reached
    pub fn free(&mut self, free_up_to_sync_count: u32) {
        for ring in &mut self.rings {
            ring.entries.retain(|e| e.sync_count > free_up_to_sync_count);
        }
    }

    /// Commit `reservation`, releasing it at `when_freed_sync_count`
    pub fn alloc(&mut self, reservation: &ConfigBufferReservation, when_freed_sync_count: u32) {
        if reservation.sync.need_sync {
            self.free(reservation.sync.sync_count);
        }
        for (ring, (&addr, &size)) in self
            .rings
            .iter_mut()
            .zip(reservation.addrs.iter().zip(&reservation.sizes))
        {
            if size == 0 {
                continue;
            }
            ring.entries.push_back(ConfigBufferEntry {
                addr,
                size,
                sync_count: when_freed_sync_count,
            });
            ring.next = addr + size;
        }
    }

    /// Reserve every area in full until `sync_count`
    pub fn mark_completely_full(&mut self, sync_count: u32) {
        for ring in &mut self.rings {
            ring.entries.clear();
            ring.entries.push_back(ConfigBufferEntry {
                addr: ring.base,
                size: ring.size,
                sync_count,
            });
            ring.next = ring.base;
        }
    }
}

/// Synchronization state of one dispatch channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchChannelState {
    /// Worker completions the dispatcher expects so far
    pub expected_completions: u32,
    /// Launch ring write pointers
    pub launch_ring: LaunchMessageRingBufferState,
    /// Kernel-config scratch allocator
    pub config_buffers: WorkerConfigBufferMgr,
}

impl DispatchChannelState {
    /// Fresh channel state
    #[must_use]
    pub fn new(launch_msg_ring_entries: u32, kernel_config: &[KernelConfigArea]) -> Self {
        Self {
            expected_completions: 0,
            launch_ring: LaunchMessageRingBufferState::new(launch_msg_ring_entries),
            config_buffers: WorkerConfigBufferMgr::new(kernel_config),
        }
    }

    /// Account for one program launch on this channel
    ///
    /// `num_workers` is the number of cores that will report completion.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::OutOfRange` if the completion counter would
    /// overflow; the channel is left unchanged.
    pub fn launch_program(
        &mut self,
        num_workers: u32,
        mcast: bool,
        unicast: bool,
        config_sizes: &[u32],
    ) -> Result<ConfigBufferReservation> {
        let expected = self
            .expected_completions
            .checked_add(num_workers)
            .ok_or_else(|| {
                TraceError::out_of_range(
                    "expected completions",
                    u64::from(self.expected_completions) + u64::from(num_workers),
                    u32::MAX,
                )
            })?;
        let reservation = self.config_buffers.reserve(config_sizes);
        self.expected_completions = expected;
        self.config_buffers
            .alloc(&reservation, self.expected_completions);
        if mcast {
            self.launch_ring.inc_mcast_wptr(1);
        }
        if unicast {
            self.launch_ring.inc_unicast_wptr(1);
        }
        Ok(reservation)
    }

    fn reset_for_trace(&mut self) {
        self.expected_completions = 0;
        self.launch_ring.reset();
        self.config_buffers.mark_completely_full(0);
    }
}

/// Live dispatch state of every channel plus the capture-time shadow copy
#[derive(Debug, Clone)]
pub struct HostDispatchState {
    channels: Vec<DispatchChannelState>,
    shadow: Option<Vec<DispatchChannelState>>,
}

impl HostDispatchState {
    /// One fresh state per dispatch message slot
    #[must_use]
    pub fn new(launch_msg_ring_entries: u32, kernel_config: &[KernelConfigArea]) -> Self {
        Self {
            channels: vec![
                DispatchChannelState::new(launch_msg_ring_entries, kernel_config);
                DISPATCH_MESSAGE_ENTRIES
            ],
            shadow: None,
        }
    }

    /// All channels
    #[must_use]
    pub fn channels(&self) -> &[DispatchChannelState] {
        &self.channels
    }

    /// One channel
    #[must_use]
    pub fn channel(&self, sub_device: SubDeviceId) -> &DispatchChannelState {
        &self.channels[sub_device.index()]
    }

    /// One channel, mutably
    pub fn channel_mut(&mut self, sub_device: SubDeviceId) -> &mut DispatchChannelState {
        &mut self.channels[sub_device.index()]
    }

    /// Expected completions of every channel, indexed by sub-device
    #[must_use]
    pub fn expected_completions(&self) -> Vec<u32> {
        self.channels.iter().map(|c| c.expected_completions).collect()
    }

    /// True between `save_and_reset` and `discard_shadow`
    #[must_use]
    pub const fn has_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    /// Shadow the first `num_channels` channels and zero them for capture
    ///
    /// The config allocator is left fully reserved against a count of zero,
    /// so the first allocation during capture waits for the trace start.
    pub fn save_and_reset(&mut self, num_channels: usize) {
        debug_assert!(num_channels <= self.channels.len());
        let n = num_channels.min(self.channels.len());
        self.shadow = Some(self.channels[..n].to_vec());
        for channel in &mut self.channels[..n] {
            channel.reset_for_trace();
        }
        debug!("Saved and reset {n} dispatch channel(s) for trace capture");
    }

    /// Copy the shadow back over the first `num_channels` channels
    ///
    /// Idempotent: the shadow is kept until [`discard_shadow`](Self::discard_shadow).
    pub fn restore(&mut self, num_channels: usize) {
        let Some(shadow) = &self.shadow else {
            warn!("No saved dispatch state to restore");
            return;
        };
        for (live, saved) in self.channels.iter_mut().zip(shadow).take(num_channels) {
            live.clone_from(saved);
        }
        debug!(
            "Restored {} dispatch channel(s)",
            num_channels.min(shadow.len())
        );
    }

    /// Drop the shadow copy
    pub fn discard_shadow(&mut self) {
        self.shadow = None;
    }

    /// Move every traced channel to the state the replay leaves behind
    pub fn apply_post_trace(&mut self, descriptors: &BTreeMap<SubDeviceId, TraceWorkerDescriptor>) {
        for (&sub_device, desc) in descriptors {
            let channel = &mut self.channels[sub_device.index()];
            channel.expected_completions = desc.num_completion_worker_cores;
            if desc.num_traced_programs_needing_go_signal_multicast != 0 {
                channel
                    .launch_ring
                    .set_mcast_wptr(desc.num_traced_programs_needing_go_signal_multicast);
            }
            if desc.num_traced_programs_needing_go_signal_unicast != 0 {
                channel
                    .launch_ring
                    .set_unicast_wptr(desc.num_traced_programs_needing_go_signal_unicast);
            }
            // Trace contents are opaque to the allocator.
            channel
                .config_buffers
                .mark_completely_full(channel.expected_completions);
            debug!(
                "{sub_device}: expecting {} completions after trace",
                channel.expected_completions
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn areas() -> [KernelConfigArea; 2] {
        [
            KernelConfigArea {
                base: 0x1000,
                size: 0x400,
            },
            KernelConfigArea {
                base: 0x8000,
                size: 0x100,
            },
        ]
    }

    fn busy_state() -> HostDispatchState {
        let mut state = HostDispatchState::new(8, &areas());
        for sub in 0..3u8 {
            let channel = state.channel_mut(SubDeviceId(sub));
            for _ in 0..=sub {
                channel
                    .launch_program(64, true, sub % 2 == 1, &[0x100, 0x40])
                    .unwrap();
            }
        }
        state
    }

    #[test]
    fn test_ring_pointers_wrap() {
        let mut ring = LaunchMessageRingBufferState::new(4);
        ring.inc_mcast_wptr(3);
        ring.inc_mcast_wptr(2);
        assert_eq!(ring.mcast_wptr(), 1);
        ring.set_unicast_wptr(6);
        assert_eq!(ring.unicast_wptr(), 2);
        ring.reset();
        assert_eq!((ring.mcast_wptr(), ring.unicast_wptr()), (0, 0));
        assert_eq!(ring.generation(), 1);
    }

    #[test]
    fn test_config_reserve_wraps_and_syncs() {
        let mut mgr = WorkerConfigBufferMgr::new(&areas());
        let first = mgr.reserve(&[0x300, 0]);
        assert!(!first.sync.need_sync);
        assert_eq!(first.addrs[0], 0x1000);
        mgr.alloc(&first, 10);

        // Does not fit behind the first entry, wraps onto it.
        let second = mgr.reserve(&[0x200, 0]);
        assert_eq!(second.addrs[0], 0x1000);
        assert_eq!(
            second.sync,
            ConfigBufferSync {
                need_sync: true,
                sync_count: 10
            }
        );
        mgr.alloc(&second, 20);
        assert_eq!(mgr.num_in_flight(), 1);
    }

    #[test]
    fn test_config_free_retires_completed_entries() {
        let mut mgr = WorkerConfigBufferMgr::new(&areas());
        let r = mgr.reserve(&[0x100, 0x10]);
        mgr.alloc(&r, 5);
        mgr.free(4);
        assert_eq!(mgr.num_in_flight(), 2);
        mgr.free(5);
        assert_eq!(mgr.num_in_flight(), 0);
    }

    #[test]
    fn test_completely_full_forces_sync() {
        let mut mgr = WorkerConfigBufferMgr::new(&areas());
        mgr.mark_completely_full(42);
        assert!(mgr.is_completely_full());
        let r = mgr.reserve(&[0x10, 0x10]);
        assert_eq!(r.sync.sync_count, 42);
        assert!(r.sync.need_sync);
    }

    #[test]
    fn test_save_and_reset_zeroes_channels() {
        let mut state = busy_state();
        state.save_and_reset(2);
        assert!(state.has_shadow());
        for sub in 0..2u8 {
            let channel = state.channel(SubDeviceId(sub));
            assert_eq!(channel.expected_completions, 0);
            assert_eq!(channel.launch_ring.mcast_wptr(), 0);
            assert!(channel.config_buffers.is_completely_full());
        }
        // Beyond the requested count: untouched.
        assert_eq!(state.channel(SubDeviceId(2)).expected_completions, 192);
    }

    #[test]
    fn test_save_restore_round_trip() {
        let mut state = busy_state();
        let before = state.channels().to_vec();
        state.save_and_reset(3);
        state.restore(3);
        assert_eq!(state.channels(), &before[..]);
        state.restore(3);
        assert_eq!(state.channels(), &before[..]);
        state.discard_shadow();
        assert!(!state.has_shadow());
    }

    #[test]
    fn test_restore_without_shadow_is_noop() {
        let mut state = busy_state();
        let before = state.channels().to_vec();
        state.restore(4);
        assert_eq!(state.channels(), &before[..]);
    }

    #[test]
    fn test_completion_overflow_leaves_channel_untouched() {
        let mut state = HostDispatchState::new(8, &areas());
        let channel = state.channel_mut(SubDeviceId(0));
        channel.launch_program(u32::MAX - 1, true, false, &[0x10, 0]).unwrap();
        let before = channel.clone();
        let err = channel.launch_program(2, true, false, &[0x10, 0]).unwrap_err();
        assert!(matches!(err, TraceError::OutOfRange { what: "expected completions", .. }));
        assert_eq!(*channel, before);
    }

    #[test]
    fn test_apply_post_trace() {
        let mut state = busy_state();
        let mut descriptors = BTreeMap::new();
        descriptors.insert(
            SubDeviceId(1),
            TraceWorkerDescriptor {
                num_completion_worker_cores: 130,
                num_traced_programs_needing_go_signal_multicast: 2,
                num_traced_programs_needing_go_signal_unicast: 0,
            },
        );
        let unicast_before = state.channel(SubDeviceId(1)).launch_ring.unicast_wptr();
        let untouched = state.channel(SubDeviceId(0)).clone();

        state.apply_post_trace(&descriptors);

        let channel = state.channel(SubDeviceId(1));
        assert_eq!(channel.expected_completions, 130);
        assert_eq!(channel.launch_ring.mcast_wptr(), 2);
        assert_eq!(channel.launch_ring.unicast_wptr(), unicast_before);
        assert!(channel.config_buffers.is_completely_full());
        assert_eq!(state.channel(SubDeviceId(0)), &untouched);
    }
}

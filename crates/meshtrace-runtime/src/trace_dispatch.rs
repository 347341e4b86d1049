//! Replay command assembly
//!
//! Replaying a trace costs one short command sequence per chip:
//!
//! ```text
//! [notify dispatch_s]                      only with a secondary dispatcher
//! go-signal(RESET_READ_PTR)  x sub-devices workers rewind their launch ring
//! [wait on dispatch_s] + wait x sub-devices  all workers acknowledged, counter cleared
//! exec_buf(addr, log2 page, pages)         run the resident trace buffer
//! ```
//!
//! The sequence size is reserved in the issue queue before anything is
//! written, so [`compute_trace_cmd_size`] and [`build_trace_commands`] must
//! agree to the byte.

use std::collections::BTreeMap;

use meshtrace_hw::cq::{run_msg, wait_flags, DispatcherSelect, GoMsg};
use meshtrace_hw::memmap::ProgrammableCoreType;
use tracing::debug;

use crate::command::{relayed_cmd_size, DeviceCommand};
use crate::config::DispatchConfig;
use crate::error::Result;
use crate::sysmem::SystemMemoryManager;
use crate::topology::{CoreCoord, SubDeviceId, WorkerTopology};

/// Smallest trace buffer page size considered
pub const MIN_TRACE_PAGE_SIZE: u32 = 1024;
/// Largest trace buffer page size considered
pub const MAX_TRACE_PAGE_SIZE: u32 = 4096;

/// What a trace does to one sub-device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceWorkerDescriptor {
    /// Worker completions the dispatcher has seen when the trace ends
    pub num_completion_worker_cores: u32,
    /// Traced programs launched with a multicast go-signal
    pub num_traced_programs_needing_go_signal_multicast: u32,
    /// Traced programs launched with a unicast go-signal
    pub num_traced_programs_needing_go_signal_unicast: u32,
}

/// Everything the replay command needs to know about a resident trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceDispatchMetadata {
    /// Predicted replay command size, from [`compute_trace_cmd_size`]
    pub cmd_sequence_size: usize,
    /// Per-sub-device summary of the trace
    pub trace_worker_descriptors: BTreeMap<SubDeviceId, TraceWorkerDescriptor>,
    /// Sub-devices the trace touches
    pub sub_device_ids: Vec<SubDeviceId>,
    /// Device address of the trace buffer
    pub trace_buffer_address: u32,
    /// Page size of the trace buffer, a power of two
    pub trace_buffer_page_size: u32,
    /// Pages to execute
    pub trace_buffer_num_pages: u32,
}

/// Bytes of the replay command for `num_sub_devices` sub-devices
#[must_use]
pub fn compute_trace_cmd_size(num_sub_devices: usize, dispatch: &DispatchConfig) -> usize {
    let align = dispatch.host_alignment as usize;
    let go_signals = relayed_cmd_size(dispatch.host_alignment) as usize * num_sub_devices;
    let notify = usize::from(dispatch.dispatch_s_enabled) * align;
    let waits = (align + usize::from(dispatch.distributed_dispatcher) * align) * num_sub_devices;
    notify + go_signals + waits + align
}

/// Page size for a trace buffer of `buf_size` bytes over `num_banks` banks
///
/// Picks the candidate in `1024..=4096` wasting the least space when the
/// buffer is rounded up to a whole page in every bank. Ties go to the
/// larger page.
///
/// # Panics
///
/// Panics if no candidate is found.
#[must_use]
pub fn compute_interleaved_trace_buf_page_size(buf_size: u64, num_banks: u32) -> u32 {
    let mut min_waste = u64::MAX;
    let mut pick = None;
    let mut page_size = MIN_TRACE_PAGE_SIZE;
    while page_size <= MAX_TRACE_PAGE_SIZE {
        let waste = trace_buf_waste(buf_size, page_size, num_banks);
        if waste <= min_waste {
            min_waste = waste;
            pick = Some(page_size);
        }
        page_size *= 2;
    }
    let Some(page_size) = pick else {
        panic!("no trace buffer page size for {buf_size}B over {num_banks} banks");
    };
    page_size
}

/// Padding when `buf_size` is rounded up to `page_size * num_banks`
#[must_use]
pub fn trace_buf_waste(buf_size: u64, page_size: u32, num_banks: u32) -> u64 {
    let granule = u64::from(page_size) * u64::from(num_banks);
    meshtrace_hw::align_up(buf_size, granule) - buf_size
}

/// Assemble the replay command for one chip
///
/// `expected_completions` is the host's live counter per sub-device index.
///
/// # Panics
///
/// Panics if the page size is not a power of two or the assembled bytes
/// differ from `md.cmd_sequence_size`.
#[must_use]
pub fn build_trace_commands(
    topology: &dyn WorkerTopology,
    dispatch: &DispatchConfig,
    dispatch_core: CoreCoord,
    md: &TraceDispatchMetadata,
    expected_completions: &[u32],
) -> DeviceCommand {
    let mut command = DeviceCommand::new(md.cmd_sequence_size, dispatch.host_alignment);
    let mem_map = dispatch.mem_map();

    let mut go_signal_dispatcher = DispatcherSelect::Primary;
    if dispatch.dispatch_s_enabled {
        let index_bitmask = md
            .sub_device_ids
            .iter()
            .fold(0u16, |mask, id| mask | (1 << id.0));
        command.add_notify_dispatch_s_go_signal_cmd(false, index_bitmask);
        go_signal_dispatcher = DispatcherSelect::Secondary;
    }

    for (&id, desc) in &md.trace_worker_descriptors {
        let mcast = desc.num_traced_programs_needing_go_signal_multicast != 0;
        let unicast = desc.num_traced_programs_needing_go_signal_unicast != 0;
        #[allow(clippy::cast_possible_truncation)]
        let go = GoMsg {
            dispatch_message_offset: mem_map.dispatch_message_offset(id.0) as u8,
            master_x: dispatch_core.x,
            master_y: dispatch_core.y,
            signal: run_msg::RESET_READ_PTR,
        };
        command.add_dispatch_go_signal_mcast(
            expected_completions[id.index()],
            go.to_word(),
            mem_map.dispatch_message_addr(id.0),
            if mcast { topology.num_noc_mcast_txns(id) } else { 0 },
            if unicast { topology.num_noc_unicast_txns(id) } else { 0 },
            topology.noc_data_start_index(id, mcast, unicast),
            go_signal_dispatcher,
        );
    }

    // Trace starts counting from zero, so every wait clears the counter.
    let flags = wait_flags::CLEAR_COUNT | wait_flags::WAIT_MEMORY;
    for (&id, desc) in &md.trace_worker_descriptors {
        let mut expected = expected_completions[id.index()];
        if desc.num_traced_programs_needing_go_signal_multicast != 0 {
            expected += topology.num_worker_cores(ProgrammableCoreType::Tensix, id);
        }
        if desc.num_traced_programs_needing_go_signal_unicast != 0 {
            expected += topology.num_worker_cores(ProgrammableCoreType::ActiveEth, id);
        }
        let addr = mem_map.dispatch_message_addr(id.0);
        if dispatch.distributed_dispatcher {
            command.add_dispatch_wait(flags, addr, expected, DispatcherSelect::Secondary);
        }
        command.add_dispatch_wait(flags, addr, expected, DispatcherSelect::Primary);
    }

    assert!(
        md.trace_buffer_page_size.is_power_of_two(),
        "Page size must be a power of 2"
    );
    // Every chip's copy of the buffer ends in EXEC_BUF_END, including chips
    // that ran no traced program, so the exec_buf always returns.
    command.add_prefetch_exec_buf(
        md.trace_buffer_address,
        md.trace_buffer_page_size.trailing_zeros(),
        md.trace_buffer_num_pages,
    );

    assert_eq!(
        command.size_bytes(),
        md.cmd_sequence_size,
        "replay command size differs from its reservation"
    );
    command
}

/// Assemble the replay command and push it through `sysmem`'s queues
///
/// The fetch-queue entry asks the prefetcher to stall until the trace
/// buffer has been executed.
///
/// # Errors
///
/// Returns error if the issue queue cannot hold the command.
pub fn issue_trace_commands(
    sysmem: &mut SystemMemoryManager,
    topology: &dyn WorkerTopology,
    dispatch: &DispatchConfig,
    dispatch_core: CoreCoord,
    md: &TraceDispatchMetadata,
    cq_id: u8,
    expected_completions: &[u32],
) -> Result<()> {
    let command = build_trace_commands(topology, dispatch, dispatch_core, md, expected_completions);
    let region = sysmem.issue_queue_reserve(md.cmd_sequence_size, cq_id)?;
    region.copy_from_slice(command.data());
    sysmem.issue_queue_push_back(md.cmd_sequence_size, cq_id);
    sysmem.fetch_queue_reserve_back(cq_id);
    sysmem.fetch_queue_write(md.cmd_sequence_size, cq_id, true);
    debug!(
        "Device {}: replay of {} pages at {:#x} issued ({}B)",
        sysmem.device_id(),
        md.trace_buffer_num_pages,
        md.trace_buffer_address,
        md.cmd_sequence_size
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{parse_commands, CommandRecord};
    use crate::topology::{SubDeviceManager, SubDeviceTopology};
    use meshtrace_hw::cq::{DispatchCmd, PrefetchCmd};

    fn topology(n: usize) -> SubDeviceManager {
        SubDeviceManager::new(vec![SubDeviceTopology::default(); n]).unwrap()
    }

    fn metadata(descs: &[(u8, u32, u32, u32)], dispatch: &DispatchConfig) -> TraceDispatchMetadata {
        let trace_worker_descriptors: BTreeMap<_, _> = descs
            .iter()
            .map(|&(id, done, m, u)| {
                (
                    SubDeviceId(id),
                    TraceWorkerDescriptor {
                        num_completion_worker_cores: done,
                        num_traced_programs_needing_go_signal_multicast: m,
                        num_traced_programs_needing_go_signal_unicast: u,
                    },
                )
            })
            .collect();
        let sub_device_ids: Vec<_> = trace_worker_descriptors.keys().copied().collect();
        TraceDispatchMetadata {
            cmd_sequence_size: compute_trace_cmd_size(sub_device_ids.len(), dispatch),
            trace_worker_descriptors,
            sub_device_ids,
            trace_buffer_address: 0x10_0000,
            trace_buffer_page_size: 2048,
            trace_buffer_num_pages: 6,
        }
    }

    #[test]
    fn test_cmd_size_formula() {
        let plain = DispatchConfig::default();
        assert_eq!(compute_trace_cmd_size(1, &plain), 64 + 64 + 64);
        assert_eq!(compute_trace_cmd_size(3, &plain), 3 * 64 + 3 * 64 + 64);
        let full = DispatchConfig {
            dispatch_s_enabled: true,
            distributed_dispatcher: true,
            ..DispatchConfig::default()
        };
        assert_eq!(compute_trace_cmd_size(2, &full), 64 + 2 * 64 + 2 * 128 + 64);
    }

    #[test]
    fn test_page_size_tie_goes_to_larger() {
        // 1024 and 2048 both waste 6384B over 8 banks.
        assert_eq!(trace_buf_waste(10_000, 1024, 8), 6384);
        assert_eq!(trace_buf_waste(10_000, 2048, 8), 6384);
        assert_eq!(compute_interleaved_trace_buf_page_size(10_000, 8), 2048);
    }

    #[test]
    fn test_page_size_exact_fit_prefers_largest() {
        assert_eq!(compute_interleaved_trace_buf_page_size(4096 * 12, 12), 4096);
        assert_eq!(compute_interleaved_trace_buf_page_size(0, 12), 4096);
    }

    #[test]
    fn test_replay_layout_single_dispatcher() {
        let dispatch = DispatchConfig::default();
        let md = metadata(&[(0, 128, 2, 0)], &dispatch);
        let mut expected = vec![0; 16];
        expected[0] = 40;
        let cmd = build_trace_commands(&topology(1), &dispatch, CoreCoord::new(1, 10), &md, &expected);
        let records = parse_commands(cmd.data(), dispatch.host_alignment);
        assert_eq!(records.len(), 3);

        let CommandRecord::Relayed {
            cmd:
                DispatchCmd::GoSignalMcast {
                    go_signal,
                    wait_count,
                    num_mcast_txns,
                    num_unicast_txns,
                    ..
                },
            ..
        } = records[0]
        else {
            panic!("expected go-signal, got {:?}", records[0]);
        };
        let go = GoMsg::from_word(go_signal);
        assert_eq!(go.signal, run_msg::RESET_READ_PTR);
        assert_eq!((go.master_x, go.master_y), (1, 10));
        assert_eq!(wait_count, 40);
        assert_eq!((num_mcast_txns, num_unicast_txns), (1, 0));

        assert!(matches!(
            records[1],
            CommandRecord::Relayed {
                cmd: DispatchCmd::Wait {
                    count: 104,
                    flags,
                    ..
                },
                ..
            } if flags & wait_flags::CLEAR_COUNT != 0
        ));
        assert_eq!(
            records[2],
            CommandRecord::Prefetch(PrefetchCmd::ExecBuf {
                base_addr: 0x10_0000,
                log_page_size: 11,
                pages: 6
            })
        );
    }

    #[test]
    fn test_replay_layout_dispatch_s_distributed() {
        let dispatch = DispatchConfig {
            dispatch_s_enabled: true,
            distributed_dispatcher: true,
            ..DispatchConfig::default()
        };
        let md = metadata(&[(0, 64, 1, 0), (2, 2, 0, 1)], &dispatch);
        let cmd = build_trace_commands(&topology(3), &dispatch, CoreCoord::new(1, 10), &md, &[0; 16]);
        assert_eq!(cmd.size_bytes(), md.cmd_sequence_size);
        let records = parse_commands(cmd.data(), dispatch.host_alignment);
        // notify + 2 go-signals + 2x2 waits + exec_buf
        assert_eq!(records.len(), 8);
        assert!(matches!(
            records[0],
            CommandRecord::Relayed {
                cmd: DispatchCmd::NotifySecondaryGoSignal {
                    index_bitmask: 0b101,
                    ..
                },
                ..
            }
        ));
        for go in &records[1..3] {
            assert!(matches!(
                go,
                CommandRecord::Relayed {
                    header: PrefetchCmd::RelayInline {
                        dispatcher: DispatcherSelect::Secondary,
                        ..
                    },
                    cmd: DispatchCmd::GoSignalMcast { .. },
                }
            ));
        }
        // Unicast-only sub-device waits for its Ethernet workers.
        assert!(matches!(
            records[5],
            CommandRecord::Relayed {
                header: PrefetchCmd::RelayInline {
                    dispatcher: DispatcherSelect::Secondary,
                    ..
                },
                cmd: DispatchCmd::Wait { count: 2, .. },
            }
        ));
        assert!(matches!(
            records[6],
            CommandRecord::Relayed {
                header: PrefetchCmd::RelayInline {
                    dispatcher: DispatcherSelect::Primary,
                    ..
                },
                cmd: DispatchCmd::Wait { count: 2, .. },
            }
        ));
    }

    #[test]
    #[should_panic(expected = "power of 2")]
    fn test_non_power_of_two_page_size_panics() {
        let dispatch = DispatchConfig::default();
        let mut md = metadata(&[(0, 1, 1, 0)], &dispatch);
        md.trace_buffer_page_size = 3000;
        let _ = build_trace_commands(&topology(1), &dispatch, CoreCoord::default(), &md, &[0; 16]);
    }

    #[test]
    fn test_issue_pushes_stalling_fetch_entry() {
        let dispatch = DispatchConfig::default();
        let md = metadata(&[(0, 64, 1, 0)], &dispatch);
        let mut sysmem = SystemMemoryManager::new(0, 1, 4096, 8);
        issue_trace_commands(
            &mut sysmem,
            &topology(1),
            &dispatch,
            CoreCoord::default(),
            &md,
            0,
            &[0; 16],
        )
        .unwrap();
        let issued = sysmem.issued(0);
        assert_eq!(issued.len(), 1);
        assert!(issued[0].stalls_prefetcher());
        assert_eq!(issued[0].data.len(), md.cmd_sequence_size);
    }
}

//! Properties of trace assembly and replay sizing over arbitrary inputs

use std::collections::BTreeMap;

use bytes::Bytes;
use meshtrace_hw::mesh::{MeshCoordinate, MeshCoordinateRange, MeshShape};
use meshtrace_runtime::mesh_trace::exec_buf_end_marker;
use meshtrace_runtime::trace_dispatch::{build_trace_commands, compute_trace_cmd_size};
use meshtrace_runtime::{
    CoreCoord, DispatchConfig, HostDispatchState, KernelConfigArea, MeshTraceDescriptor,
    SubDeviceId, SubDeviceManager, SubDeviceTopology, TraceDispatchMetadata, TraceWorkerDescriptor,
};
use proptest::prelude::*;

const ROWS: u32 = 3;
const COLS: u32 = 4;

fn range_strategy() -> impl Strategy<Value = MeshCoordinateRange> {
    (0..ROWS, 0..ROWS, 0..COLS, 0..COLS).prop_map(|(r0, r1, c0, c1)| {
        MeshCoordinateRange::new(
            MeshCoordinate::new([r0.min(r1), c0.min(c1)]),
            MeshCoordinate::new([r0.max(r1), c0.max(c1)]),
        )
    })
}

fn records_strategy() -> impl Strategy<Value = Vec<(MeshCoordinateRange, Bytes)>> {
    prop::collection::vec(
        (range_strategy(), prop::collection::vec(any::<u8>(), 0..24)),
        0..12,
    )
    .prop_map(|records| {
        records
            .into_iter()
            .map(|(range, data)| (range, Bytes::from(data)))
            .collect()
    })
}

fn mesh_range() -> MeshCoordinateRange {
    MeshCoordinateRange::from_shape(&MeshShape::new([ROWS, COLS]))
}

fn fold_all(records: &[(MeshCoordinateRange, Bytes)]) -> MeshTraceDescriptor {
    let mut desc = MeshTraceDescriptor::new();
    for (range, data) in records {
        desc.fold(range, data.clone());
    }
    desc
}

fn assemble(records: &[(MeshCoordinateRange, Bytes)]) -> MeshTraceDescriptor {
    let mut desc = fold_all(records);
    desc.finalize(&mesh_range(), &exec_buf_end_marker(32));
    desc
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_entries_stay_disjoint(records in records_strategy()) {
        let desc = assemble(&records);
        let entries = desc.ordered_trace_data();
        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                prop_assert!(
                    !a.device_range.intersects(&b.device_range),
                    "{} overlaps {}",
                    a.device_range,
                    b.device_range
                );
            }
        }
    }

    #[test]
    fn test_every_chip_sees_its_history(records in records_strategy()) {
        let desc = assemble(&records);
        let marker = exec_buf_end_marker(32);
        for coord in &mesh_range() {
            let mut expected: Vec<u8> = records
                .iter()
                .filter(|(range, _)| range.contains(&coord))
                .flat_map(|(_, data)| data.iter().copied())
                .collect();
            expected.extend_from_slice(&marker);
            let covering: Vec<_> = desc
                .ordered_trace_data()
                .iter()
                .filter(|e| e.device_range.contains(&coord))
                .collect();
            prop_assert_eq!(covering.len(), 1, "{} covered {} times", coord, covering.len());
            prop_assert_eq!(&covering[0].data[..], &expected[..]);
        }
    }

    #[test]
    fn test_total_size_counts_each_record_once(records in records_strategy(), align in prop::sample::select(vec![32u32, 64, 128])) {
        let mut desc = fold_all(&records);
        let staged: usize = records.iter().map(|(_, data)| data.len()).sum();
        prop_assert_eq!(desc.total_trace_size(), staged);

        let marker = exec_buf_end_marker(align);
        desc.finalize(&mesh_range(), &marker);
        prop_assert_eq!(desc.total_trace_size(), staged + marker.len());
        for entry in desc.ordered_trace_data() {
            prop_assert!(entry.data.len() <= desc.total_trace_size());
            prop_assert!(entry.data.ends_with(&marker));
        }
    }

    #[test]
    fn test_replay_command_matches_reservation(
        traced_mask in prop::collection::vec(any::<bool>(), 16),
        dispatch_s_enabled in any::<bool>(),
        distributed_dispatcher in any::<bool>(),
        host_alignment in prop::sample::select(vec![32u32, 64]),
        programs in (0u32..4, 0u32..4),
    ) {
        let dispatch = DispatchConfig {
            dispatch_s_enabled,
            distributed_dispatcher,
            host_alignment,
            ..DispatchConfig::default()
        };
        let topology = SubDeviceManager::new(vec![SubDeviceTopology::default(); 16]).unwrap();
        let trace_worker_descriptors: BTreeMap<_, _> = (0u8..16)
            .filter(|&id| traced_mask[usize::from(id)])
            .map(|id| {
                (
                    SubDeviceId(id),
                    TraceWorkerDescriptor {
                        num_completion_worker_cores: 66,
                        num_traced_programs_needing_go_signal_multicast: programs.0,
                        num_traced_programs_needing_go_signal_unicast: programs.1,
                    },
                )
            })
            .collect();
        let sub_device_ids: Vec<_> = trace_worker_descriptors.keys().copied().collect();
        let md = TraceDispatchMetadata {
            cmd_sequence_size: compute_trace_cmd_size(sub_device_ids.len(), &dispatch),
            trace_worker_descriptors,
            sub_device_ids,
            trace_buffer_address: 0x2000,
            trace_buffer_page_size: 4096,
            trace_buffer_num_pages: 3,
        };
        let command = build_trace_commands(&topology, &dispatch, CoreCoord::new(1, 10), &md, &[5; 16]);
        prop_assert_eq!(command.size_bytes(), md.cmd_sequence_size);
    }

    #[test]
    fn test_capture_restores_dispatch_state(
        before in prop::collection::vec((0u8..4, 1u32..80, any::<bool>()), 0..10),
        during in prop::collection::vec((0u8..4, 1u32..80, any::<bool>()), 0..10),
    ) {
        let areas = [
            KernelConfigArea { base: 0x8000, size: 0x1000 },
            KernelConfigArea { base: 0x2000, size: 0x400 },
        ];
        let mut state = HostDispatchState::new(8, &areas);
        for &(sub_device, workers, unicast) in &before {
            state
                .channel_mut(SubDeviceId(sub_device))
                .launch_program(workers, true, unicast, &[0x200, u32::from(unicast) * 0x100])
                .unwrap();
        }
        let saved: Vec<_> = state.channels().to_vec();

        state.save_and_reset(4);
        for &(sub_device, workers, unicast) in &during {
            state
                .channel_mut(SubDeviceId(sub_device))
                .launch_program(workers, !unicast, unicast, &[0x100, 0])
                .unwrap();
        }
        state.restore(4);
        state.discard_shadow();
        prop_assert_eq!(state.channels(), &saved[..]);
    }
}

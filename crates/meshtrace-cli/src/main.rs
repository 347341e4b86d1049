//! `meshtrace`: inspect trace layout decisions and simulate capture/replay.
//!
//! ```text
//! USAGE:
//!   meshtrace page-size <bytes> [--banks N]            Trace buffer page size choice
//!   meshtrace cmd-size <sub-devices> [--dispatch-s]    Replay command size
//!   meshtrace simulate [--rows R --cols C]             Capture and replay on a software mesh
//! ```

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use meshtrace_hw::cq::{wait_flags, DispatcherSelect};
use meshtrace_hw::mesh::{MeshCoordinate, MeshCoordinateRange, MeshShape};
use meshtrace_runtime::trace_dispatch::{
    compute_interleaved_trace_buf_page_size, compute_trace_cmd_size, trace_buf_waste,
    MAX_TRACE_PAGE_SIZE, MIN_TRACE_PAGE_SIZE,
};
use meshtrace_runtime::{
    parse_commands, relayed_cmd_size, DeviceCommand, DispatchConfig, MeshConfig, MeshDevice,
    SubDeviceId, TracedProgram,
};
use tracing_subscriber::EnvFilter;

/// Largest trace size `page-size` accepts (256 TiB)
const MAX_TRACE_BYTES: u64 = 1 << 48;

#[derive(Parser)]
#[command(name = "meshtrace", about = "Mesh trace layout and replay inspector", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show the page size picked for a trace buffer and the waste of every candidate.
    PageSize {
        /// Unpadded trace size in bytes.
        #[arg(value_parser = clap::value_parser!(u64).range(..=MAX_TRACE_BYTES))]
        bytes: u64,
        /// DRAM banks the buffer is interleaved over.
        #[arg(long, default_value_t = 12, value_parser = clap::value_parser!(u32).range(1..=1024))]
        banks: u32,
    },
    /// Show the size of the replay command for a number of traced sub-devices.
    CmdSize {
        /// Sub-devices touched by the trace.
        sub_devices: usize,
        /// A secondary dispatcher sends go-signals.
        #[arg(long)]
        dispatch_s: bool,
        /// Dispatch is split across two cores.
        #[arg(long)]
        distributed: bool,
        /// Host (PCIe) alignment in bytes.
        #[arg(long, default_value_t = 64)]
        alignment: u32,
    },
    /// Capture a small synthetic trace on a software mesh, then replay it.
    Simulate {
        /// Mesh rows.
        #[arg(long, default_value_t = 2)]
        rows: u32,
        /// Mesh columns.
        #[arg(long, default_value_t = 4)]
        cols: u32,
        /// Number of replays.
        #[arg(long, default_value_t = 2)]
        replays: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::PageSize { bytes, banks } => cmd_page_size(bytes, banks)?,
        Cmd::CmdSize {
            sub_devices,
            dispatch_s,
            distributed,
            alignment,
        } => cmd_cmd_size(sub_devices, dispatch_s, distributed, alignment)?,
        Cmd::Simulate {
            rows,
            cols,
            replays,
        } => cmd_simulate(rows, cols, replays)?,
    }

    Ok(())
}

fn cmd_page_size(bytes: u64, banks: u32) -> Result<()> {
    let pick = compute_interleaved_trace_buf_page_size(bytes, banks);

    println!("Trace size : {bytes} B over {banks} banks");
    let mut page_size = MIN_TRACE_PAGE_SIZE;
    while page_size <= MAX_TRACE_PAGE_SIZE {
        let marker = if page_size == pick { "  <-" } else { "" };
        println!(
            "  {page_size:>5} B pages  waste {:>8} B{marker}",
            trace_buf_waste(bytes, page_size, banks)
        );
        page_size *= 2;
    }
    println!("Buffer     : {} B", meshtrace_hw::align_up(bytes, u64::from(pick)));
    Ok(())
}

fn cmd_cmd_size(sub_devices: usize, dispatch_s: bool, distributed: bool, alignment: u32) -> Result<()> {
    let dispatch = DispatchConfig {
        dispatch_s_enabled: dispatch_s,
        distributed_dispatcher: distributed,
        host_alignment: alignment,
        ..DispatchConfig::default()
    };
    dispatch.validate()?;
    ensure!(
        sub_devices <= meshtrace_hw::memmap::DISPATCH_MESSAGE_ENTRIES,
        "at most {} sub-devices",
        meshtrace_hw::memmap::DISPATCH_MESSAGE_ENTRIES
    );
    println!(
        "Replay command for {sub_devices} sub-device(s): {} B",
        compute_trace_cmd_size(sub_devices, &dispatch)
    );
    Ok(())
}

/// One relayed wait, tagged so each program's bytes are distinguishable.
fn synthetic_program(tag: u32, alignment: u32) -> Bytes {
    let mut cmd = DeviceCommand::new(relayed_cmd_size(alignment) as usize, alignment);
    cmd.add_dispatch_wait(wait_flags::WAIT_MEMORY, 0x1000 + tag * 4, tag, DispatcherSelect::Primary);
    cmd.freeze()
}

fn cmd_simulate(rows: u32, cols: u32, replays: u32) -> Result<()> {
    ensure!(rows > 0 && cols > 0, "mesh must have at least one device");
    let config = MeshConfig {
        shape: MeshShape::new([rows, cols]),
        ..MeshConfig::from_env()?
    };
    let alignment = config.dispatch.host_alignment;
    tracing::debug!("Simulating on {} mesh: {config:?}", config.shape);
    let mut mesh = MeshDevice::create(&config).context("opening software mesh")?;

    let whole = MeshCoordinateRange::from_shape(mesh.shape());
    let first_row = MeshCoordinateRange::new(
        MeshCoordinate::new([0, 0]),
        MeshCoordinate::new([0, cols - 1]),
    );
    let corner = MeshCoordinateRange::single(MeshCoordinate::new([rows - 1, cols - 1]));

    let trace_id = mesh.next_trace_id();
    mesh.begin_mesh_trace(0, trace_id)?;
    for (tag, range) in [(1, &whole), (2, &first_row), (3, &corner), (4, &whole)] {
        let program = TracedProgram::new(range.clone(), SubDeviceId(0), synthetic_program(tag, alignment));
        mesh.enqueue_traced_program(0, &program)?;
    }
    mesh.end_mesh_trace(0, trace_id)?;

    let trace = mesh.get_mesh_trace(trace_id)?;
    let desc = trace.desc();
    println!("Trace {trace_id} on {} mesh", mesh.shape());
    println!("  total size : {} B", desc.total_trace_size());
    for entry in desc.ordered_trace_data() {
        println!(
            "  {:<16} {:>5} B  {} commands",
            entry.device_range.to_string(),
            entry.data.len(),
            parse_commands(&entry.data, alignment).len()
        );
    }
    for (sub_device, worker) in desc.descriptors() {
        println!(
            "  {sub_device}: {} completions, {} mcast / {} unicast programs",
            worker.num_completion_worker_cores,
            worker.num_traced_programs_needing_go_signal_multicast,
            worker.num_traced_programs_needing_go_signal_unicast
        );
    }
    if let Some(buffer) = trace.mesh_buffer() {
        println!(
            "  buffer     : {} B at {:#x}, {} x {} B pages",
            buffer.size(),
            buffer.address(),
            buffer.num_pages(),
            buffer.page_size()
        );
    }

    for _ in 0..replays {
        mesh.replay_mesh_trace(0, trace_id)?;
    }
    let device = &mesh.devices()[0];
    println!("Replays on device {}: {}", device.coord(), device.sysmem().issued(0).len());
    if let Some(last) = device.sysmem().issued(0).last() {
        for record in parse_commands(&last.data, alignment) {
            println!("  {record:?}");
        }
    }

    mesh.release_mesh_trace(trace_id)?;
    Ok(())
}

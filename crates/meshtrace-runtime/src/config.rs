//! Mesh and dispatch configuration
//!
//! Defaults describe a 2x4 mesh of single-sub-device chips with a 16 MiB
//! trace region. [`MeshConfig::from_env`] overlays the `MESHTRACE_*`
//! environment variables on top of the defaults.

use std::str::FromStr;

use meshtrace_hw::cq::{CMD_RECORD_SIZE, DEFAULT_HOST_ALIGNMENT};
use meshtrace_hw::memmap::{DispatchCoreType, DispatchMemMap, ProgrammableCoreType};
use meshtrace_hw::mesh::MeshShape;

use crate::error::{Result, TraceError};
use crate::topology::{CoreCoord, SubDeviceTopology};

/// Trace region capacity override, in bytes
pub const ENV_TRACE_REGION_SIZE: &str = "MESHTRACE_TRACE_REGION_SIZE";
/// DRAM bank count override
pub const ENV_DRAM_BANKS: &str = "MESHTRACE_DRAM_BANKS";
/// Secondary dispatcher switch (`1`/`0`, `true`/`false`)
pub const ENV_DISPATCH_S: &str = "MESHTRACE_DISPATCH_S";
/// Distributed dispatcher switch (`1`/`0`, `true`/`false`)
pub const ENV_DISTRIBUTED_DISPATCH: &str = "MESHTRACE_DISTRIBUTED_DISPATCH";

/// How the command queue's dispatcher firmware is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// A secondary dispatcher (`dispatch_s`) owns go-signals
    pub dispatch_s_enabled: bool,
    /// Dispatch is split across two physical cores
    pub distributed_dispatcher: bool,
    /// Core type running the dispatcher
    pub dispatch_core_type: DispatchCoreType,
    /// Host (PCIe) alignment of issue-queue commands
    pub host_alignment: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatch_s_enabled: false,
            distributed_dispatcher: false,
            dispatch_core_type: DispatchCoreType::Worker,
            host_alignment: DEFAULT_HOST_ALIGNMENT,
        }
    }
}

impl DispatchConfig {
    /// Dispatch message layout for the configured core type
    #[must_use]
    pub const fn mem_map(&self) -> &'static DispatchMemMap {
        DispatchMemMap::get(self.dispatch_core_type)
    }

    /// Check the alignment can hold a relayed command in one unit
    ///
    /// # Errors
    ///
    /// Returns error for a non power-of-two alignment or one smaller than a
    /// relay header plus its payload.
    #[allow(clippy::cast_possible_truncation)]
    pub fn validate(&self) -> Result<()> {
        let min = 2 * CMD_RECORD_SIZE as u32;
        if !self.host_alignment.is_power_of_two() || self.host_alignment < min {
            return Err(TraceError::invalid_config(format!(
                "host alignment {} must be a power of two >= {min}",
                self.host_alignment
            )));
        }
        Ok(())
    }
}

/// On-device kernel-config scratch area for one core class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfigArea {
    /// L1 base address
    pub base: u32,
    /// Size in bytes
    pub size: u32,
}

/// Everything needed to bring up a software mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Mesh identifier, used in diagnostics
    pub mesh_id: u32,
    /// Grid of chips
    pub shape: MeshShape,
    /// Bytes reserved for trace buffers on every chip
    pub trace_region_size: u64,
    /// DRAM banks per chip
    pub num_dram_banks: u32,
    /// Sub-device partitioning, identical on every chip
    pub sub_devices: Vec<SubDeviceTopology>,
    /// NOC coordinate of the dispatcher core
    pub dispatch_core: CoreCoord,
    /// Issue queue size per command queue, in bytes
    pub issue_queue_size: usize,
    /// Fetch queue depth per command queue
    pub fetch_queue_entries: usize,
    /// Hardware command queues per chip
    pub num_command_queues: u8,
    /// Launch message ring entries per worker
    pub launch_msg_ring_entries: u32,
    /// Kernel-config scratch area per core class
    pub kernel_config: [KernelConfigArea; ProgrammableCoreType::COUNT],
    /// Dispatcher layout
    pub dispatch: DispatchConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mesh_id: 0,
            shape: MeshShape::new([2, 4]),
            trace_region_size: 16 * 1024 * 1024,
            num_dram_banks: 12,
            sub_devices: vec![SubDeviceTopology::default()],
            dispatch_core: CoreCoord::new(1, 10),
            issue_queue_size: 256 * 1024,
            fetch_queue_entries: 128,
            num_command_queues: 1,
            launch_msg_ring_entries: 8,
            kernel_config: [
                KernelConfigArea {
                    base: 0x0000_8000,
                    size: 69 * 1024,
                },
                KernelConfigArea {
                    base: 0x0000_2000,
                    size: 4 * 1024,
                },
            ],
            dispatch: DispatchConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Defaults overlaid with the `MESHTRACE_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(size) = env_parse::<u64>(ENV_TRACE_REGION_SIZE)? {
            config.trace_region_size = size;
        }
        if let Some(banks) = env_parse::<u32>(ENV_DRAM_BANKS)? {
            config.num_dram_banks = banks;
        }
        if let Some(on) = env_flag(ENV_DISPATCH_S)? {
            config.dispatch.dispatch_s_enabled = on;
        }
        if let Some(on) = env_flag(ENV_DISTRIBUTED_DISPATCH)? {
            config.dispatch.distributed_dispatcher = on;
        }
        tracing::debug!("Mesh config from environment: {config:?}");
        Ok(config)
    }

    /// Reject configurations the runtime cannot operate
    ///
    /// # Errors
    ///
    /// Returns `TraceError::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        if self.num_dram_banks == 0 {
            return Err(TraceError::invalid_config("num_dram_banks must be non-zero"));
        }
        if self.trace_region_size == 0 {
            return Err(TraceError::invalid_config(
                "trace_region_size must be non-zero",
            ));
        }
        if !self.launch_msg_ring_entries.is_power_of_two() {
            return Err(TraceError::invalid_config(format!(
                "launch_msg_ring_entries {} must be a power of two",
                self.launch_msg_ring_entries
            )));
        }
        if !(1..=2).contains(&self.num_command_queues) {
            return Err(TraceError::invalid_config(format!(
                "num_command_queues {} must be 1 or 2",
                self.num_command_queues
            )));
        }
        if self.fetch_queue_entries == 0 {
            return Err(TraceError::invalid_config(
                "fetch_queue_entries must be non-zero",
            ));
        }
        if self.issue_queue_size < self.dispatch.host_alignment as usize {
            return Err(TraceError::invalid_config(format!(
                "issue_queue_size {} smaller than one aligned command",
                self.issue_queue_size
            )));
        }
        if let Some(area) = self.kernel_config.iter().find(|a| a.size == 0) {
            return Err(TraceError::invalid_config(format!(
                "kernel config area at {:#x} is empty",
                area.base
            )));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TraceError::invalid_config(format!("{name}={raw} does not parse"))),
        Err(_) => Ok(None),
    }
}

fn env_flag(name: &str) -> Result<Option<bool>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(TraceError::invalid_config(format!(
            "{name}={raw} is not a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        MeshConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_small_host_alignment() {
        let mut config = MeshConfig::default();
        config.dispatch.host_alignment = 16;
        assert!(config.validate().is_err());
        config.dispatch.host_alignment = 48;
        assert!(config.validate().is_err());
        config.dispatch.host_alignment = 32;
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_banks() {
        let config = MeshConfig {
            num_dram_banks: 0,
            ..MeshConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TraceError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_rejects_odd_ring_size() {
        let config = MeshConfig {
            launch_msg_ring_entries: 6,
            ..MeshConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mem_map_follows_core_type() {
        let config = DispatchConfig {
            dispatch_core_type: DispatchCoreType::Ethernet,
            ..DispatchConfig::default()
        };
        assert_eq!(config.mem_map().core_type, DispatchCoreType::Ethernet);
    }
}

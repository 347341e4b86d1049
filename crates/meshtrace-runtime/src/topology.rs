//! Sub-device worker topology
//!
//! A chip's worker cores are partitioned into sub-devices. Each sub-device
//! owns a slice of the compute (Tensix) grid and possibly some active
//! Ethernet cores, and the dispatcher reaches them with a fixed set of NOC
//! transactions: multicasts for rectangular Tensix blocks, unicasts for
//! individual Ethernet cores. Those counts are what the replay command needs.

use std::fmt;

use meshtrace_hw::memmap::{ProgrammableCoreType, DISPATCH_MESSAGE_ENTRIES};

use crate::error::{Result, TraceError};

/// Identifier of a sub-device (dispatch channel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubDeviceId(pub u8);

impl SubDeviceId {
    /// Index of the channel's dispatch message slot
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SubDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubDevice{}", self.0)
    }
}

/// NOC coordinate of a core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CoreCoord {
    /// NOC x
    pub x: u8,
    /// NOC y
    pub y: u8,
}

impl CoreCoord {
    /// Create a coordinate
    #[must_use]
    pub const fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(x={},y={})", self.x, self.y)
    }
}

/// Worker layout of one sub-device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubDeviceTopology {
    /// Tensix cores that report completion after a multicast go-signal
    pub num_tensix_workers: u32,
    /// Active Ethernet cores that report completion after a unicast go-signal
    pub num_active_eth_workers: u32,
    /// Multicast transactions needed to reach every Tensix worker
    pub num_noc_mcast_txns: u8,
    /// Unicast transactions needed to reach every Ethernet worker
    pub num_noc_unicast_txns: u8,
    /// First multicast entry in the dispatcher's NOC destination table
    pub noc_mcast_data_start_index: u8,
    /// First unicast entry in the dispatcher's NOC destination table
    pub noc_unicast_data_start_index: u8,
}

impl Default for SubDeviceTopology {
    /// An 8x8 Tensix block with two active Ethernet cores
    fn default() -> Self {
        Self {
            num_tensix_workers: 64,
            num_active_eth_workers: 2,
            num_noc_mcast_txns: 1,
            num_noc_unicast_txns: 2,
            noc_mcast_data_start_index: 0,
            noc_unicast_data_start_index: 1,
        }
    }
}

/// Per-sub-device worker topology queries used by replay dispatch
pub trait WorkerTopology {
    /// Number of sub-devices
    fn num_sub_devices(&self) -> usize;

    /// Worker cores of `core_type` in `sub_device`
    fn num_worker_cores(&self, core_type: ProgrammableCoreType, sub_device: SubDeviceId) -> u32;

    /// Multicast transactions for `sub_device`
    fn num_noc_mcast_txns(&self, sub_device: SubDeviceId) -> u8;

    /// Unicast transactions for `sub_device`
    fn num_noc_unicast_txns(&self, sub_device: SubDeviceId) -> u8;

    /// Start index into the NOC destination table
    ///
    /// Multicast data takes precedence when both kinds are in use. A
    /// sub-device using neither starts at zero.
    fn noc_data_start_index(&self, sub_device: SubDeviceId, mcast: bool, unicast: bool) -> u8;
}

/// Sub-device partitioning of one chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDeviceManager {
    sub_devices: Vec<SubDeviceTopology>,
}

impl SubDeviceManager {
    /// Create a manager over the given sub-devices
    ///
    /// # Errors
    ///
    /// Returns error if there are no sub-devices or more than there are
    /// dispatch message slots.
    pub fn new(sub_devices: Vec<SubDeviceTopology>) -> Result<Self> {
        if sub_devices.is_empty() || sub_devices.len() > DISPATCH_MESSAGE_ENTRIES {
            return Err(TraceError::invalid_config(format!(
                "{} sub-devices configured, need 1..={DISPATCH_MESSAGE_ENTRIES}",
                sub_devices.len()
            )));
        }
        Ok(Self { sub_devices })
    }

    /// Topology of one sub-device
    ///
    /// # Errors
    ///
    /// Returns error if the id is not configured.
    pub fn get(&self, sub_device: SubDeviceId) -> Result<&SubDeviceTopology> {
        self.sub_devices
            .get(sub_device.index())
            .ok_or_else(|| TraceError::out_of_range("sub-device", sub_device, self.sub_devices.len()))
    }

    /// All sub-devices, indexed by id
    #[must_use]
    pub fn sub_devices(&self) -> &[SubDeviceTopology] {
        &self.sub_devices
    }

    fn topology(&self, sub_device: SubDeviceId) -> &SubDeviceTopology {
        &self.sub_devices[sub_device.index()]
    }
}

impl WorkerTopology for SubDeviceManager {
    fn num_sub_devices(&self) -> usize {
        self.sub_devices.len()
    }

    fn num_worker_cores(&self, core_type: ProgrammableCoreType, sub_device: SubDeviceId) -> u32 {
        let t = self.topology(sub_device);
        match core_type {
            ProgrammableCoreType::Tensix => t.num_tensix_workers,
            ProgrammableCoreType::ActiveEth => t.num_active_eth_workers,
        }
    }

    fn num_noc_mcast_txns(&self, sub_device: SubDeviceId) -> u8 {
        self.topology(sub_device).num_noc_mcast_txns
    }

    fn num_noc_unicast_txns(&self, sub_device: SubDeviceId) -> u8 {
        self.topology(sub_device).num_noc_unicast_txns
    }

    fn noc_data_start_index(&self, sub_device: SubDeviceId, mcast: bool, unicast: bool) -> u8 {
        let t = self.topology(sub_device);
        if mcast {
            t.noc_mcast_data_start_index
        } else if unicast {
            t.noc_unicast_data_start_index
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_partition() {
        assert!(SubDeviceManager::new(Vec::new()).is_err());
        assert!(SubDeviceManager::new(vec![SubDeviceTopology::default(); 17]).is_err());
    }

    #[test]
    fn test_worker_counts_by_core_type() {
        let mgr = SubDeviceManager::new(vec![SubDeviceTopology::default()]).unwrap();
        let id = SubDeviceId(0);
        assert_eq!(mgr.num_worker_cores(ProgrammableCoreType::Tensix, id), 64);
        assert_eq!(mgr.num_worker_cores(ProgrammableCoreType::ActiveEth, id), 2);
    }

    #[test]
    fn test_noc_data_start_prefers_multicast() {
        let topo = SubDeviceTopology {
            noc_mcast_data_start_index: 3,
            noc_unicast_data_start_index: 7,
            ..SubDeviceTopology::default()
        };
        let mgr = SubDeviceManager::new(vec![topo]).unwrap();
        let id = SubDeviceId(0);
        assert_eq!(mgr.noc_data_start_index(id, true, true), 3);
        assert_eq!(mgr.noc_data_start_index(id, false, true), 7);
        assert_eq!(mgr.noc_data_start_index(id, false, false), 0);
    }

    #[test]
    fn test_unknown_sub_device_is_out_of_range() {
        let mgr = SubDeviceManager::new(vec![SubDeviceTopology::default()]).unwrap();
        assert!(matches!(
            mgr.get(SubDeviceId(1)),
            Err(TraceError::OutOfRange { .. })
        ));
    }
}

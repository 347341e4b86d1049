//! Dispatch memory map.
//!
//! Every worker core carries a *dispatch message* block in L1: one 16-byte
//! slot per sub-device, holding the counter that workers increment when a
//! launch completes. The dispatcher polls that counter (wait commands) and
//! addresses go-signals to it. The block sits at a different L1 offset
//! depending on which core type runs the dispatcher.
//!
//! ```text
//! dispatch core type   dispatch message base
//! ------------------   ---------------------
//! Worker (Tensix)      0x0000_0190
//! Ethernet             0x0000_7040
//!
//! slot for sub-device i = base + i * 16
//! ```

/// Number of dispatch message slots, hence the upper bound on sub-devices.
pub const DISPATCH_MESSAGE_ENTRIES: usize = 16;

/// L1 alignment of one dispatch message slot.
pub const L1_ALIGNMENT: u32 = 16;

/// Core type hosting the dispatcher firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchCoreType {
    /// Dispatcher runs on a Tensix worker core.
    #[default]
    Worker,
    /// Dispatcher runs on an idle Ethernet core.
    Ethernet,
}

/// Worker core classes that receive go-signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgrammableCoreType {
    /// Compute cores, reached by multicast go-signals.
    Tensix,
    /// Active Ethernet cores, reached by unicast go-signals.
    ActiveEth,
}

impl ProgrammableCoreType {
    /// Number of core classes.
    pub const COUNT: usize = 2;

    /// Every core class, in index order.
    pub const ALL: [Self; Self::COUNT] = [Self::Tensix, Self::ActiveEth];

    /// Dense index, used for per-class tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Tensix => 0,
            Self::ActiveEth => 1,
        }
    }
}

/// Dispatch message layout for one dispatch core type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchMemMap {
    /// Core type this layout applies to.
    pub core_type: DispatchCoreType,
    /// L1 address of the dispatch message block.
    pub dispatch_message_base: u32,
}

impl DispatchMemMap {
    /// Layout used when the dispatcher runs on a worker core.
    pub const WORKER: Self = Self {
        core_type: DispatchCoreType::Worker,
        dispatch_message_base: 0x0000_0190,
    };

    /// Layout used when the dispatcher runs on an Ethernet core.
    pub const ETHERNET: Self = Self {
        core_type: DispatchCoreType::Ethernet,
        dispatch_message_base: 0x0000_7040,
    };

    /// Look up the layout for a dispatch core type.
    #[must_use]
    pub const fn get(core_type: DispatchCoreType) -> &'static Self {
        match core_type {
            DispatchCoreType::Worker => &Self::WORKER,
            DispatchCoreType::Ethernet => &Self::ETHERNET,
        }
    }

    /// Offset of the slot for `sub_device_index` within the block.
    #[must_use]
    pub const fn dispatch_message_offset(&self, sub_device_index: u8) -> u32 {
        sub_device_index as u32 * L1_ALIGNMENT
    }

    /// Absolute L1 address of the slot for `sub_device_index`.
    #[must_use]
    pub const fn dispatch_message_addr(&self, sub_device_index: u8) -> u32 {
        self.dispatch_message_base + self.dispatch_message_offset(sub_device_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_do_not_overlap() {
        let map = DispatchMemMap::get(DispatchCoreType::Worker);
        for i in 1..DISPATCH_MESSAGE_ENTRIES as u8 {
            assert_eq!(
                map.dispatch_message_addr(i) - map.dispatch_message_addr(i - 1),
                L1_ALIGNMENT
            );
        }
    }

    #[test]
    fn core_class_indices_are_dense() {
        for (i, t) in ProgrammableCoreType::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
    }

    #[test]
    fn core_types_have_distinct_bases() {
        assert_ne!(
            DispatchMemMap::get(DispatchCoreType::Worker).dispatch_message_base,
            DispatchMemMap::get(DispatchCoreType::Ethernet).dispatch_message_base
        );
    }

    #[test]
    fn last_slot_offset_fits_in_a_byte() {
        // The go-signal carries the slot offset in a single byte.
        let map = DispatchMemMap::get(DispatchCoreType::Ethernet);
        let last = map.dispatch_message_offset((DISPATCH_MESSAGE_ENTRIES - 1) as u8);
        assert!(u8::try_from(last).is_ok());
    }
}

//! Hardware command-queue records.
//!
//! The host writes command sequences into the issue queue (hugepage system
//! memory). The prefetcher reads them, executes prefetch commands itself
//! and relays everything else to the dispatcher.
//!
//! ## Record layout
//!
//! Every record is 16 bytes, little endian, opcode in byte 0:
//!
//! ```text
//! prefetch RELAY_INLINE / EXEC_BUF_END
//!   [0] opcode  [1] dispatcher  [2..4] pad  [4..8] length  [8..12] stride  [12..16] pad
//! prefetch EXEC_BUF
//!   [0] opcode  [1..4] pad  [4..8] base_addr  [8..12] log_page_size  [12..16] pages
//! dispatch WAIT
//!   [0] opcode  [1] flags  [2..4] pad  [4..8] addr  [8..12] count  [12..16] pad
//! dispatch GO_SIGNAL_MCAST
//!   [0] opcode  [1] mcast txns  [2] unicast txns  [3] noc data start
//!   [4..8] go_signal  [8..12] wait_count  [12..16] wait_addr
//! dispatch NOTIFY_SECONDARY_GO_SIGNAL
//!   [0] opcode  [1] wait  [2..4] index_bitmask  [4..16] pad
//! dispatch EXEC_BUF_END
//!   [0] opcode  [1..16] pad
//! ```
//!
//! A dispatcher-bound command is a prefetch `RELAY_INLINE` record followed
//! by the dispatch record, padded out to the host (PCIe) alignment.

/// Size of one prefetch or dispatch record.
pub const CMD_RECORD_SIZE: usize = 16;

/// Default host (PCIe) alignment for issue-queue commands.
pub const DEFAULT_HOST_ALIGNMENT: u32 = 64;

/// Prefetch opcodes.
pub mod prefetch {
    /// Forward the inline payload to a dispatcher.
    pub const RELAY_INLINE: u8 = 0x05;
    /// Execute a command buffer resident in device DRAM.
    pub const EXEC_BUF: u8 = 0x0A;
    /// End of a resident command buffer; return to the issue queue.
    pub const EXEC_BUF_END: u8 = 0x0B;
}

/// Dispatch opcodes.
pub mod dispatch {
    /// Block until a worker-completion counter reaches a value.
    pub const WAIT: u8 = 0x07;
    /// End of a resident command buffer (dispatcher side).
    pub const EXEC_BUF_END: u8 = 0x0C;
    /// Send a go-signal to the workers of a sub-device.
    pub const GO_SIGNAL_MCAST: u8 = 0x0E;
    /// Tell the secondary dispatcher a go-signal is pending.
    pub const NOTIFY_SECONDARY_GO_SIGNAL: u8 = 0x0F;
}

/// Flag bits of a dispatch `WAIT` record.
pub mod wait_flags {
    /// Wait for all outstanding writes before proceeding.
    pub const BARRIER: u8 = 1 << 0;
    /// Signal the prefetcher once the wait is satisfied.
    pub const NOTIFY_PREFETCH: u8 = 1 << 1;
    /// Reset the counter to zero once the wait is satisfied.
    pub const CLEAR_COUNT: u8 = 1 << 2;
    /// Actually poll the counter (otherwise only barrier/notify).
    pub const WAIT_MEMORY: u8 = 1 << 3;
}

/// Worker run-message signal values carried in a go-signal.
pub mod run_msg {
    /// Kernel finished.
    pub const DONE: u8 = 0x00;
    /// Firmware initialisation.
    pub const INIT: u8 = 0x40;
    /// Start the next queued launch.
    pub const GO: u8 = 0x80;
    /// Reset the launch-message read pointer to slot zero.
    pub const RESET_READ_PTR: u8 = 0xC0;
}

/// Which dispatcher a relayed command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatcherSelect {
    /// The primary dispatcher (`dispatch_d`).
    #[default]
    Primary,
    /// The secondary dispatcher (`dispatch_s`), which owns go-signals when enabled.
    Secondary,
}

impl DispatcherSelect {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }

    const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Primary),
            1 => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// Go-signal word delivered to worker cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GoMsg {
    /// Offset of the sub-device's dispatch message slot.
    pub dispatch_message_offset: u8,
    /// NOC x of the dispatcher that workers report completion to.
    pub master_x: u8,
    /// NOC y of the dispatcher that workers report completion to.
    pub master_y: u8,
    /// One of the [`run_msg`] values.
    pub signal: u8,
}

impl GoMsg {
    /// Pack into the 32-bit word carried by `GO_SIGNAL_MCAST`.
    #[must_use]
    pub const fn to_word(self) -> u32 {
        u32::from_le_bytes([
            self.dispatch_message_offset,
            self.master_x,
            self.master_y,
            self.signal,
        ])
    }

    /// Unpack from a go-signal word.
    #[must_use]
    pub const fn from_word(word: u32) -> Self {
        let [dispatch_message_offset, master_x, master_y, signal] = word.to_le_bytes();
        Self {
            dispatch_message_offset,
            master_x,
            master_y,
            signal,
        }
    }
}

/// A prefetch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchCmd {
    /// Relay `length` inline bytes to `dispatcher`; next record at `stride`.
    RelayInline {
        /// Target dispatcher.
        dispatcher: DispatcherSelect,
        /// Payload length in bytes.
        length: u32,
        /// Distance from this record to the next command.
        stride: u32,
    },
    /// Execute the resident buffer at `base_addr`.
    ExecBuf {
        /// Device address of the buffer.
        base_addr: u32,
        /// log2 of the buffer page size.
        log_page_size: u32,
        /// Number of pages to fetch.
        pages: u32,
    },
    /// Terminates a resident buffer; relays the dispatcher-side end marker.
    ExecBufEnd {
        /// Payload length in bytes.
        length: u32,
        /// Distance from this record to the next command.
        stride: u32,
    },
}

impl PrefetchCmd {
    /// Encode into a 16-byte record.
    #[must_use]
    pub fn encode(&self) -> [u8; CMD_RECORD_SIZE] {
        let mut rec = [0u8; CMD_RECORD_SIZE];
        match *self {
            Self::RelayInline {
                dispatcher,
                length,
                stride,
            } => {
                rec[0] = prefetch::RELAY_INLINE;
                rec[1] = dispatcher.to_byte();
                rec[4..8].copy_from_slice(&length.to_le_bytes());
                rec[8..12].copy_from_slice(&stride.to_le_bytes());
            }
            Self::ExecBuf {
                base_addr,
                log_page_size,
                pages,
            } => {
                rec[0] = prefetch::EXEC_BUF;
                rec[4..8].copy_from_slice(&base_addr.to_le_bytes());
                rec[8..12].copy_from_slice(&log_page_size.to_le_bytes());
                rec[12..16].copy_from_slice(&pages.to_le_bytes());
            }
            Self::ExecBufEnd { length, stride } => {
                rec[0] = prefetch::EXEC_BUF_END;
                rec[4..8].copy_from_slice(&length.to_le_bytes());
                rec[8..12].copy_from_slice(&stride.to_le_bytes());
            }
        }
        rec
    }

    /// Decode a 16-byte record. Returns `None` for unknown opcodes or short input.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let rec = bytes.get(..CMD_RECORD_SIZE)?;
        match rec[0] {
            prefetch::RELAY_INLINE => Some(Self::RelayInline {
                dispatcher: DispatcherSelect::from_byte(rec[1])?,
                length: word(rec, 4),
                stride: word(rec, 8),
            }),
            prefetch::EXEC_BUF => Some(Self::ExecBuf {
                base_addr: word(rec, 4),
                log_page_size: word(rec, 8),
                pages: word(rec, 12),
            }),
            prefetch::EXEC_BUF_END => Some(Self::ExecBufEnd {
                length: word(rec, 4),
                stride: word(rec, 8),
            }),
            _ => None,
        }
    }
}

/// A dispatch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchCmd {
    /// Wait on a worker-completion counter.
    Wait {
        /// Combination of [`wait_flags`] bits.
        flags: u8,
        /// L1 address of the counter.
        addr: u32,
        /// Value to wait for.
        count: u32,
    },
    /// Send a go-signal after `wait_count` completions were seen at `wait_addr`.
    GoSignalMcast {
        /// Packed [`GoMsg`].
        go_signal: u32,
        /// Completions to wait for before sending.
        wait_count: u32,
        /// Counter polled before sending.
        wait_addr: u32,
        /// Multicast NOC transactions to issue.
        num_mcast_txns: u8,
        /// Unicast NOC transactions to issue.
        num_unicast_txns: u8,
        /// First entry of the NOC destination table to use.
        noc_data_start_index: u8,
    },
    /// Tell the secondary dispatcher which sub-devices have a pending go-signal.
    NotifySecondaryGoSignal {
        /// Whether the secondary dispatcher must wait before sending.
        wait: bool,
        /// Bit `i` set for sub-device `i`.
        index_bitmask: u16,
    },
    /// Dispatcher-side end of a resident buffer.
    ExecBufEnd,
}

impl DispatchCmd {
    /// Encode into a 16-byte record.
    #[must_use]
    pub fn encode(&self) -> [u8; CMD_RECORD_SIZE] {
        let mut rec = [0u8; CMD_RECORD_SIZE];
        match *self {
            Self::Wait { flags, addr, count } => {
                rec[0] = dispatch::WAIT;
                rec[1] = flags;
                rec[4..8].copy_from_slice(&addr.to_le_bytes());
                rec[8..12].copy_from_slice(&count.to_le_bytes());
            }
            Self::GoSignalMcast {
                go_signal,
                wait_count,
                wait_addr,
                num_mcast_txns,
                num_unicast_txns,
                noc_data_start_index,
            } => {
                rec[0] = dispatch::GO_SIGNAL_MCAST;
                rec[1] = num_mcast_txns;
                rec[2] = num_unicast_txns;
                rec[3] = noc_data_start_index;
                rec[4..8].copy_from_slice(&go_signal.to_le_bytes());
                rec[8..12].copy_from_slice(&wait_count.to_le_bytes());
                rec[12..16].copy_from_slice(&wait_addr.to_le_bytes());
            }
            Self::NotifySecondaryGoSignal {
                wait,
                index_bitmask,
            } => {
                rec[0] = dispatch::NOTIFY_SECONDARY_GO_SIGNAL;
                rec[1] = u8::from(wait);
                rec[2..4].copy_from_slice(&index_bitmask.to_le_bytes());
            }
            Self::ExecBufEnd => rec[0] = dispatch::EXEC_BUF_END,
        }
        rec
    }

    /// Decode a 16-byte record. Returns `None` for unknown opcodes or short input.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let rec = bytes.get(..CMD_RECORD_SIZE)?;
        match rec[0] {
            dispatch::WAIT => Some(Self::Wait {
                flags: rec[1],
                addr: word(rec, 4),
                count: word(rec, 8),
            }),
            dispatch::GO_SIGNAL_MCAST => Some(Self::GoSignalMcast {
                num_mcast_txns: rec[1],
                num_unicast_txns: rec[2],
                noc_data_start_index: rec[3],
                go_signal: word(rec, 4),
                wait_count: word(rec, 8),
                wait_addr: word(rec, 12),
            }),
            dispatch::NOTIFY_SECONDARY_GO_SIGNAL => Some(Self::NotifySecondaryGoSignal {
                wait: rec[1] != 0,
                index_bitmask: u16::from_le_bytes([rec[2], rec[3]]),
            }),
            dispatch::EXEC_BUF_END => Some(Self::ExecBufEnd),
            _ => None,
        }
    }
}

fn word(rec: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([rec[at], rec[at + 1], rec[at + 2], rec[at + 3]])
}

/// Fetch-queue entries.
///
/// Each entry tells the prefetcher how many bytes of the issue queue make
/// up the next command sequence, in 16-byte units, with the top bit asking
/// the prefetcher to stall until that sequence completes.
pub mod fetch_q {
    /// Granularity of the size field.
    pub const SIZE_UNIT: u32 = 16;
    /// Stall-prefetcher flag.
    pub const STALL_FLAG: u16 = 1 << 15;
    /// Largest encodable command sequence.
    pub const MAX_SIZE: u32 = (STALL_FLAG as u32 - 1) * SIZE_UNIT;

    /// Encode an entry.
    ///
    /// # Panics
    ///
    /// Panics when `size_bytes` is not a multiple of [`SIZE_UNIT`] or exceeds [`MAX_SIZE`].
    #[must_use]
    pub fn encode(size_bytes: u32, stall: bool) -> u16 {
        assert!(
            size_bytes % SIZE_UNIT == 0 && size_bytes <= MAX_SIZE,
            "fetch queue entry size {size_bytes} not encodable"
        );
        #[allow(clippy::cast_possible_truncation)]
        let units = (size_bytes / SIZE_UNIT) as u16;
        if stall {
            units | STALL_FLAG
        } else {
            units
        }
    }

    /// Decode an entry into `(size_bytes, stall)`.
    #[must_use]
    pub fn decode(entry: u16) -> (u32, bool) {
        (
            u32::from(entry & !STALL_FLAG) * SIZE_UNIT,
            entry & STALL_FLAG != 0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_msg_packs_signal_in_top_byte() {
        let msg = GoMsg {
            dispatch_message_offset: 0x20,
            master_x: 1,
            master_y: 11,
            signal: run_msg::RESET_READ_PTR,
        };
        assert_eq!(msg.to_word(), 0xC00B_0120);
        assert_eq!(GoMsg::from_word(msg.to_word()), msg);
    }

    #[test]
    fn exec_buf_record_layout() {
        let rec = PrefetchCmd::ExecBuf {
            base_addr: 0x1000,
            log_page_size: 12,
            pages: 3,
        }
        .encode();
        assert_eq!(rec[0], prefetch::EXEC_BUF);
        assert_eq!(&rec[4..8], &0x1000u32.to_le_bytes());
        assert_eq!(&rec[8..12], &12u32.to_le_bytes());
        assert_eq!(&rec[12..16], &3u32.to_le_bytes());
    }

    #[test]
    fn wait_record_decodes() {
        let cmd = DispatchCmd::Wait {
            flags: wait_flags::CLEAR_COUNT | wait_flags::WAIT_MEMORY,
            addr: 0x190,
            count: 72,
        };
        assert_eq!(DispatchCmd::decode(&cmd.encode()), Some(cmd));
    }

    #[test]
    fn unknown_opcode_does_not_decode() {
        assert_eq!(PrefetchCmd::decode(&[0xFF; CMD_RECORD_SIZE]), None);
        assert_eq!(DispatchCmd::decode(&[0xFF; CMD_RECORD_SIZE]), None);
        assert_eq!(DispatchCmd::decode(&[dispatch::WAIT; 4]), None);
    }

    #[test]
    fn fetch_entry_carries_stall_bit() {
        let e = fetch_q::encode(256, true);
        assert_eq!(e, 16 | fetch_q::STALL_FLAG);
        assert_eq!(fetch_q::decode(e), (256, true));
        assert_eq!(fetch_q::decode(fetch_q::encode(64, false)), (64, false));
    }

    #[test]
    #[should_panic(expected = "not encodable")]
    fn fetch_entry_rejects_unaligned_size() {
        let _ = fetch_q::encode(20, false);
    }
}

//! Device command sequence builder
//!
//! A [`DeviceCommand`] is a fixed-capacity byte buffer that the host fills
//! with prefetch records and relayed dispatch records before handing it to
//! the issue queue. Every `add_*` call appends exactly one host-aligned
//! command, so callers can predict the final size up front.

use bytes::{BufMut, Bytes, BytesMut};
use meshtrace_hw::align_up;
use meshtrace_hw::cq::{DispatchCmd, DispatcherSelect, PrefetchCmd, CMD_RECORD_SIZE};

/// Stride of a relayed command: relay header plus payload, host aligned
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn relayed_cmd_size(host_alignment: u32) -> u32 {
    align_up(2 * CMD_RECORD_SIZE as u64, host_alignment as u64) as u32
}

/// Builder for one issue-queue command sequence
#[derive(Debug, Clone)]
pub struct DeviceCommand {
    buf: BytesMut,
    capacity: usize,
    alignment: u32,
}

impl DeviceCommand {
    /// Empty sequence that may grow to `capacity` bytes
    #[must_use]
    pub fn new(capacity: usize, host_alignment: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            alignment: host_alignment,
        }
    }

    /// Bytes written so far
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Size the sequence was reserved with
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Written bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Finish the sequence
    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    fn claim(&mut self, len: usize) {
        assert!(
            self.buf.len() + len <= self.capacity,
            "command sequence overflows its {}B reservation",
            self.capacity
        );
    }

    fn pad_to(&mut self, end: usize) {
        self.buf.resize(end, 0);
    }

    fn relay(&mut self, header: PrefetchCmd, stride: u32, cmd: DispatchCmd) {
        let start = self.buf.len();
        self.claim(stride as usize);
        self.buf.put_slice(&header.encode());
        self.buf.put_slice(&cmd.encode());
        self.pad_to(start + stride as usize);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn relay_inline(&mut self, dispatcher: DispatcherSelect, cmd: DispatchCmd) {
        let stride = relayed_cmd_size(self.alignment);
        let header = PrefetchCmd::RelayInline {
            dispatcher,
            length: CMD_RECORD_SIZE as u32,
            stride,
        };
        self.relay(header, stride, cmd);
    }

    /// Tell the secondary dispatcher which sub-devices get a go-signal
    pub fn add_notify_dispatch_s_go_signal_cmd(&mut self, wait: bool, index_bitmask: u16) {
        self.relay_inline(
            DispatcherSelect::Primary,
            DispatchCmd::NotifySecondaryGoSignal {
                wait,
                index_bitmask,
            },
        );
    }

    /// Send `go_signal` once `wait_count` completions are seen at `wait_addr`
    #[allow(clippy::too_many_arguments)]
    pub fn add_dispatch_go_signal_mcast(
        &mut self,
        wait_count: u32,
        go_signal: u32,
        wait_addr: u32,
        num_mcast_txns: u8,
        num_unicast_txns: u8,
        noc_data_start_index: u8,
        dispatcher: DispatcherSelect,
    ) {
        self.relay_inline(
            dispatcher,
            DispatchCmd::GoSignalMcast {
                go_signal,
                wait_count,
                wait_addr,
                num_mcast_txns,
                num_unicast_txns,
                noc_data_start_index,
            },
        );
    }

    /// Block `dispatcher` until the counter at `addr` reaches `count`
    ///
    /// `flags` is a combination of [`meshtrace_hw::cq::wait_flags`] bits.
    pub fn add_dispatch_wait(
        &mut self,
        flags: u8,
        addr: u32,
        count: u32,
        dispatcher: DispatcherSelect,
    ) {
        self.relay_inline(dispatcher, DispatchCmd::Wait { flags, addr, count });
    }

    /// Execute `pages` pages of the resident buffer at `base_addr`
    pub fn add_prefetch_exec_buf(&mut self, base_addr: u32, log_page_size: u32, pages: u32) {
        let start = self.buf.len();
        let stride = align_up(CMD_RECORD_SIZE as u64, u64::from(self.alignment));
        #[allow(clippy::cast_possible_truncation)]
        let stride = stride as usize;
        self.claim(stride);
        self.buf.put_slice(
            &PrefetchCmd::ExecBuf {
                base_addr,
                log_page_size,
                pages,
            }
            .encode(),
        );
        self.pad_to(start + stride);
    }

    /// Terminate a resident buffer
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_prefetch_exec_buf_end(&mut self) {
        let stride = relayed_cmd_size(self.alignment);
        let header = PrefetchCmd::ExecBufEnd {
            length: CMD_RECORD_SIZE as u32,
            stride,
        };
        self.relay(header, stride, DispatchCmd::ExecBufEnd);
    }
}

/// One decoded command of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRecord {
    /// A prefetch command executed by the prefetcher itself
    Prefetch(PrefetchCmd),
    /// A dispatch command behind its relay header
    Relayed {
        /// Relay (or exec-buf-end) header
        header: PrefetchCmd,
        /// Payload for the dispatcher
        cmd: DispatchCmd,
    },
}

/// Walk a command sequence
///
/// Stops at the first record that does not decode, which includes the zero
/// padding at the end of a page-aligned trace buffer.
#[must_use]
pub fn parse_commands(bytes: &[u8], host_alignment: u32) -> Vec<CommandRecord> {
    #[allow(clippy::cast_possible_truncation)]
    let plain_stride = align_up(CMD_RECORD_SIZE as u64, u64::from(host_alignment)) as usize;
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let Some(header) = PrefetchCmd::decode(&bytes[offset..]) else {
            break;
        };
        match header {
            PrefetchCmd::RelayInline { stride, .. } | PrefetchCmd::ExecBufEnd { stride, .. } => {
                let Some(cmd) = bytes
                    .get(offset + CMD_RECORD_SIZE..)
                    .and_then(DispatchCmd::decode)
                else {
                    break;
                };
                records.push(CommandRecord::Relayed { header, cmd });
                if stride == 0 {
                    break;
                }
                offset += stride as usize;
            }
            PrefetchCmd::ExecBuf { .. } => {
                records.push(CommandRecord::Prefetch(header));
                offset += plain_stride;
            }
        }
    }
    records
}

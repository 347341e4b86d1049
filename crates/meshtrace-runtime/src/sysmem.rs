//! Host system memory manager
//!
//! Each chip has, per hardware command queue, an issue queue (a ring of
//! command bytes in host memory) and a fetch queue (16-bit entries telling
//! the prefetcher how much of the issue queue to read next). While a trace
//! is being captured on a queue, that queue's commands are diverted into
//! its own bypass buffer instead; the trace assembler later takes those
//! bytes out. Captures on different queues never see each other's bytes.
//!
//! This software model keeps every fetched command sequence in an
//! `issued` log so callers can inspect exactly what reached the device.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use meshtrace_hw::cq::fetch_q;
use tracing::{debug, trace};

use crate::error::{Result, TraceError};

/// A command sequence handed to the prefetcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCommand {
    /// Fetch-queue entry that announced the sequence
    pub fetch_entry: u16,
    /// Bytes read from the issue queue
    pub data: Bytes,
}

impl IssuedCommand {
    /// Whether the prefetcher was told to stall on this sequence
    #[must_use]
    pub fn stalls_prefetcher(&self) -> bool {
        fetch_q::decode(self.fetch_entry).1
    }
}

#[derive(Debug)]
struct CommandQueueInterface {
    issue_queue: Vec<u8>,
    issue_wr_ptr: usize,
    last_push: Option<(usize, usize)>,
    fetch_queue: VecDeque<u16>,
    fetch_queue_depth: usize,
    issued: Vec<IssuedCommand>,
    bypass_enabled: bool,
    bypass_buffer: BytesMut,
}

impl CommandQueueInterface {
    fn new(issue_queue_size: usize, fetch_queue_depth: usize) -> Self {
        Self {
            issue_queue: vec![0; issue_queue_size],
            issue_wr_ptr: 0,
            last_push: None,
            fetch_queue: VecDeque::with_capacity(fetch_queue_depth),
            fetch_queue_depth,
            issued: Vec::new(),
            bypass_enabled: false,
            bypass_buffer: BytesMut::new(),
        }
    }
}

/// Issue/fetch queues of one chip plus their trace-capture bypass buffers
#[derive(Debug)]
pub struct SystemMemoryManager {
    device_id: u32,
    queues: Vec<CommandQueueInterface>,
}

impl SystemMemoryManager {
    /// Manager with `num_cqs` command queues
    #[must_use]
    pub fn new(
        device_id: u32,
        num_cqs: u8,
        issue_queue_size: usize,
        fetch_queue_depth: usize,
    ) -> Self {
        Self {
            device_id,
            queues: (0..num_cqs)
                .map(|_| CommandQueueInterface::new(issue_queue_size, fetch_queue_depth))
                .collect(),
        }
    }

    /// Chip this manager belongs to
    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.device_id
    }

    fn queue_mut(&mut self, cq_id: u8) -> &mut CommandQueueInterface {
        &mut self.queues[usize::from(cq_id)]
    }

    /// Writable issue-queue region of `size` bytes
    ///
    /// Wraps to the start of the ring when the tail cannot hold `size`.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::IssueQueueFull` if `size` exceeds the ring.
    pub fn issue_queue_reserve(&mut self, size: usize, cq_id: u8) -> Result<&mut [u8]> {
        let queue = self.queue_mut(cq_id);
        let capacity = queue.issue_queue.len();
        if size > capacity {
            return Err(TraceError::IssueQueueFull {
                requested: size,
                capacity,
            });
        }
        if queue.issue_wr_ptr + size > capacity {
            trace!("Issue queue {cq_id} wraps");
            queue.issue_wr_ptr = 0;
        }
        let start = queue.issue_wr_ptr;
        Ok(&mut queue.issue_queue[start..start + size])
    }

    /// Commit `size` reserved bytes
    pub fn issue_queue_push_back(&mut self, size: usize, cq_id: u8) {
        let queue = self.queue_mut(cq_id);
        queue.last_push = Some((queue.issue_wr_ptr, size));
        queue.issue_wr_ptr += size;
    }

    /// Make room for one fetch-queue entry
    ///
    /// The software prefetcher consumes entries eagerly, so a full queue
    /// retires its oldest entry.
    pub fn fetch_queue_reserve_back(&mut self, cq_id: u8) {
        let queue = self.queue_mut(cq_id);
        if queue.fetch_queue.len() == queue.fetch_queue_depth {
            queue.fetch_queue.pop_front();
        }
    }

    /// Announce the last pushed `size` bytes to the prefetcher
    ///
    /// # Panics
    ///
    /// Panics if nothing was pushed to the issue queue, or if `size` does
    /// not match that push.
    #[allow(clippy::cast_possible_truncation)]
    pub fn fetch_queue_write(&mut self, size: usize, cq_id: u8, stall_prefetcher: bool) {
        let device_id = self.device_id;
        let queue = self.queue_mut(cq_id);
        let entry = fetch_q::encode(size as u32, stall_prefetcher);
        queue.fetch_queue.push_back(entry);
        let Some((offset, pushed)) = queue.last_push.take() else {
            panic!("fetch queue write without an issue queue push");
        };
        assert_eq!(pushed, size, "fetch queue entry disagrees with issue queue push");
        let data = Bytes::copy_from_slice(&queue.issue_queue[offset..offset + size]);
        debug!("Device {device_id} cq {cq_id}: fetched {size}B (stall={stall_prefetcher})");
        queue.issued.push(IssuedCommand {
            fetch_entry: entry,
            data,
        });
    }

    /// Command sequences issued on `cq_id`, oldest first
    #[must_use]
    pub fn issued(&self, cq_id: u8) -> &[IssuedCommand] {
        &self.queues[usize::from(cq_id)].issued
    }

    /// Take and clear the issued log of `cq_id`
    pub fn take_issued(&mut self, cq_id: u8) -> Vec<IssuedCommand> {
        std::mem::take(&mut self.queue_mut(cq_id).issued)
    }

    /// Switch trace-capture bypass of `cq_id` on or off, optionally
    /// dropping its contents
    pub fn set_bypass_mode(&mut self, enable: bool, clear: bool, cq_id: u8) {
        let queue = self.queue_mut(cq_id);
        queue.bypass_enabled = enable;
        if clear {
            queue.bypass_buffer.clear();
        }
    }

    /// Whether commands on `cq_id` are being captured
    #[must_use]
    pub fn bypass_enabled(&self, cq_id: u8) -> bool {
        self.queues[usize::from(cq_id)].bypass_enabled
    }

    /// Bytes captured on `cq_id` so far
    #[must_use]
    pub fn bypass_len(&self, cq_id: u8) -> usize {
        self.queues[usize::from(cq_id)].bypass_buffer.len()
    }

    /// Append captured command bytes for `cq_id`, returning their offset
    ///
    /// # Panics
    ///
    /// Panics if bypass mode is off on `cq_id`.
    pub fn write_bypass(&mut self, data: &[u8], cq_id: u8) -> usize {
        let device_id = self.device_id;
        let queue = self.queue_mut(cq_id);
        assert!(
            queue.bypass_enabled,
            "device {device_id} is not capturing on cq {cq_id}"
        );
        let offset = queue.bypass_buffer.len();
        queue.bypass_buffer.extend_from_slice(data);
        offset
    }

    /// Move the bytes captured on `cq_id` out, leaving its bypass buffer empty
    pub fn take_bypass_data(&mut self, cq_id: u8) -> Bytes {
        self.queue_mut(cq_id).bypass_buffer.split().freeze()
    }
}

//! Trace region allocator
//!
//! Every chip reserves the same DRAM window for trace buffers. Buffers are
//! replicated, so one allocator serves the whole mesh: first fit over the
//! gaps between live allocations, with the running total capped at the
//! region size.

use std::collections::BTreeMap;

use meshtrace_hw::align_up;

use crate::error::{Result, TraceError};

/// First-fit allocator over a mesh's trace region
#[derive(Debug, Clone)]
pub struct TraceRegionAllocator {
    mesh_id: u32,
    region_size: u64,
    allocations: BTreeMap<u64, u64>,
    in_use: u64,
}

impl TraceRegionAllocator {
    /// Allocator over `region_size` bytes
    #[must_use]
    pub const fn new(mesh_id: u32, region_size: u64) -> Self {
        Self {
            mesh_id,
            region_size,
            allocations: BTreeMap::new(),
            in_use: 0,
        }
    }

    /// Region capacity
    #[must_use]
    pub const fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Bytes held by live trace buffers
    #[must_use]
    pub const fn trace_buffers_size(&self) -> u64 {
        self.in_use
    }

    /// Live allocations
    #[must_use]
    pub fn num_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Reserve `size` bytes aligned to `alignment`
    ///
    /// # Errors
    ///
    /// Returns `TraceError::TraceRegionExhausted` when the total of live
    /// trace buffers would exceed the region, or no gap is large enough.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<u64> {
        let requested = self.in_use + size;
        let exhausted = TraceError::TraceRegionExhausted {
            mesh_id: self.mesh_id,
            requested,
            region_size: self.region_size,
        };
        if requested > self.region_size {
            return Err(exhausted);
        }
        let mut candidate = 0u64;
        for (&addr, &len) in &self.allocations {
            if candidate + size <= addr {
                break;
            }
            candidate = align_up(addr + len, alignment);
        }
        if candidate + size > self.region_size {
            return Err(exhausted);
        }
        self.allocations.insert(candidate, size);
        self.in_use = requested;
        tracing::debug!(
            "Trace region: {size}B at {candidate:#x} ({}/{}B in use)",
            self.in_use,
            self.region_size
        );
        Ok(candidate)
    }

    /// Release the allocation at `addr`, returning its size
    pub fn free(&mut self, addr: u64) -> Option<u64> {
        let size = self.allocations.remove(&addr)?;
        self.in_use -= size;
        Some(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_reuses_gaps() {
        let mut alloc = TraceRegionAllocator::new(0, 0x4000);
        let a = alloc.allocate(0x1000, 0x400).unwrap();
        let b = alloc.allocate(0x1000, 0x400).unwrap();
        assert_eq!((a, b), (0, 0x1000));
        assert_eq!(alloc.free(a), Some(0x1000));
        assert_eq!(alloc.allocate(0x800, 0x400).unwrap(), 0);
        assert_eq!(alloc.trace_buffers_size(), 0x1800);
    }

    #[test]
    fn test_exhaustion_reports_totals() {
        let mut alloc = TraceRegionAllocator::new(7, 0x2000);
        alloc.allocate(0x1800, 0x400).unwrap();
        let err = alloc.allocate(0x1000, 0x400).unwrap_err();
        assert!(matches!(
            err,
            TraceError::TraceRegionExhausted {
                mesh_id: 7,
                requested: 0x2800,
                region_size: 0x2000
            }
        ));
        assert_eq!(alloc.num_allocations(), 1);
    }

    #[test]
    fn test_fragmentation_is_exhaustion() {
        let mut alloc = TraceRegionAllocator::new(0, 0x3000);
        let a = alloc.allocate(0x1000, 0x1000).unwrap();
        alloc.allocate(0x1000, 0x1000).unwrap();
        alloc.free(a);
        // 0x1000 free at the front, 0x1000 at the back: no room for 0x1800.
        assert!(alloc.allocate(0x1800, 0x1000).is_err());
        assert_eq!(alloc.free(0x5000), None);
    }
}

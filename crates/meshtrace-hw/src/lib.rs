//! Pure model of the accelerator mesh dispatch ABI.
//!
//! This crate has **no dependencies** and **no hardware access**. It
//! describes what the host and the on-chip prefetcher/dispatcher agree on:
//! the packed command records that travel through the hardware command
//! queue, the go-signal word, the fetch-queue entry format, where the
//! dispatch message block lives for each core type, and the coordinate
//! space of a multi-chip mesh.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`cq`] | Prefetch / dispatch opcodes, 16-byte command records, go-signal, fetch-queue entries |
//! | [`memmap`] | Dispatch message addresses per core type, sub-device slots |
//! | [`mesh`] | Mesh shape, coordinates, rectangular ranges and range-set subtraction |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cq;
pub mod memmap;
pub mod mesh;

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be non-zero.
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

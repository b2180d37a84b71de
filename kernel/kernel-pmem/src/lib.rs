//! # Physical Page Management
//!
//! Discovers usable physical memory from the boot memory map and manages it
//! as 2 MiB superpages through a zoned buddy allocator.
//!
//! ## Initialization Pipeline
//!
//! ```text
//! boot memory map ──► scan ──► descriptor array placement
//!                              │
//!                              ▼
//!                :   reset / reserve / mark usable
//!                              │
//!                              ▼
//!            zone ──► classify (DMA / low / UMA / NUMA)
//!                              │
//!                              ▼
//!           buddy ──► free lists over the descriptors
//! ```
//!
//! 1. [`scan`] computes the physical span, sizes the descriptor array, and
//!    picks a usable superpage-aligned region to host it. It also applies
//!    the boot map to the descriptors: the low memory reservation and the
//!    metadata region become used, whole superpages inside usable ranges
//!    become usable.
//! 2. [`zone`] fixes every page's zone once; the allocator never moves a
//!    page between zones afterwards.
//! 3. [`buddy`] builds per-(zone, order) free lists and serves power-of-two
//!    allocations with coalescing frees.
//!
//! The crate never touches hardware and holds no memory of its own: the
//! caller owns the descriptor array (typically carved out of the region the
//! scan selected) and lends it to [`PhysicalMemory`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod buddy;
pub mod page;
pub mod scan;
pub mod zone;

pub use buddy::{FreeLists, PhysicalMemory, MAX_BUDDY_ORDER, ORDER_COUNT};
pub use page::{PageDescriptor, PageFlags, PageIndex};
pub use zone::Zone;

/// Errors of the physical page layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmemError {
    /// No free block at or above the requested order in the requested zone.
    #[error("out of physical memory")]
    OutOfMemory,
    /// A bookkeeping structure cannot be placed within the bounds set for it.
    #[error("bookkeeping layout overflow")]
    LayoutOverflow,
}

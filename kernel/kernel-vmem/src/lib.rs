//! # Virtual Memory
//!
//! x86-64 paging for the kernel: typed page-table structures, the kernel's
//! own address space, and per-process address spaces.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │       │
//!   │        │        │       └───► PTE   (Page Table Entry) → maps a 4 KiB page
//!   │        │        └───────────► PDE   (Page Directory Entry) → PS=1 → 2 MiB page
//!   │        └────────────────────► PDPTE (Page Directory Pointer Table Entry)
//!   └─────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! This kernel uses exactly two leaf sizes: 2 MiB superpages (a PDE with
//! `PS=1`) for everything the kernel maps for itself, and 4 KiB pages (a PTE
//! through a fourth-level table) available to process address spaces. 1 GiB
//! leaves are never installed.
//!
//! ## The two address-space layers
//!
//! [`kernel_space::KernelSpace`] is built once at boot: a three-table
//! hierarchy fixing the kernel to one 1 GiB window, a logical page array
//! describing that window superpage by superpage, and a pool of raw 4 KiB
//! pages for later page-table needs.
//!
//! [`process_space::ProcessAddressSpace`] is built per process from that
//! pool: its own top tables plus a fixed set of page directories, with the
//! kernel window aliased in so the kernel stays reachable after a switch.
//!
//! ## Seams
//!
//! The crate touches hardware through two small traits so everything above
//! them runs in host tests: [`PhysMapper`] turns physical addresses into
//! references (the kernel's low-window linear map, or simulated RAM in
//! tests) and [`PagingHardware`] carries the privileged primitives (root
//! load, `invlpg`, the global-page toggle).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod hardware;
pub mod kernel_space;
pub mod page_table;
pub mod process_space;

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

pub use hardware::X86Paging;
pub use kernel_space::KernelSpace;
pub use process_space::ProcessAddressSpace;

/// Errors of the virtual-memory layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmemError {
    /// The table-page pool or the kernel page region is exhausted.
    #[error("out of kernel memory")]
    OutOfMemory,
    /// Misaligned, out-of-window, or out-of-range address.
    #[error("invalid address")]
    InvalidAddress,
    /// The logical page flags do not permit the mapping.
    #[error("invalid page flags")]
    InvalidFlags,
    /// The requested granularity is not available at this address.
    #[error("unsupported mapping granularity")]
    UnsupportedGranularity,
    /// The bootstrap structures exceed their reserved region.
    #[error("bootstrap layout overflow")]
    LayoutOverflow,
    /// The logical page already has a physical backing.
    #[error("already mapped")]
    AlreadyMapped,
    /// No mapping is installed at the address.
    #[error("not mapped")]
    NotMapped,
}

/// Mapping granularity for process address spaces.
///
/// The kernel window itself is superpage-only; the distinction matters for
/// [`ProcessAddressSpace::map`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Granularity {
    /// 4 KiB page mapped by a PTE through a fourth-level table.
    Page4K,
    /// 2 MiB superpage mapped directly by a page-directory entry.
    Page2M,
}

/// Caller-selected attributes for process mappings.
///
/// Process mappings are always present, writable and user-accessible; the
/// one toggle is whether the translation survives root-table reloads.
#[bitfield(u8)]
pub struct MapFlags {
    /// Keep the translation cached across address-space switches.
    pub global: bool,
    #[bits(7)]
    __: u8,
}

/// Converts physical addresses to usable references in the current virtual
/// address space.
///
/// The kernel implements this with its low-window linear map (virtual equals
/// window base plus physical); tests substitute simulated RAM.
///
/// # Safety
/// - `pa` must refer to memory that is mapped and writable in the current
///   address space for the whole lifetime `'a`.
/// - `T` must match the bytes at `pa`, and no other live reference may
///   alias them.
pub trait PhysMapper {
    /// Convert a physical address to a mutable reference.
    ///
    /// # Safety
    /// See the trait-level contract; the caller vouches for mapping,
    /// lifetime, and aliasing.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// The privileged paging primitives the platform supplies.
///
/// [`X86Paging`] executes them on the current processor; tests record them
/// instead. TLB invalidation only affects the invoking processor.
pub trait PagingHardware {
    /// Install `root` as the active top-level table.
    ///
    /// # Safety
    /// The hierarchy under `root` must map the executing code and all live
    /// kernel data, or the switch faults.
    unsafe fn load_root(&self, root: PhysicalPage<Size4K>);

    /// Drop any cached translation for `va` on the current processor.
    fn invalidate(&self, va: VirtualAddress);

    /// Turn the global-page feature off, so global TLB entries flush on the
    /// next root load.
    ///
    /// # Safety
    /// Changes translation behavior system-wide; only meant for the
    /// one-time bootstrap switch.
    unsafe fn disable_global_pages(&self);

    /// Turn the global-page feature back on.
    ///
    /// # Safety
    /// Must pair with [`disable_global_pages`](Self::disable_global_pages)
    /// around a root load.
    unsafe fn enable_global_pages(&self);
}

/// Materialize the page table of type `T` stored at `page`.
///
/// # Safety
/// `page` must hold a valid, writable table of type `T` with no other live
/// reference to it.
#[inline]
pub(crate) unsafe fn table_at<'a, M: PhysMapper, T>(m: &M, page: PhysicalPage<Size4K>) -> &'a mut T {
    unsafe { m.phys_to_mut::<T>(page.base()) }
}

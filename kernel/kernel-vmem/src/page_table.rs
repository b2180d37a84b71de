//! # Page-Table Structures
//!
//! Typed building blocks for the paging hierarchy: a 64-bit entry, the
//! 4 KiB table of 512 such entries, and index types for the virtual-address
//! bit fields.
//!
//! All four levels share one entry layout; only the meaning of bit 7
//! differs. In a non-leaf entry `PS` must be 0 and the address names the
//! next-level table. In a second-level (1 GiB) or third-level (2 MiB) entry
//! `PS = 1` turns it into a leaf. In a fourth-level 4 KiB entry bit 7 is
//! PAT, which this kernel never sets, so the constructors below keep it
//! clear and [`PageTableEntry::leaf_4k`] treats every present PTE as a
//! leaf. A single [`PageTableEntry`] type therefore covers every table this
//! kernel builds, with the constructors encoding the three flag
//! combinations that actually occur:
//!
//! | constructor           | low bits              | role                         |
//! |-----------------------|-----------------------|------------------------------|
//! | [`directory`]         | P + RW + US           | pointer to next-level table  |
//! | [`kernel_superpage`]  | P + RW + PS (+ G)     | 2 MiB leaf, supervisor only  |
//! | [`process_superpage`] | P + RW + US + PS (+ G)| 2 MiB leaf, user accessible  |
//! | [`process_page`]      | P + RW + US (+ G)     | 4 KiB leaf, user accessible  |
//!
//! [`directory`]: PageTableEntry::directory
//! [`kernel_superpage`]: PageTableEntry::kernel_superpage
//! [`process_superpage`]: PageTableEntry::process_superpage
//! [`process_page`]: PageTableEntry::process_page

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size2M, Size4K, VirtualAddress};

/// Entries per table at every level.
pub const TABLE_ENTRIES: usize = 512;

/// One entry of a page-mapping table, at any level.
#[bitfield(u64, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Bit 0 — P: the entry participates in translation.
    pub present: bool,

    /// Bit 1 — R/W: writes are allowed through this entry.
    pub writable: bool,

    /// Bit 2 — U/S: user-mode accesses are allowed through this entry.
    pub user: bool,

    /// Bit 3 — PWT: write-through caching for the referenced memory.
    pub write_through: bool,

    /// Bit 4 — PCD: caching disabled for the referenced memory.
    pub cache_disable: bool,

    /// Bit 5 — A: set by hardware on first access.
    pub accessed: bool,

    /// Bit 6 — D: set by hardware on first write (leaf entries only).
    pub dirty: bool,

    /// Bit 7 — PS: this entry is a large leaf (PAT at the fourth level,
    /// always left clear there).
    pub page_size: bool,

    /// Bit 8 — G: the translation survives root-table loads while
    /// `CR4.PGE` is set (leaf entries only).
    pub global: bool,

    /// Bits 9–11 — available to the OS; unused here.
    #[bits(3)]
    pub os_low: u8,

    /// Bits 12–51 — physical address bits 51:12 of the leaf page or the
    /// next-level table.
    #[bits(40)]
    pub address_51_12: u64,

    /// Bits 52–58 — available to the OS; unused here.
    #[bits(7)]
    pub os_high: u8,

    /// Bits 59–62 — MPK protection key (leaf entries only); unused here.
    #[bits(4)]
    pub protection_key: u8,

    /// Bit 63 — NX: instruction fetches through this entry fault.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Entry pointing at the next-level table.
    ///
    /// Present, writable and user-walkable; access control is decided by
    /// the leaf, so non-leaf entries stay permissive.
    #[inline]
    #[must_use]
    pub const fn directory(table: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_raw_address(table.base().as_u64())
    }

    /// 2 MiB leaf for the kernel window: supervisor-only, writable,
    /// `global` on request.
    #[inline]
    #[must_use]
    pub const fn kernel_superpage(page: PhysicalPage<Size2M>, global: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_page_size(true)
            .with_global(global)
            .with_raw_address(page.base().as_u64())
    }

    /// 2 MiB leaf for a process: user-accessible, writable, `global` on
    /// request.
    #[inline]
    #[must_use]
    pub const fn process_superpage(page: PhysicalPage<Size2M>, global: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_page_size(true)
            .with_global(global)
            .with_raw_address(page.base().as_u64())
    }

    /// 4 KiB leaf for a process: user-accessible, writable, `global` on
    /// request. Bit 7 is PAT at this level and stays clear.
    #[inline]
    #[must_use]
    pub const fn process_page(page: PhysicalPage<Size4K>, global: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_global(global)
            .with_raw_address(page.base().as_u64())
    }

    /// The address field as a plain 64-bit value.
    ///
    /// For hardware entries this is a physical address; shadow tables store
    /// virtual addresses in the same field.
    #[inline]
    #[must_use]
    pub const fn raw_address(self) -> u64 {
        self.address_51_12() << 12
    }

    /// Replace the address field with `addr`'s bits 51:12.
    ///
    /// The low twelve bits must be zero; 2 MiB leaves additionally need
    /// bits 20:12 clear, which page-typed callers guarantee.
    #[inline]
    #[must_use]
    pub const fn with_raw_address(self, addr: u64) -> Self {
        self.with_address_51_12(addr >> 12)
    }

    /// Next-level table this entry points at, if it is a present non-leaf.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() && !self.page_size() {
            Some(PhysicalPage::from_page_number(self.raw_address() >> 12))
        } else {
            None
        }
    }

    /// 2 MiB page this entry maps, if it is a present superpage leaf.
    #[inline]
    #[must_use]
    pub const fn leaf_2m(self) -> Option<PhysicalPage<Size2M>> {
        if self.present() && self.page_size() {
            Some(PhysicalPage::from_page_number(self.raw_address() >> 21))
        } else {
            None
        }
    }

    /// 4 KiB page this entry maps, if present. Only meaningful for entries
    /// read from a fourth-level table, where every present entry is a leaf.
    #[inline]
    #[must_use]
    pub const fn leaf_4k(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() {
            Some(PhysicalPage::from_page_number(self.raw_address() >> 12))
        } else {
            None
        }
    }
}

/// A page-mapping table: 512 entries, 4 KiB, naturally aligned.
///
/// Serves as PML4, PDPT, page directory and fourth-level page table alike;
/// the level is decided by where the table is wired in, not by its type.
/// Tables live in raw frames and are materialized through
/// [`PhysMapper`](crate::PhysMapper), so there is no constructor; callers
/// [`zero`](Self::zero) a fresh frame before first use.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == 4096);
const _: () = assert!(core::mem::align_of::<PageTable>() == 4096);

impl PageTable {
    /// Clear every entry to non-present.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PageTableEntry::new(); TABLE_ENTRIES];
    }

    /// Read the entry at `index`.
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        debug_assert!(index < TABLE_ENTRIES);
        self.entries[index]
    }

    /// Write the entry at `index`.
    ///
    /// Plain store; TLB maintenance for active mappings is on the caller.
    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        debug_assert!(index < TABLE_ENTRIES);
        self.entries[index] = entry;
    }
}

/// The 1 GiB slot a virtual address falls in, counted from virtual zero:
/// `va >> 30`, i.e. the second-level index for addresses under the first
/// top-level entry.
///
/// Deliberately unmasked: every bit above 29 participates, so an address
/// outside the first 512 GiB yields an out-of-range slot instead of
/// silently wrapping onto a valid one.
#[inline]
#[must_use]
pub const fn directory_slot(va: VirtualAddress) -> u64 {
    va.as_u64() >> 30
}

/// Index into a page directory (VA bits `[29:21]`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L2Index(u16);

impl L2Index {
    /// Extract the directory index from a virtual address.
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> 21) & 0x1FF) as u16)
    }

    /// Construct from a raw value; debug-asserts `v < 512`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    /// The index as `usize` for table access.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Index into a fourth-level page table (VA bits `[20:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L1Index(u16);

impl L1Index {
    /// Extract the page-table index from a virtual address.
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> 12) & 0x1FF) as u16)
    }

    /// Construct from a raw value; debug-asserts `v < 512`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    /// The index as `usize` for table access.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

//! # Page Descriptors
//!
//! One descriptor per physical superpage, stored in a flat array indexed by
//! page number. The free lists thread through the descriptors by index, so
//! the whole bookkeeping structure lives in a single contiguous allocation
//! whose size is known before any allocator exists.

use crate::zone::Zone;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M};

/// Index of a superpage within a descriptor array.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(u32);

impl PageIndex {
    /// Create an index from a raw page number.
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Index of the physical superpage `page`.
    ///
    /// Page numbers beyond `u32::MAX` (8 PiB of superpages) are out of
    /// scope for this allocator.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_page(page: PhysicalPage<Size2M>) -> Self {
        debug_assert!(page.page_number() <= u32::MAX as u64);
        Self(page.page_number() as u32)
    }

    /// The physical superpage this index refers to.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage<Size2M> {
        PhysicalPage::from_page_number(self.0 as u64)
    }

    /// Physical base address of the superpage.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.page().base()
    }

    /// The unique same-order neighbor this block can merge with.
    ///
    /// Obtained by toggling the order's bit: blocks only ever pair with the
    /// sibling they were split from, never with an arbitrary adjacent run.
    #[inline]
    #[must_use]
    pub const fn buddy(self, order: u8) -> Self {
        Self(self.0 ^ (1 << order))
    }

    /// Index advanced by `n` pages.
    #[inline]
    #[must_use]
    pub const fn offset(self, n: u32) -> Self {
        Self(self.0 + n)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Debug for PageIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PG({})", self.0)
    }
}

/// Allocation state bits of a page descriptor.
#[bitfield(u8)]
pub struct PageFlags {
    /// Page may ever be handed out by the allocator. Pages without this bit
    /// are permanently excluded (firmware ranges, kernel image, metadata).
    pub usable: bool,

    /// Page is currently owned, either allocated or permanently reserved.
    pub used: bool,

    /// Unused.
    #[bits(6)]
    __: u8,
}

/// Bookkeeping state of one superpage.
///
/// The same descriptor shape serves two layers: the physical root (where a
/// page's address is implied by its index) and the kernel's logical page
/// array (where `backing` records the physical page behind a window slot).
///
/// # Invariants
/// A descriptor with `order = Some(o)` is the head of a run of `2^o`
/// contiguous, same-zone, currently free pages. Every other descriptor
/// carries `None` in `order` and `next`.
#[derive(Copy, Clone, Debug)]
pub struct PageDescriptor {
    flags: PageFlags,
    zone: Zone,
    order: Option<u8>,
    next: Option<PageIndex>,
    backing: PhysicalAddress,
}

impl PageDescriptor {
    /// A descriptor in its boot state: no flags, low memory zone, not on
    /// any free list, unbacked.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flags: PageFlags::new(),
            zone: Zone::LowMem,
            order: None,
            next: None,
            backing: PhysicalAddress::zero(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn zone(&self) -> Zone {
        self.zone
    }

    #[inline]
    pub const fn set_zone(&mut self, zone: Zone) {
        self.zone = zone;
    }

    /// The raw flag byte.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.flags.usable()
    }

    #[inline]
    #[must_use]
    pub const fn is_used(&self) -> bool {
        self.flags.used()
    }

    /// `true` if the page can be handed out right now.
    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.flags.usable() && !self.flags.used()
    }

    #[inline]
    pub const fn set_usable(&mut self, usable: bool) {
        self.flags.set_usable(usable);
    }

    #[inline]
    pub const fn set_used(&mut self, used: bool) {
        self.flags.set_used(used);
    }

    /// Buddy order, if this page heads a free block.
    #[inline]
    #[must_use]
    pub const fn order(&self) -> Option<u8> {
        self.order
    }

    /// Next free block head at the same (zone, order).
    #[inline]
    #[must_use]
    pub const fn next(&self) -> Option<PageIndex> {
        self.next
    }

    /// Physical page backing this slot, for logical page arrays. Zero when
    /// unbacked.
    #[inline]
    #[must_use]
    pub const fn backing(&self) -> PhysicalAddress {
        self.backing
    }

    #[inline]
    pub const fn set_backing(&mut self, backing: PhysicalAddress) {
        self.backing = backing;
    }

    #[inline]
    pub(crate) const fn set_order(&mut self, order: Option<u8>) {
        self.order = order;
    }

    #[inline]
    pub(crate) const fn set_next(&mut self, next: Option<PageIndex>) {
        self.next = next;
    }
}

impl Default for PageDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buddy_toggles_order_bit() {
        assert_eq!(PageIndex::new(8).buddy(3), PageIndex::new(0));
        assert_eq!(PageIndex::new(0).buddy(3), PageIndex::new(8));
        assert_eq!(PageIndex::new(20).buddy(2), PageIndex::new(16));
        assert_eq!(PageIndex::new(20).buddy(0), PageIndex::new(21));
    }

    #[test]
    fn descriptor_boot_state() {
        let d = PageDescriptor::new();
        assert!(!d.is_usable());
        assert!(!d.is_used());
        assert!(!d.is_free());
        assert_eq!(d.order(), None);
        assert_eq!(d.next(), None);
        assert_eq!(d.backing().as_u64(), 0);
    }

    #[test]
    fn free_requires_usable_and_not_used() {
        let mut d = PageDescriptor::new();
        d.set_usable(true);
        assert!(d.is_free());
        d.set_used(true);
        assert!(!d.is_free());
        d.set_usable(false);
        assert!(!d.is_free());
    }

    #[test]
    fn index_page_round_trip() {
        let idx = PageIndex::new(20);
        assert_eq!(idx.base().as_u64(), 20 * 0x20_0000);
        assert_eq!(PageIndex::from_page(idx.page()), idx);
    }
}

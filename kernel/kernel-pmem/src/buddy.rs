//! # Buddy Free Lists
//!
//! Power-of-two allocation over a descriptor array. Free blocks of `2^o`
//! pages are kept on intrusive singly linked lists, one per (zone, order)
//! pair; links and orders live inside the descriptors themselves, heads live
//! here:
//!
//! ```text
//! heads[zone][order]
//!      │
//!      ▼
//! ┌────────────┐  next   ┌────────────┐  next
//! │ page 24    │ ──────► │ page 8     │ ──────► (end)
//! │ order: 3   │         │ order: 3   │
//! └────────────┘         └────────────┘
//! ```
//!
//! A block's buddy is the unique same-size neighbor obtained by toggling
//! the order's bit in the page index. Only buddies merge; two free blocks
//! that happen to be adjacent but were not split from each other never do.
//!
//! The same machinery serves two layers: [`PhysicalMemory`] wraps it for
//! the physical root, and the kernel's logical page layer reuses
//! [`FreeLists`] directly over its own descriptor array.

use crate::page::{PageDescriptor, PageIndex};
use crate::zone::Zone;
use crate::PmemError;
use kernel_memory_addresses::{PhysicalPage, Size2M};

/// Largest supported block order: `2^9` superpages, 1 GiB.
pub const MAX_BUDDY_ORDER: u8 = 9;

/// Number of per-zone free lists.
pub const ORDER_COUNT: usize = MAX_BUDDY_ORDER as usize + 1;

/// Per-(zone, order) free list heads over an external descriptor array.
///
/// # Invariants
/// - Every listed head is free (usable and not used) and carries its list's
///   order in `order`; all `2^order` pages of the block are free and share
///   the head's zone.
/// - Pages that are not heads of a listed block carry `None` in both
///   `order` and `next`.
pub struct FreeLists {
    heads: [[Option<PageIndex>; ORDER_COUNT]; Zone::SLOTS],
}

impl FreeLists {
    /// Empty lists.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heads: [[None; ORDER_COUNT]; Zone::SLOTS],
        }
    }

    /// Scan the array and insert every maximal free block.
    ///
    /// For each unvisited index the block order is the largest `o` such
    /// that all `2^o` pages from it are free and same-zone, the index is
    /// `2^o`-aligned, and the block fits the array. Unusable or used pages
    /// are skipped one at a time and never listed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn populate(&mut self, pages: &mut [PageDescriptor]) {
        debug_assert!(u32::try_from(pages.len()).is_ok());
        let n = pages.len() as u32;
        let mut i = 0u32;
        let mut blocks = 0u32;
        while i < n {
            if let Some(order) = free_block_order(pages, i) {
                self.insert(pages, PageIndex::new(i), order);
                blocks += 1;
                i += 1u32 << order;
            } else {
                i += 1;
            }
        }
        log::debug!("buddy: {blocks} free blocks over {n} pages");
    }

    /// Allocate a free block of exactly `2^order` pages from `zone`.
    ///
    /// Takes the smallest available block of at least the requested order
    /// and splits it down: at each step the lower half goes back to the
    /// next-lower list and the upper half is kept. Only the requested zone
    /// is searched; zone fallback is the caller's policy.
    ///
    /// # Errors
    /// [`PmemError::OutOfMemory`] when the zone has no block of sufficient
    /// order, or the order exceeds [`MAX_BUDDY_ORDER`].
    pub fn alloc(
        &mut self,
        pages: &mut [PageDescriptor],
        zone: Zone,
        order: u8,
    ) -> Result<PageIndex, PmemError> {
        if order > MAX_BUDDY_ORDER {
            return Err(PmemError::OutOfMemory);
        }
        let slot = zone.slot();
        let mut found = order;
        while self.heads[slot][usize::from(found)].is_none() {
            if found == MAX_BUDDY_ORDER {
                return Err(PmemError::OutOfMemory);
            }
            found += 1;
        }
        let Some(mut head) = self.pop(pages, slot, found) else {
            return Err(PmemError::OutOfMemory);
        };
        while found > order {
            found -= 1;
            self.insert(pages, head, found);
            head = head.offset(1u32 << found);
        }
        let start = head.as_usize();
        for page in &mut pages[start..start + (1usize << order)] {
            debug_assert!(page.is_free(), "allocated block must be free");
            page.set_used(true);
        }
        Ok(head)
    }

    /// Return the block of `2^order` pages at `head` and coalesce.
    ///
    /// As long as the block's buddy is a free head of the same order and
    /// zone, the two merge into the lower-addressed block of the next
    /// order. Merging never crosses a zone boundary.
    #[allow(clippy::cast_possible_truncation)]
    pub fn free(&mut self, pages: &mut [PageDescriptor], head: PageIndex, order: u8) {
        let n = pages.len() as u32;
        if order > MAX_BUDDY_ORDER || head.as_u32() + (1u32 << order) > n {
            debug_assert!(false, "freed block out of range");
            return;
        }
        let zone = pages[head.as_usize()].zone();
        let start = head.as_usize();
        for page in &mut pages[start..start + (1usize << order)] {
            debug_assert!(page.is_usable() && page.is_used(), "double free");
            page.set_used(false);
        }

        let mut block = head;
        let mut merged = order;
        while merged < MAX_BUDDY_ORDER {
            let buddy = block.buddy(merged);
            if buddy.as_u32() + (1u32 << merged) > n {
                break;
            }
            let candidate = &pages[buddy.as_usize()];
            if !candidate.is_free()
                || candidate.zone() != zone
                || candidate.order() != Some(merged)
            {
                break;
            }
            self.remove(pages, buddy, merged);
            block = block.min(buddy);
            merged += 1;
        }
        self.insert(pages, block, merged);
    }

    /// Prepend `head` to its zone's list at `order`.
    fn insert(&mut self, pages: &mut [PageDescriptor], head: PageIndex, order: u8) {
        let slot = pages[head.as_usize()].zone().slot();
        let descriptor = &mut pages[head.as_usize()];
        descriptor.set_order(Some(order));
        descriptor.set_next(self.heads[slot][usize::from(order)]);
        self.heads[slot][usize::from(order)] = Some(head);
    }

    /// Unlink and clear the first head of (slot, order), if any.
    fn pop(&mut self, pages: &mut [PageDescriptor], slot: usize, order: u8) -> Option<PageIndex> {
        let head = self.heads[slot][usize::from(order)]?;
        let descriptor = &mut pages[head.as_usize()];
        self.heads[slot][usize::from(order)] = descriptor.next();
        descriptor.set_next(None);
        descriptor.set_order(None);
        Some(head)
    }

    /// Unlink and clear a specific block head.
    fn remove(&mut self, pages: &mut [PageDescriptor], target: PageIndex, order: u8) {
        let slot = pages[target.as_usize()].zone().slot();
        let mut current = self.heads[slot][usize::from(order)];
        let mut previous: Option<PageIndex> = None;
        while let Some(index) = current {
            let next = pages[index.as_usize()].next();
            if index == target {
                match previous {
                    None => self.heads[slot][usize::from(order)] = next,
                    Some(p) => pages[p.as_usize()].set_next(next),
                }
                let descriptor = &mut pages[target.as_usize()];
                descriptor.set_next(None);
                descriptor.set_order(None);
                return;
            }
            previous = current;
            current = next;
        }
        debug_assert!(false, "block head missing from its free list");
    }
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximal buddy order of the free block starting at `head`.
///
/// `None` if the page itself is not free. Any disqualifying page inside a
/// doubled candidate block ends the search at the last verified order, even
/// when a larger aligned run might begin past the disqualifying page.
#[allow(clippy::cast_possible_truncation)]
fn free_block_order(pages: &[PageDescriptor], head: u32) -> Option<u8> {
    let n = pages.len() as u32;
    if head >= n || !pages[head as usize].is_free() {
        return None;
    }
    let zone = pages[head as usize].zone();
    let mut order = 0u8;
    while order < MAX_BUDDY_ORDER {
        let half = 1u32 << order;
        let doubled = half << 1;
        if head & (doubled - 1) != 0 || head + doubled > n {
            break;
        }
        let upper_ok = (head + half..head + doubled).all(|i| {
            let page = &pages[i as usize];
            page.is_free() && page.zone() == zone
        });
        if !upper_ok {
            break;
        }
        order += 1;
    }
    Some(order)
}

/// Physical memory root: the page descriptor array plus its free lists.
///
/// The descriptors must already be flagged (usable / reserved) and zoned;
/// construction only discovers the free blocks.
pub struct PhysicalMemory<'a> {
    pages: &'a mut [PageDescriptor],
    lists: FreeLists,
}

impl<'a> PhysicalMemory<'a> {
    /// Build the free lists over fully prepared descriptors.
    #[must_use]
    pub fn new(pages: &'a mut [PageDescriptor]) -> Self {
        let mut lists = FreeLists::new();
        lists.populate(pages);
        log::info!("physical memory: {} superpages managed", pages.len());
        Self { pages, lists }
    }

    /// Allocate `2^order` contiguous superpages from `zone`.
    ///
    /// # Errors
    /// [`PmemError::OutOfMemory`] when the zone cannot satisfy the request.
    pub fn alloc(&mut self, zone: Zone, order: u8) -> Result<PhysicalPage<Size2M>, PmemError> {
        self.lists.alloc(self.pages, zone, order).map(PageIndex::page)
    }

    /// Free the block of `2^order` superpages starting at `page`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn free(&mut self, page: PhysicalPage<Size2M>, order: u8) {
        let number = page.page_number();
        if number + (1u64 << order) > self.pages.len() as u64 {
            debug_assert!(false, "freed page outside the managed range");
            return;
        }
        self.lists.free(self.pages, PageIndex::new(number as u32), order);
    }

    /// Number of managed superpages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Descriptor of one page, if in range.
    #[must_use]
    pub fn descriptor(&self, index: PageIndex) -> Option<&PageDescriptor> {
        self.pages.get(index.as_usize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `n` free descriptors in one zone.
    fn free_pages(n: usize, zone: Zone) -> Vec<PageDescriptor> {
        let mut pages = vec![PageDescriptor::new(); n];
        for p in &mut pages {
            p.set_usable(true);
            p.set_zone(zone);
        }
        pages
    }

    /// Verify the full free/used bookkeeping: listed blocks are free,
    /// aligned, disjoint, and together with used pages cover exactly the
    /// usable set.
    fn assert_consistent(lists: &FreeLists, pages: &[PageDescriptor]) {
        let mut listed = vec![false; pages.len()];
        for (slot, orders) in lists.heads.iter().enumerate() {
            for (order, &head) in orders.iter().enumerate() {
                let mut current = head;
                while let Some(index) = current {
                    let d = &pages[index.as_usize()];
                    assert_eq!(d.zone().slot(), slot);
                    assert_eq!(d.order(), Some(u8::try_from(order).unwrap()));
                    assert_eq!(index.as_usize() % (1 << order), 0, "unaligned head");
                    for i in index.as_usize()..index.as_usize() + (1 << order) {
                        assert!(pages[i].is_free(), "listed page {i} not free");
                        assert!(!listed[i], "page {i} on two blocks");
                        listed[i] = true;
                    }
                    current = d.next();
                }
            }
        }
        for (i, page) in pages.iter().enumerate() {
            if page.is_free() {
                assert!(listed[i], "free page {i} not on any list");
            } else {
                assert!(!listed[i], "non-free page {i} on a list");
            }
        }
    }

    #[test]
    fn populate_stops_at_holes_and_misalignment() {
        let mut pages = free_pages(8, Zone::LowMem);
        pages[5].set_usable(false);
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);

        let slot = Zone::LowMem.slot();
        // [0..4) order 2, [4] order 0, hole at 5, [6..8) order 1.
        assert_eq!(lists.heads[slot][2], Some(PageIndex::new(0)));
        assert_eq!(lists.heads[slot][0], Some(PageIndex::new(4)));
        assert_eq!(lists.heads[slot][1], Some(PageIndex::new(6)));
        assert_eq!(lists.heads[slot][3], None);
        assert_consistent(&lists, &pages);
    }

    #[test]
    fn alloc_returns_aligned_used_block() {
        let mut pages = free_pages(16, Zone::LowMem);
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);

        let head = lists.alloc(&mut pages, Zone::LowMem, 2).unwrap();
        assert_eq!(head.as_usize() % 4, 0);
        for i in head.as_usize()..head.as_usize() + 4 {
            assert!(pages[i].is_used());
        }
        assert_consistent(&lists, &pages);
    }

    #[test]
    fn split_keeps_the_upper_half() {
        // Pages 0..8 reserved, one order-3 block at 8..16.
        let mut pages = free_pages(16, Zone::LowMem);
        for p in &mut pages[..8] {
            p.set_used(true);
        }
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);
        let slot = Zone::LowMem.slot();
        assert_eq!(lists.heads[slot][3], Some(PageIndex::new(8)));

        let head = lists.alloc(&mut pages, Zone::LowMem, 0).unwrap();
        assert_eq!(head, PageIndex::new(15));
        assert_eq!(lists.heads[slot][2], Some(PageIndex::new(8)));
        assert_eq!(lists.heads[slot][1], Some(PageIndex::new(12)));
        assert_eq!(lists.heads[slot][0], Some(PageIndex::new(14)));
        assert_consistent(&lists, &pages);
    }

    #[test]
    fn free_then_realloc_returns_the_same_block() {
        let mut pages = free_pages(16, Zone::LowMem);
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);

        let first = lists.alloc(&mut pages, Zone::LowMem, 1).unwrap();
        lists.free(&mut pages, first, 1);
        let second = lists.alloc(&mut pages, Zone::LowMem, 1).unwrap();
        assert_eq!(first, second);
        assert_consistent(&lists, &pages);
    }

    #[test]
    fn full_cycle_coalesces_back_to_one_block() {
        let mut pages = free_pages(16, Zone::LowMem);
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);
        let slot = Zone::LowMem.slot();
        assert_eq!(lists.heads[slot][4], Some(PageIndex::new(0)));

        let mut allocated = Vec::new();
        while let Ok(head) = lists.alloc(&mut pages, Zone::LowMem, 0) {
            allocated.push(head);
        }
        assert_eq!(allocated.len(), 16);
        for (order, &head) in lists.heads[slot].iter().enumerate() {
            assert_eq!(head, None, "order {order} must be empty");
        }

        for head in allocated {
            lists.free(&mut pages, head, 0);
        }
        for (order, &head) in lists.heads[slot].iter().enumerate() {
            let want = if order == 4 { Some(PageIndex::new(0)) } else { None };
            assert_eq!(head, want, "order {order}");
        }
        assert_consistent(&lists, &pages);
    }

    #[test]
    fn coalescing_never_crosses_zones() {
        let mut pages = free_pages(8, Zone::Dma);
        for p in &mut pages[4..] {
            p.set_zone(Zone::LowMem);
        }
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);
        assert_eq!(lists.heads[Zone::Dma.slot()][2], Some(PageIndex::new(0)));
        assert_eq!(lists.heads[Zone::LowMem.slot()][2], Some(PageIndex::new(4)));

        let head = lists.alloc(&mut pages, Zone::Dma, 2).unwrap();
        lists.free(&mut pages, head, 2);
        // Still two order-2 blocks, no order-3 merge across the boundary.
        assert_eq!(lists.heads[Zone::Dma.slot()][2], Some(PageIndex::new(0)));
        assert_eq!(lists.heads[Zone::Dma.slot()][3], None);
        assert_eq!(lists.heads[Zone::LowMem.slot()][3], None);
        assert_consistent(&lists, &pages);
    }

    #[test]
    fn requested_zone_is_never_substituted() {
        let mut pages = free_pages(8, Zone::LowMem);
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);

        assert_eq!(lists.alloc(&mut pages, Zone::Uma, 0), Err(PmemError::OutOfMemory));
        assert_eq!(lists.alloc(&mut pages, Zone::Dma, 0), Err(PmemError::OutOfMemory));
        assert!(lists.alloc(&mut pages, Zone::LowMem, 0).is_ok());
    }

    #[test]
    fn order_above_maximum_fails_cleanly() {
        let mut pages = free_pages(16, Zone::LowMem);
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);

        assert_eq!(
            lists.alloc(&mut pages, Zone::LowMem, MAX_BUDDY_ORDER + 1),
            Err(PmemError::OutOfMemory)
        );
        assert_consistent(&lists, &pages);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut pages = free_pages(4, Zone::Dma);
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);

        assert!(lists.alloc(&mut pages, Zone::Dma, 2).is_ok());
        assert_eq!(lists.alloc(&mut pages, Zone::Dma, 0), Err(PmemError::OutOfMemory));
    }

    #[test]
    fn mixed_traffic_stays_consistent() {
        let mut pages = free_pages(32, Zone::Uma);
        pages[7].set_usable(false);
        pages[19].set_usable(false);
        let mut lists = FreeLists::new();
        lists.populate(&mut pages);
        assert_consistent(&lists, &pages);

        let a = lists.alloc(&mut pages, Zone::Uma, 0).unwrap();
        let b = lists.alloc(&mut pages, Zone::Uma, 2).unwrap();
        let c = lists.alloc(&mut pages, Zone::Uma, 1).unwrap();
        assert_consistent(&lists, &pages);

        lists.free(&mut pages, b, 2);
        assert_consistent(&lists, &pages);
        let d = lists.alloc(&mut pages, Zone::Uma, 3).unwrap();
        assert_consistent(&lists, &pages);
        lists.free(&mut pages, a, 0);
        lists.free(&mut pages, d, 3);
        lists.free(&mut pages, c, 1);
        assert_consistent(&lists, &pages);
    }

    #[test]
    fn physical_root_maps_handles_to_addresses() {
        let mut pages = free_pages(16, Zone::LowMem);
        for p in &mut pages[..8] {
            p.set_used(true);
        }
        let mut memory = PhysicalMemory::new(&mut pages);
        assert_eq!(memory.page_count(), 16);

        let block = memory.alloc(Zone::LowMem, 1).unwrap();
        assert_eq!(block.base().as_u64() % (2 * 0x20_0000), 0);
        let idx = PageIndex::from_page(block);
        assert!(memory.descriptor(idx).unwrap().is_used());

        memory.free(block, 1);
        assert!(!memory.descriptor(idx).unwrap().is_used());
    }
}

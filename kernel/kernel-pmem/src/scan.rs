//! # Address Map Scanning
//!
//! Reduces the boot memory map to the numbers the allocator needs: how many
//! superpages the descriptor array must cover, where that array can live,
//! and which pages start out usable or reserved.
//!
//! The descriptor array is placed by first fit into a usable, superpage-
//! aligned range. Two placement constraints apply: the range must sit above
//! the low memory reservation (which early boot owns), and it must end below
//! the boot linear map bound so the array is addressable while it is being
//! initialized.

use crate::page::{PageDescriptor, PageIndex};
use crate::PmemError;
use kernel_bootinfo::layout::{
    BOOT_LINEAR_BOUND, LOW_MEMORY_BOUND, SUPERPAGE_SHIFT, SUPERPAGE_SIZE,
};
use kernel_bootinfo::memory_map::SystemMemoryMap;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M};

/// Number of superpages needed to cover every address the map describes.
///
/// Reserved and defective ranges count too; their descriptors exist and
/// simply never become usable.
#[must_use]
pub fn page_count(map: SystemMemoryMap<'_>) -> u64 {
    map.span().div_ceil(SUPERPAGE_SIZE)
}

/// Bytes of descriptor metadata covering `npages` superpages.
#[must_use]
pub const fn metadata_bytes(npages: u64) -> u64 {
    npages * size_of::<PageDescriptor>() as u64
}

/// Superpages occupied by `bytes` of metadata.
#[must_use]
pub const fn metadata_pages(bytes: u64) -> u64 {
    bytes.div_ceil(SUPERPAGE_SIZE)
}

/// Find a home for the descriptor array: the first usable, superpage-aligned
/// range of at least `bytes` above the low memory reservation.
///
/// # Errors
/// [`PmemError::LayoutOverflow`] when no usable range fits, or when the only
/// candidate would cross the boot linear map bound.
pub fn find_metadata_region(
    map: SystemMemoryMap<'_>,
    bytes: u64,
) -> Result<PhysicalPage<Size2M>, PmemError> {
    let mut found = 0u64;
    for entry in map.usable() {
        let a = PhysicalAddress::new(entry.base).align_up::<Size2M>().as_u64();
        let b = PhysicalAddress::new(entry.end()).align_down::<Size2M>().as_u64();
        if b < LOW_MEMORY_BOUND {
            continue;
        }
        let start = a.max(LOW_MEMORY_BOUND);
        if b.checked_sub(start).is_some_and(|room| room >= bytes) {
            found = start;
            break;
        }
    }
    if found == 0 || found.saturating_add(bytes) > BOOT_LINEAR_BOUND {
        return Err(PmemError::LayoutOverflow);
    }
    log::debug!("page metadata: {bytes} bytes at {found:#010x}");
    Ok(PhysicalPage::from_addr(PhysicalAddress::new(found)))
}

/// Reset every descriptor to its boot state.
pub fn reset(pages: &mut [PageDescriptor]) {
    pages.fill(PageDescriptor::new());
}

/// Mark the fixed low memory reservation used.
///
/// These pages hold firmware areas, the kernel image, and the bootstrap
/// region; they stay owned by early boot for the kernel's lifetime.
#[allow(clippy::cast_possible_truncation)]
pub fn reserve_low_memory(pages: &mut [PageDescriptor]) {
    let n = (LOW_MEMORY_BOUND >> SUPERPAGE_SHIFT) as usize;
    for page in pages.iter_mut().take(n) {
        page.set_used(true);
    }
}

/// Mark `count` pages from `first` used, reserving them for the descriptor
/// array itself.
///
/// # Errors
/// [`PmemError::LayoutOverflow`] when the range does not fit the array.
pub fn reserve_metadata(
    pages: &mut [PageDescriptor],
    first: PhysicalPage<Size2M>,
    count: u64,
) -> Result<(), PmemError> {
    let start = PageIndex::from_page(first).as_usize();
    let count = usize::try_from(count).map_err(|_| PmemError::LayoutOverflow)?;
    let end = start.checked_add(count).ok_or(PmemError::LayoutOverflow)?;
    if end > pages.len() {
        return Err(PmemError::LayoutOverflow);
    }
    for page in &mut pages[start..end] {
        page.set_used(true);
    }
    Ok(())
}

/// Mark every superpage fully contained in a usable map entry allocatable.
///
/// Partial edge pages stay unusable: the allocator only ever deals in whole
/// superpages.
#[allow(clippy::cast_possible_truncation)]
pub fn mark_usable(pages: &mut [PageDescriptor], map: SystemMemoryMap<'_>) {
    for entry in map.usable() {
        let a = entry.base.div_ceil(SUPERPAGE_SIZE) as usize;
        let b = ((entry.end() >> SUPERPAGE_SHIFT) as usize).min(pages.len());
        if a >= b {
            continue;
        }
        for page in &mut pages[a..b] {
            page.set_usable(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_bootinfo::memory_map::{MemoryMapEntry, RegionKind};

    const MIB: u64 = 0x10_0000;

    fn map(entries: &[MemoryMapEntry]) -> SystemMemoryMap<'_> {
        SystemMemoryMap::new(entries)
    }

    #[test]
    fn page_count_covers_reserved_tail() {
        let entries = [
            MemoryMapEntry::new(0, 64 * MIB, RegionKind::Usable),
            MemoryMapEntry::new(254 * MIB, MIB, RegionKind::Reserved),
        ];
        assert_eq!(page_count(map(&entries)), 128);
    }

    #[test]
    fn metadata_region_skips_low_memory() {
        // One usable range entirely below the low bound, one above it.
        let entries = [
            MemoryMapEntry::new(0, 24 * MIB, RegionKind::Usable),
            MemoryMapEntry::new(40 * MIB, 24 * MIB, RegionKind::Usable),
        ];
        let region = find_metadata_region(map(&entries), 4096).unwrap();
        assert_eq!(region.base().as_u64(), 40 * MIB);
    }

    #[test]
    fn metadata_region_clips_to_low_bound() {
        // The usable range straddles the low bound; placement starts at it.
        let entries = [MemoryMapEntry::new(16 * MIB, 48 * MIB, RegionKind::Usable)];
        let region = find_metadata_region(map(&entries), 4096).unwrap();
        assert_eq!(region.base().as_u64(), LOW_MEMORY_BOUND);
    }

    #[test]
    fn metadata_region_shrinks_unaligned_edges() {
        // Base is not superpage aligned; the first whole superpage is used.
        let entries = [MemoryMapEntry::new(40 * MIB + 0x1000, 24 * MIB, RegionKind::Usable)];
        let region = find_metadata_region(map(&entries), 4096).unwrap();
        assert_eq!(region.base().as_u64(), 42 * MIB);
    }

    #[test]
    fn metadata_region_respects_boot_linear_bound() {
        // Enough room, but only by crossing the 3 GiB addressability bound.
        let entries = [MemoryMapEntry::new(BOOT_LINEAR_BOUND - 2 * MIB, 64 * MIB, RegionKind::Usable)];
        assert_eq!(
            find_metadata_region(map(&entries), 4 * MIB),
            Err(PmemError::LayoutOverflow)
        );
    }

    #[test]
    fn metadata_region_reports_overflow_when_absent() {
        let entries = [MemoryMapEntry::new(0, 8 * MIB, RegionKind::Usable)];
        assert_eq!(
            find_metadata_region(map(&entries), 4096),
            Err(PmemError::LayoutOverflow)
        );
    }

    #[test]
    fn preparation_marks_the_64_mib_scenario() {
        // One usable 64 MiB region: 32 superpages, low reservation takes
        // the first 16, metadata lands on page 16.
        let entries = [MemoryMapEntry::new(0, 64 * MIB, RegionKind::Usable)];
        let m = map(&entries);
        let npages = page_count(m);
        assert_eq!(npages, 32);

        let bytes = metadata_bytes(npages);
        let region = find_metadata_region(m, bytes).unwrap();
        assert_eq!(region.base().as_u64(), LOW_MEMORY_BOUND);

        let mut pages = vec![PageDescriptor::new(); usize::try_from(npages).unwrap()];
        reset(&mut pages);
        reserve_low_memory(&mut pages);
        reserve_metadata(&mut pages, region, metadata_pages(bytes)).unwrap();
        mark_usable(&mut pages, m);

        for (i, p) in pages.iter().enumerate() {
            assert!(p.is_usable(), "page {i} must be usable");
            let reserved = i < 17;
            assert_eq!(p.is_used(), reserved, "page {i}");
        }
    }

    #[test]
    fn partial_edge_pages_stay_unusable() {
        let entries = [MemoryMapEntry::new(MIB, 4 * MIB, RegionKind::Usable)];
        let mut pages = vec![PageDescriptor::new(); 4];
        mark_usable(&mut pages, map(&entries));
        // [1 MiB, 5 MiB) fully contains only the superpage at 2 MiB.
        assert!(!pages[0].is_usable());
        assert!(pages[1].is_usable());
        assert!(!pages[2].is_usable());
        assert!(!pages[3].is_usable());
    }
}

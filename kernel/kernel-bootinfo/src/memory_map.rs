//! # Boot Memory Map
//!
//! The firmware-provided description of physical memory. The map is a flat
//! list of `(base, length, kind)` ranges; nothing about it is normalized.

/// Classification of a physical memory range, as reported by the boot stage.
///
/// Discriminants are pinned: the values cross the loader/kernel boundary as
/// plain `u32` tags.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Ordinary RAM, free for the kernel to manage.
    Usable = 1,
    /// Firmware or hardware reservation; never touched.
    Reserved = 2,
    /// ACPI tables. Reclaimable in principle, treated as reserved here.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNonVolatile = 4,
    /// RAM reported as defective.
    Bad = 5,
}

/// One physical memory range.
///
/// Entries may appear in any order, may overlap each other, and may have
/// zero length. Bases are byte addresses and need not be page aligned;
/// consumers decide how to round.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryMapEntry {
    /// Physical base address in bytes.
    pub base: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// What the range is good for.
    pub kind: RegionKind,
}

impl MemoryMapEntry {
    /// Create a new entry.
    #[inline]
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// One past the last byte of the range.
    ///
    /// Saturates rather than wraps on a malformed entry.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// `true` if the range is ordinary allocatable RAM.
    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, RegionKind::Usable)
    }
}

/// Borrowed view of the boot memory map.
///
/// Wraps the entry slice handed over at boot and answers the two questions
/// the physical allocator asks: how far does memory reach, and which ranges
/// are usable.
#[derive(Copy, Clone, Debug)]
pub struct SystemMemoryMap<'a> {
    entries: &'a [MemoryMapEntry],
}

impl<'a> SystemMemoryMap<'a> {
    /// Wrap a slice of entries.
    #[inline]
    #[must_use]
    pub const fn new(entries: &'a [MemoryMapEntry]) -> Self {
        Self { entries }
    }

    /// All entries, in map order.
    #[inline]
    #[must_use]
    pub const fn entries(self) -> &'a [MemoryMapEntry] {
        self.entries
    }

    /// Number of entries in the map.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.entries.len()
    }

    /// `true` if the map has no entries.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the usable entries only.
    #[inline]
    pub fn usable(self) -> impl Iterator<Item = MemoryMapEntry> + 'a {
        self.entries.iter().copied().filter(MemoryMapEntry::is_usable)
    }

    /// One past the highest physical byte described by any entry.
    ///
    /// Every kind counts: reserved and defective ranges still stretch the
    /// span, because the page descriptors must cover them. Zero for an
    /// empty map.
    #[inline]
    #[must_use]
    pub fn span(self) -> u64 {
        self.entries.iter().map(MemoryMapEntry::end).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_covers_all_kinds() {
        let entries = [
            MemoryMapEntry::new(0x10_0000, 0x40_0000, RegionKind::Usable),
            MemoryMapEntry::new(0xFFF0_0000, 0x10_0000, RegionKind::Reserved),
            MemoryMapEntry::new(0x0, 0x9_F000, RegionKind::Usable),
        ];
        let map = SystemMemoryMap::new(&entries);
        assert_eq!(map.span(), 0x1_0000_0000);
    }

    #[test]
    fn usable_filters_kinds() {
        let entries = [
            MemoryMapEntry::new(0x0, 0x1000, RegionKind::Usable),
            MemoryMapEntry::new(0x1000, 0x1000, RegionKind::AcpiReclaimable),
            MemoryMapEntry::new(0x2000, 0x1000, RegionKind::Bad),
            MemoryMapEntry::new(0x3000, 0x1000, RegionKind::Usable),
        ];
        let map = SystemMemoryMap::new(&entries);
        let usable: Vec<_> = map.usable().collect();
        assert_eq!(usable.len(), 2);
        assert_eq!(usable[0].base, 0x0);
        assert_eq!(usable[1].base, 0x3000);
    }

    #[test]
    fn empty_map() {
        let map = SystemMemoryMap::new(&[]);
        assert!(map.is_empty());
        assert_eq!(map.span(), 0);
        assert_eq!(map.usable().count(), 0);
    }

    #[test]
    fn malformed_entry_saturates() {
        let entries = [MemoryMapEntry::new(u64::MAX - 0x100, 0x1000, RegionKind::Usable)];
        let map = SystemMemoryMap::new(&entries);
        assert_eq!(map.span(), u64::MAX);
    }
}

//! # Proximity Domains
//!
//! Optional locality hints in the style of the ACPI SRAT: each region claims
//! a physical range for one proximity domain. The table is advisory; systems
//! without one run as a single domain.

/// One proximity region: a physical range claimed by a domain.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProximityRegion {
    /// Physical base address in bytes.
    pub base: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// Proximity domain identifier.
    pub domain: u32,
}

impl ProximityRegion {
    /// Create a new region.
    #[inline]
    #[must_use]
    pub const fn new(base: u64, length: u64, domain: u32) -> Self {
        Self {
            base,
            length,
            domain,
        }
    }

    /// One past the last byte of the range.
    ///
    /// Saturates rather than wraps on a malformed region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// `true` if `addr` falls within the range.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.end()
    }

    /// `true` if the whole range `[base, base + length)` falls within this
    /// region.
    ///
    /// Locality is only meaningful when it holds for an entire page, so the
    /// classifier asks about ranges, not single addresses.
    #[inline]
    #[must_use]
    pub const fn contains_range(&self, base: u64, length: u64) -> bool {
        self.base <= base && base.saturating_add(length) <= self.end()
    }
}

/// Borrowed view of the proximity table.
#[derive(Copy, Clone, Debug)]
pub struct ProximityMap<'a> {
    regions: &'a [ProximityRegion],
}

impl<'a> ProximityMap<'a> {
    /// Wrap a slice of regions.
    #[inline]
    #[must_use]
    pub const fn new(regions: &'a [ProximityRegion]) -> Self {
        Self { regions }
    }

    /// All regions, in table order.
    #[inline]
    #[must_use]
    pub const fn regions(self) -> &'a [ProximityRegion] {
        self.regions
    }

    /// Find the region covering `addr`.
    ///
    /// Linear scan, first match wins. Overlapping regions are tolerated the
    /// same way overlapping memory map entries are.
    #[inline]
    #[must_use]
    pub fn resolve(self, addr: u64) -> Option<ProximityRegion> {
        self.regions.iter().copied().find(|r| r.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_first_match() {
        let regions = [
            ProximityRegion::new(0x0, 0x4000_0000, 0),
            ProximityRegion::new(0x4000_0000, 0x4000_0000, 1),
            ProximityRegion::new(0x4000_0000, 0x8000_0000, 2),
        ];
        let map = ProximityMap::new(&regions);
        assert_eq!(map.resolve(0x1000).unwrap().domain, 0);
        assert_eq!(map.resolve(0x5000_0000).unwrap().domain, 1);
        assert_eq!(map.resolve(0x8000_0000), None);
    }

    #[test]
    fn range_containment() {
        let r = ProximityRegion::new(0x20_0000, 0x40_0000, 0);
        assert!(r.contains_range(0x20_0000, 0x20_0000));
        assert!(r.contains_range(0x40_0000, 0x20_0000));
        assert!(!r.contains_range(0x40_0000, 0x20_0001));
        assert!(!r.contains_range(0x1F_F000, 0x1000));
    }
}

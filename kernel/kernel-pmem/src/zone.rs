//! # Zone Classification
//!
//! Every physical page belongs to exactly one zone, fixed at classification
//! time. Zones keep allocations within hardware reach (legacy DMA, 32-bit
//! addressing) or close to the NUMA domain that will use them.

use crate::page::PageDescriptor;
use kernel_bootinfo::layout::{SUPERPAGE_SHIFT, SUPERPAGE_SIZE};
use kernel_bootinfo::numa::{ProximityMap, ProximityRegion};

/// Upper bound of the legacy DMA zone (16 MiB).
pub const DMA_BOUND: u64 = 0x100_0000;

/// Upper bound of the low memory zone (4 GiB).
pub const LOWMEM_BOUND: u64 = 0x1_0000_0000;

/// Number of NUMA proximity domains given their own zone. Domains at or
/// above this fold into [`Zone::Uma`].
pub const MAX_PROXIMITY_DOMAINS: usize = 16;

/// Physical memory partition an allocation is served from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Zone {
    /// Legacy DMA range below 16 MiB.
    Dma,
    /// Below 4 GiB, reachable with 32-bit addressing.
    LowMem,
    /// Memory with no locality information.
    Uma,
    /// Memory local to one NUMA proximity domain.
    Domain(u8),
}

impl Zone {
    /// Number of distinct free-list slots across all zones.
    pub const SLOTS: usize = 3 + MAX_PROXIMITY_DOMAINS;

    /// Free-list slot of this zone.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> usize {
        match self {
            Self::Dma => 0,
            Self::LowMem => 1,
            Self::Uma => 2,
            Self::Domain(d) => {
                if (d as usize) < MAX_PROXIMITY_DOMAINS {
                    3 + d as usize
                } else {
                    2
                }
            }
        }
    }

    /// Classify a page by its base address and optional proximity domain.
    ///
    /// Rules apply in order: below 16 MiB is DMA, below 4 GiB is low
    /// memory, then the resolved domain if any, then UMA.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn classify(addr: u64, domain: Option<u32>) -> Self {
        if addr < DMA_BOUND {
            Self::Dma
        } else if addr < LOWMEM_BOUND {
            Self::LowMem
        } else {
            match domain {
                Some(d) if (d as usize) < MAX_PROXIMITY_DOMAINS => Self::Domain(d as u8),
                _ => Self::Uma,
            }
        }
    }
}

/// Assign every descriptor its zone.
///
/// A page only carries a domain zone when it lies entirely within one
/// proximity region; pages straddling a region edge fall back to UMA. The
/// last resolved region is cached so consecutive pages of the same region
/// skip the table walk.
pub fn classify_pages(pages: &mut [PageDescriptor], numa: Option<ProximityMap<'_>>) {
    let mut cached: Option<ProximityRegion> = None;
    for (i, page) in pages.iter_mut().enumerate() {
        let base = (i as u64) << SUPERPAGE_SHIFT;
        let domain = resolve_domain(base, numa, &mut cached);
        page.set_zone(Zone::classify(base, domain));
    }
}

fn resolve_domain(
    base: u64,
    numa: Option<ProximityMap<'_>>,
    cached: &mut Option<ProximityRegion>,
) -> Option<u32> {
    // Locality never matters below the low memory bound.
    if base < LOWMEM_BOUND {
        return None;
    }
    let map = numa?;
    if let Some(region) = *cached {
        if region.contains_range(base, SUPERPAGE_SIZE) {
            return Some(region.domain);
        }
    }
    let region = map.resolve(base)?;
    if region.contains_range(base, SUPERPAGE_SIZE) {
        *cached = Some(region);
        Some(region.domain)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_boundaries() {
        assert_eq!(Zone::classify(0, None), Zone::Dma);
        assert_eq!(Zone::classify(DMA_BOUND - SUPERPAGE_SIZE, None), Zone::Dma);
        assert_eq!(Zone::classify(DMA_BOUND, None), Zone::LowMem);
        assert_eq!(Zone::classify(LOWMEM_BOUND - SUPERPAGE_SIZE, None), Zone::LowMem);
        assert_eq!(Zone::classify(LOWMEM_BOUND, None), Zone::Uma);
    }

    #[test]
    fn domain_applies_above_lowmem_only() {
        assert_eq!(Zone::classify(0, Some(2)), Zone::Dma);
        assert_eq!(Zone::classify(DMA_BOUND, Some(2)), Zone::LowMem);
        assert_eq!(Zone::classify(LOWMEM_BOUND, Some(2)), Zone::Domain(2));
    }

    #[test]
    fn oversized_domains_fold_to_uma() {
        assert_eq!(Zone::classify(LOWMEM_BOUND, Some(16)), Zone::Uma);
        assert_eq!(Zone::Domain(16).slot(), Zone::Uma.slot());
        assert_eq!(Zone::Domain(15).slot(), 18);
    }

    #[test]
    fn slots_are_distinct() {
        let zones = [Zone::Dma, Zone::LowMem, Zone::Uma, Zone::Domain(0), Zone::Domain(15)];
        for (i, a) in zones.iter().enumerate() {
            for b in &zones[i + 1..] {
                assert_ne!(a.slot(), b.slot());
            }
        }
        assert!(zones.iter().all(|z| z.slot() < Zone::SLOTS));
    }

    #[test]
    fn classification_uses_proximity_regions() {
        // 4 pages at 4 GiB in domain 0, 2 pages in domain 1, then a region
        // too short to cover a whole page.
        let regions = [
            ProximityRegion::new(LOWMEM_BOUND, 4 * SUPERPAGE_SIZE, 0),
            ProximityRegion::new(LOWMEM_BOUND + 4 * SUPERPAGE_SIZE, 2 * SUPERPAGE_SIZE, 1),
            ProximityRegion::new(LOWMEM_BOUND + 6 * SUPERPAGE_SIZE, SUPERPAGE_SIZE / 2, 2),
        ];
        let numa = ProximityMap::new(&regions);

        // Descriptors for the eight pages starting at 4 GiB; classify_pages
        // works on indices, so fake it by classifying addresses directly.
        let mut cached = None;
        let domains: Vec<_> = (0..8)
            .map(|i| resolve_domain(LOWMEM_BOUND + i * SUPERPAGE_SIZE, Some(numa), &mut cached))
            .collect();
        assert_eq!(
            domains,
            [
                Some(0),
                Some(0),
                Some(0),
                Some(0),
                Some(1),
                Some(1),
                None,
                None
            ]
        );
    }

    #[test]
    fn classify_pages_assigns_low_zones() {
        let mut pages = vec![PageDescriptor::new(); 16];
        classify_pages(&mut pages, None);
        // 16 MiB = 8 superpages of DMA, the rest low memory.
        for (i, p) in pages.iter().enumerate() {
            let want = if i < 8 { Zone::Dma } else { Zone::LowMem };
            assert_eq!(p.zone(), want, "page {i}");
        }
    }
}

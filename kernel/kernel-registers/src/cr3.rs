#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// CR3 — root paging table base register (IA-32e, PCID disabled).
///
/// Holds the physical base of the level-4 table and the cache-control flags
/// for walks through it. Assumes standard 4 KiB alignment and no PCID
/// (CR4.PCIDE = 0). Writing CR3 flushes all non-global TLB entries.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2 — Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 — PWT: Page-level Write-Through for root table walks.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for root table walks.
    pub pcd: bool,

    /// Bits 5–11 — Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–51 — Root table physical base >> 12.
    #[bits(40)]
    root_base_4k: u64,

    /// Bits 52–63 — Reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// Create a `Cr3` value pointing at `root`, with write-back caching.
    #[must_use]
    pub const fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_root_base_4k(root.page_number())
    }

    /// The root table page.
    #[must_use]
    pub const fn root(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_page_number(self.root_base_4k())
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn root_round_trip() {
        let root = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x10_3000));
        let cr3 = Cr3::from_root(root);
        assert_eq!(cr3.into_bits(), 0x10_3000);
        assert_eq!(cr3.root().base().as_u64(), 0x10_3000);
        assert!(!cr3.pwt());
        assert!(!cr3.pcd());
    }
}

//! # Privileged Paging Operations
//!
//! [`X86Paging`] is the production [`PagingHardware`]: it writes the
//! control registers and issues `invlpg` on the current processor. The
//! type exists on every target so it can be named portably; the
//! implementation is only compiled for x86-64, everything else (and the
//! host test suite) substitutes a recording mock.

#[cfg(target_arch = "x86_64")]
use crate::PagingHardware;
#[cfg(target_arch = "x86_64")]
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
#[cfg(target_arch = "x86_64")]
use kernel_registers::{cr3::Cr3, cr4::Cr4, LoadRegisterUnsafe, StoreRegisterUnsafe};

/// Paging primitives executed on the current x86-64 processor.
///
/// All operations require CPL 0. [`PagingHardware::load_root`] writes CR3,
/// which also flushes every non-global TLB entry; the global-page toggle
/// flips `CR4.PGE`, the architectural way to flush global entries too.
pub struct X86Paging;

#[cfg(target_arch = "x86_64")]
impl PagingHardware for X86Paging {
    unsafe fn load_root(&self, root: PhysicalPage<Size4K>) {
        // SAFETY: caller guarantees the hierarchy under `root` maps the
        // executing code; plain root load, PCIDs are not in use.
        unsafe { Cr3::from_root(root).store_unsafe() }
    }

    fn invalidate(&self, va: VirtualAddress) {
        // SAFETY: invlpg is non-faulting for any canonical address and
        // only drops a TLB entry.
        unsafe {
            core::arch::asm!(
                "invlpg [{}]",
                in(reg) va.as_u64(),
                options(nostack, preserves_flags)
            );
        }
    }

    unsafe fn disable_global_pages(&self) {
        // SAFETY: CPL-0 read-modify-write of CR4; caller pairs this with
        // enable_global_pages around the root load.
        unsafe {
            let cr4 = Cr4::load_unsafe();
            cr4.with_pge(false).store_unsafe();
        }
    }

    unsafe fn enable_global_pages(&self) {
        // SAFETY: see disable_global_pages.
        unsafe {
            let cr4 = Cr4::load_unsafe();
            cr4.with_pge(true).store_unsafe();
        }
    }
}

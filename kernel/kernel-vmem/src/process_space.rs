//! # Process Address Spaces
//!
//! A process sees six 1 GiB slots under the first top-level entry. Five of
//! them carry a process-owned page directory; the slot at
//! [`KERNEL_WINDOW_SLOT`] aliases the kernel window's directory, so kernel
//! code and data stay reachable across every address-space switch without
//! being writable through this interface.
//!
//! Every owned directory is paired with a *shadow* table of the same
//! shape. Hardware walks the real directory, whose entries carry physical
//! addresses; the shadow mirrors it entry for entry but carries virtual
//! addresses instead: the mapped address for a superpage leaf, the
//! kernel-window alias of the fourth-level table for a directory entry.
//! Translation reads the shadow to tell leaves from tables, and teardown
//! walks it to find every pooled table page without touching hardware
//! state.
//!
//! All table pages come from the kernel's table-page pool, so a space
//! costs a fixed twelve pages up front plus one per fourth-level table,
//! and teardown returns exactly what was taken.

use crate::kernel_space::{KernelSpace, window_alias};
use crate::page_table::{L1Index, L2Index, PageTable, PageTableEntry, TABLE_ENTRIES, directory_slot};
use crate::{Granularity, MapFlags, PagingHardware, PhysMapper, VmemError, table_at};
use kernel_bootinfo::layout::{KERNEL_WINDOW_BASE, KERNEL_WINDOW_SLOT};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress};
use log::debug;

/// Number of 1 GiB slots a process address space covers.
pub const PROCESS_DIRECTORY_COUNT: usize = 6;

/// Pool pages per space: top table, second-level table, and a directory
/// plus shadow for every slot except the kernel alias.
const PROCESS_TABLE_PAGES: usize = 2 + 2 * (PROCESS_DIRECTORY_COUNT - 1);

/// A page directory owned by a process space.
#[derive(Copy, Clone)]
struct OwnedDirectory {
    /// The directory the hardware walks.
    table: PhysicalPage<Size4K>,
    /// Mirror carrying virtual addresses in the address field.
    shadow: PhysicalPage<Size4K>,
}

/// One process's paging hierarchy.
///
/// Holds only page identities; the tables themselves live in pool pages
/// and are reached through the kernel space's [`PhysMapper`]. Every
/// operation therefore takes the kernel space explicitly.
pub struct ProcessAddressSpace {
    root: PhysicalPage<Size4K>,
    pointer_table: PhysicalPage<Size4K>,
    directories: [Option<OwnedDirectory>; PROCESS_DIRECTORY_COUNT],
}

impl ProcessAddressSpace {
    /// Build an empty process space from the kernel's table-page pool.
    ///
    /// Wires the top table to the second-level table, the second-level
    /// slots to fresh zeroed directories, and the kernel alias slot to the
    /// kernel window's own directory entry.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] when the pool cannot supply all table
    /// pages; everything taken so far is returned to the pool.
    pub fn create<M: PhysMapper, H: PagingHardware>(
        kernel: &mut KernelSpace<'_, M, H>,
    ) -> Result<Self, VmemError> {
        let mut pages = [PhysicalPage::from_addr(PhysicalAddress::zero()); PROCESS_TABLE_PAGES];
        take_pool_pages(kernel, &mut pages)?;

        let root = pages[0];
        let pointer_table = pages[1];
        let mapper = kernel.mapper();

        // SAFETY: all twelve frames were just taken from the pool; nothing
        // else references them.
        let pml4 = unsafe { table_at::<M, PageTable>(mapper, root) };
        let pdpt = unsafe { table_at::<M, PageTable>(mapper, pointer_table) };
        pml4.zero();
        pdpt.zero();
        pml4.set(0, PageTableEntry::directory(pointer_table));

        let mut directories = [None; PROCESS_DIRECTORY_COUNT];
        let mut next = 2;
        for (slot, entry) in directories.iter_mut().enumerate() {
            if slot == usize::from(KERNEL_WINDOW_SLOT) {
                pdpt.set(slot, kernel.window_directory_entry());
                continue;
            }
            let owned = OwnedDirectory {
                table: pages[next],
                shadow: pages[next + 1],
            };
            next += 2;
            // SAFETY: fresh pool frames, as above.
            unsafe { table_at::<M, PageTable>(mapper, owned.table) }.zero();
            unsafe { table_at::<M, PageTable>(mapper, owned.shadow) }.zero();
            pdpt.set(slot, PageTableEntry::directory(owned.table));
            *entry = Some(owned);
        }

        debug!("process space created, root {:?}", root.base());
        Ok(Self {
            root,
            pointer_table,
            directories,
        })
    }

    /// The top-level table page, for the root register on a space switch.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Map `va` onto `pa` at the requested granularity.
    ///
    /// A superpage mapping that lands on a slot holding a fourth-level
    /// table returns that table to the pool first. A 4 KiB mapping that
    /// lands on an absent slot or on a superpage starts a fresh zeroed
    /// table from the pool; an evicted superpage simply stops translating,
    /// its frame stays with its owner. The mapped address is invalidated
    /// on the current processor either way.
    ///
    /// # Errors
    /// - [`VmemError::InvalidAddress`] when `va` falls outside the owned
    ///   slots (including the kernel alias slot) or either address is
    ///   unaligned for the granularity.
    /// - [`VmemError::OutOfMemory`] when a fresh fourth-level table is
    ///   needed and the pool is empty.
    pub fn map<M: PhysMapper, H: PagingHardware>(
        &mut self,
        kernel: &mut KernelSpace<'_, M, H>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        granularity: Granularity,
        flags: MapFlags,
    ) -> Result<(), VmemError> {
        let directory = self.owned_directory(va)?;
        match granularity {
            Granularity::Page2M => Self::map_superpage(kernel, directory, va, pa, flags),
            Granularity::Page4K => Self::map_page(kernel, directory, va, pa, flags),
        }
    }

    /// Translate `va` to its physical address.
    ///
    /// The shadow directory discriminates superpage leaves from
    /// fourth-level tables; addresses in the kernel alias slot translate
    /// through the kernel window itself. `None` for anything unmapped or
    /// outside the covered slots.
    #[must_use]
    pub fn translate<M: PhysMapper, H: PagingHardware>(
        &self,
        kernel: &KernelSpace<'_, M, H>,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let slot = directory_slot(va);
        if slot >= PROCESS_DIRECTORY_COUNT as u64 {
            return None;
        }
        if slot == u64::from(KERNEL_WINDOW_SLOT) {
            return kernel.translate(va);
        }
        let directory = self.directories[slot as usize]?;
        let mapper = kernel.mapper();
        let index = L2Index::from(va).as_usize();

        // SAFETY: the space owns both frames; this is a read-only walk.
        let marker = unsafe { table_at::<M, PageTable>(mapper, directory.shadow) }.get(index);
        if !marker.present() {
            return None;
        }
        let entry = unsafe { table_at::<M, PageTable>(mapper, directory.table) }.get(index);
        if marker.page_size() {
            let base = entry.leaf_2m()?;
            return Some(base.join(va.offset::<Size2M>()));
        }
        let table = entry.next_table()?;
        // SAFETY: a present shadow directory entry means the space owns
        // this fourth-level table.
        let leaf = unsafe { table_at::<M, PageTable>(mapper, table) }.get(L1Index::from(va).as_usize());
        let base = leaf.leaf_4k()?;
        Some(base.join(va.offset::<Size4K>()))
    }

    /// Tear the space down, returning every table page to the pool.
    ///
    /// Walks the shadows for fourth-level tables first, then frees the
    /// directories and shadows, then the top tables.
    pub fn destroy<M: PhysMapper, H: PagingHardware>(self, kernel: &mut KernelSpace<'_, M, H>) {
        let mut released = 0usize;
        for directory in self.directories.into_iter().flatten() {
            released += Self::release_tables(kernel, directory);
            kernel.pool_free(directory.table);
            kernel.pool_free(directory.shadow);
        }
        kernel.pool_free(self.pointer_table);
        kernel.pool_free(self.root);
        debug!("process space destroyed, {released} fourth-level tables released");
    }

    fn map_superpage<M: PhysMapper, H: PagingHardware>(
        kernel: &mut KernelSpace<'_, M, H>,
        directory: OwnedDirectory,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), VmemError> {
        if !va.is_aligned::<Size2M>() || !pa.is_aligned::<Size2M>() {
            return Err(VmemError::InvalidAddress);
        }
        let index = L2Index::from(va).as_usize();
        let mapper = kernel.mapper();
        // SAFETY: the space owns both frames and holds exclusive access.
        let pd = unsafe { table_at::<M, PageTable>(mapper, directory.table) };
        let shadow = unsafe { table_at::<M, PageTable>(mapper, directory.shadow) };

        // A fourth-level table in the slot goes back to the pool before
        // the superpage replaces it.
        if let Some(table) = pd.get(index).next_table() {
            kernel.pool_free(table);
        }

        pd.set(
            index,
            PageTableEntry::process_superpage(PhysicalPage::from_addr(pa), flags.global()),
        );
        shadow.set(index, shadow_superpage(va, flags.global()));
        kernel.hardware().invalidate(va);
        Ok(())
    }

    fn map_page<M: PhysMapper, H: PagingHardware>(
        kernel: &mut KernelSpace<'_, M, H>,
        directory: OwnedDirectory,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), VmemError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(VmemError::InvalidAddress);
        }
        let index = L2Index::from(va).as_usize();
        let mapper = kernel.mapper();
        // SAFETY: the space owns both frames and holds exclusive access.
        let pd = unsafe { table_at::<M, PageTable>(mapper, directory.table) };
        let shadow = unsafe { table_at::<M, PageTable>(mapper, directory.shadow) };

        let table = if let Some(table) = pd.get(index).next_table() {
            table
        } else {
            let table = kernel.pool_alloc()?;
            // SAFETY: fresh pool frame; zeroed before it becomes visible
            // to the hardware walk.
            unsafe { table_at::<M, PageTable>(mapper, table) }.zero();
            pd.set(index, PageTableEntry::directory(table));
            shadow.set(index, shadow_directory(table));
            table
        };
        // SAFETY: the table is owned by this slot, found or just created.
        let pt = unsafe { table_at::<M, PageTable>(mapper, table) };
        pt.set(
            L1Index::from(va).as_usize(),
            PageTableEntry::process_page(PhysicalPage::from_addr(pa), flags.global()),
        );
        kernel.hardware().invalidate(va);
        Ok(())
    }

    /// Return every fourth-level table recorded in the shadow to the pool.
    fn release_tables<M: PhysMapper, H: PagingHardware>(
        kernel: &mut KernelSpace<'_, M, H>,
        directory: OwnedDirectory,
    ) -> usize {
        let mut released = 0usize;
        for index in 0..TABLE_ENTRIES {
            // SAFETY: the space owns the shadow frame; read-only here.
            let entry =
                unsafe { table_at::<M, PageTable>(kernel.mapper(), directory.shadow) }.get(index);
            if entry.present() && !entry.page_size() {
                // The shadow holds the table's window alias.
                let table = PhysicalAddress::new(entry.raw_address() - KERNEL_WINDOW_BASE);
                kernel.pool_free(PhysicalPage::from_addr(table));
                released += 1;
            }
        }
        released
    }

    /// The owned directory covering `va`, or [`VmemError::InvalidAddress`]
    /// for the kernel alias slot and anything beyond the covered range.
    fn owned_directory(&self, va: VirtualAddress) -> Result<OwnedDirectory, VmemError> {
        let slot = directory_slot(va);
        if slot >= PROCESS_DIRECTORY_COUNT as u64 {
            return Err(VmemError::InvalidAddress);
        }
        self.directories[slot as usize].ok_or(VmemError::InvalidAddress)
    }
}

/// Shadow image of a superpage leaf: the same shape as the hardware entry,
/// with the mapped virtual address in the address field.
const fn shadow_superpage(va: VirtualAddress, global: bool) -> PageTableEntry {
    PageTableEntry::new()
        .with_present(true)
        .with_writable(true)
        .with_user(true)
        .with_page_size(true)
        .with_global(global)
        .with_raw_address(va.as_u64())
}

/// Shadow image of a directory entry: the fourth-level table's
/// kernel-window alias in the address field.
const fn shadow_directory(table: PhysicalPage<Size4K>) -> PageTableEntry {
    PageTableEntry::new()
        .with_present(true)
        .with_writable(true)
        .with_user(true)
        .with_raw_address(window_alias(table.base()).as_u64())
}

/// Fill `pages` from the pool, unwinding on exhaustion.
fn take_pool_pages<M: PhysMapper, H: PagingHardware>(
    kernel: &mut KernelSpace<'_, M, H>,
    pages: &mut [PhysicalPage<Size4K>],
) -> Result<(), VmemError> {
    let mut filled = 0;
    while filled < pages.len() {
        match kernel.pool_alloc() {
            Ok(page) => {
                pages[filled] = page;
                filled += 1;
            }
            Err(error) => {
                for page in &pages[..filled] {
                    kernel.pool_free(*page);
                }
                return Err(error);
            }
        }
    }
    Ok(())
}

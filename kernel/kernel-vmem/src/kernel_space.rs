//! # Kernel Address Space
//!
//! The kernel owns exactly one gigabyte of virtual memory, the *window* at
//! [`KERNEL_WINDOW_BASE`]: second-level slot [`KERNEL_WINDOW_SLOT`] under
//! the first top-level entry, mapped superpage by superpage through a
//! single reserved page directory. [`KernelSpace::bootstrap`] builds that
//! three-table hierarchy once, early, inside the fixed bookkeeping region
//! at [`BOOTSTRAP_BASE`]:
//!
//! ```text
//! BOOTSTRAP_BASE ─┬──────────────┐
//!                 │ PML4         │ 4 KiB   entry 0 → PDPT
//!                 ├──────────────┤
//!                 │ PDPT         │ 4 KiB   entry 3 → PD
//!                 ├──────────────┤
//!                 │ PD           │ 4 KiB   identity superpages, reflections
//!                 ├──────────────┤
//!                 │ logical page │ one descriptor per window superpage
//!                 │ array (512)  │
//!                 ├──────────────┤
//!                 │ table-page   │ 4 KiB frames for process page tables,
//!                 │ pool         │ linked through their leading bytes
//! BOOTSTRAP_BASE ─┴──────────────┘
//!   + BOOTSTRAP_SIZE
//! ```
//!
//! The *logical page array* describes the window: the low-memory
//! reservation, the superpages carrying the physical allocator's
//! descriptors, the general kernel region that [`reserve_pages`] and
//! [`attach`] hand out, and the device window at the top that aliases its
//! own addresses for memory-mapped hardware. Reflection walks the array
//! and installs a superpage mapping for every page that is both usable and
//! used, so the page directory is always an image of the array.
//!
//! Mapping in the window is 2 MiB-only. The general region's free
//! superpages are managed by the same buddy free lists as physical memory,
//! over the window's own indices; the array is not zoned, so the
//! descriptors' boot zone keys a single list slot.
//!
//! [`reserve_pages`]: KernelSpace::reserve_pages
//! [`attach`]: KernelSpace::attach

use crate::page_table::{L2Index, PageTable, PageTableEntry, directory_slot};
use crate::{PagingHardware, PhysMapper, VmemError, table_at};
use kernel_bootinfo::layout::{
    BOOTSTRAP_BASE, BOOTSTRAP_SIZE, KERNEL_REGION_PAGES, KERNEL_WINDOW_BASE, KERNEL_WINDOW_PAGES,
    KERNEL_WINDOW_SLOT, LOW_MEMORY_BOUND, SUPERPAGE_SHIFT, SUPERPAGE_SIZE,
};
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress, VirtualPage,
};
use kernel_pmem::{FreeLists, MAX_BUDDY_ORDER, PageDescriptor, PageFlags, PageIndex, Zone};
use log::{debug, info};

/// Link value marking the last free page of the table-page pool.
const POOL_END: u32 = u32::MAX;

/// The virtual address at which the kernel window aliases physical
/// address `pa`.
///
/// Valid for everything the window covers identically: the low-memory
/// region mapped at bootstrap, and therefore the whole bookkeeping region.
#[inline]
#[must_use]
pub const fn window_alias(pa: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(KERNEL_WINDOW_BASE + pa.as_u64())
}

/// The kernel's address space: three fixed tables, the logical page array
/// and the table-page pool, all inside the bookkeeping region.
///
/// Exists once. Every operation takes the space explicitly; there is no
/// global instance, and no locking — the caller serializes access.
pub struct KernelSpace<'c, M: PhysMapper, H: PagingHardware> {
    mapper: &'c M,
    hardware: &'c H,
    /// The top-level table, also the value loaded into the root register.
    root: PhysicalPage<Size4K>,
    /// Second-level table; only slot [`KERNEL_WINDOW_SLOT`] is wired.
    pointer_table: PhysicalPage<Size4K>,
    /// The window's single page directory.
    directory: PhysicalPage<Size4K>,
    /// Physical base of the logical page array.
    pages: PhysicalAddress,
    /// First logical page of the general kernel region. Everything below
    /// it, and the device window from [`KERNEL_REGION_PAGES`] up, is
    /// boot-owned and never detaches.
    general_base: usize,
    /// First free page of the table-page pool, as a region-relative
    /// 4 KiB index.
    pool_head: Option<u32>,
    /// Buddy lists over the general kernel region's logical pages.
    lists: FreeLists,
}

impl<'c, M: PhysMapper, H: PagingHardware> KernelSpace<'c, M, H> {
    /// Build and activate the kernel's own address space.
    ///
    /// Lays out the three tables, the logical page array and the table-page
    /// pool in the bookkeeping region, identity-maps low memory with global
    /// superpages, loads the root with global pages disabled so stale
    /// global translations flush, then reflects the logical page array into
    /// the page directory and seeds the window's free lists.
    ///
    /// `metadata` and `metadata_pages` name the superpage run holding the
    /// physical allocator's descriptors; those window pages are reflected
    /// onto it.
    ///
    /// # Errors
    /// [`VmemError::LayoutOverflow`] when the bootstrap structures exceed
    /// the bookkeeping region, the low-memory region needs more identity
    /// entries than one directory holds, or the metadata run would spill
    /// into the general kernel region.
    #[allow(clippy::cast_possible_truncation)]
    pub fn bootstrap(
        mapper: &'c M,
        hardware: &'c H,
        metadata: PhysicalPage<Size2M>,
        metadata_pages: u64,
    ) -> Result<Self, VmemError> {
        let root = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(BOOTSTRAP_BASE));
        let pointer_table = PhysicalPage::<Size4K>::from_page_number(root.page_number() + 1);
        let directory = PhysicalPage::<Size4K>::from_page_number(root.page_number() + 2);

        // Region layout: tables, then the array, then pool pages.
        let pages_base = directory.base() + 4096;
        let pages_end =
            pages_base + (KERNEL_WINDOW_PAGES * size_of::<PageDescriptor>()) as u64;
        let pool_base = pages_end.align_up::<Size4K>();
        if pool_base.as_u64() > BOOTSTRAP_BASE + BOOTSTRAP_SIZE {
            return Err(VmemError::LayoutOverflow);
        }

        let low_pages = LOW_MEMORY_BOUND.div_ceil(SUPERPAGE_SIZE);
        if low_pages > KERNEL_WINDOW_PAGES as u64 {
            return Err(VmemError::LayoutOverflow);
        }
        if low_pages + metadata_pages > KERNEL_REGION_PAGES as u64 {
            return Err(VmemError::LayoutOverflow);
        }

        // SAFETY: the three frames are distinct, inside the reserved
        // region, and not yet referenced by anything else.
        let pml4 = unsafe { table_at::<M, PageTable>(mapper, root) };
        let pdpt = unsafe { table_at::<M, PageTable>(mapper, pointer_table) };
        let pd = unsafe { table_at::<M, PageTable>(mapper, directory) };
        pml4.zero();
        pdpt.zero();
        pd.zero();
        pml4.set(0, PageTableEntry::directory(pointer_table));
        pdpt.set(
            usize::from(KERNEL_WINDOW_SLOT),
            PageTableEntry::directory(directory),
        );
        for i in 0..low_pages {
            pd.set(
                i as usize,
                PageTableEntry::kernel_superpage(PhysicalPage::from_page_number(i), true),
            );
        }

        // Switch with CR4.PGE off so global entries of the boot map flush.
        unsafe {
            hardware.disable_global_pages();
            hardware.load_root(root);
            hardware.enable_global_pages();
        }

        let mut space = Self {
            mapper,
            hardware,
            root,
            pointer_table,
            directory,
            pages: pages_base,
            general_base: (low_pages + metadata_pages) as usize,
            pool_head: None,
            lists: FreeLists::new(),
        };
        space.prepare_logical_pages(metadata, metadata_pages);
        let pooled = space.thread_pool(pool_base);
        let reflected = space.reflect()?;
        let pages = space.logical_pages();
        space.lists.populate(pages);

        info!(
            "kernel window active: {low_pages} identity superpages, {reflected} reflected, {pooled} pool pages"
        );
        Ok(space)
    }

    /// The top-level table page, for the root register.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Map one window superpage at `va` onto the physical superpage at
    /// `pa`. The entry is installed global and writable, and the address
    /// is invalidated afterwards.
    ///
    /// `flags` are the logical page's flags; the page must be usable and
    /// used. An existing superpage mapping is replaced.
    ///
    /// # Errors
    /// - [`VmemError::InvalidFlags`] unless `flags` say usable and used.
    /// - [`VmemError::InvalidAddress`] when `va` is outside the window or
    ///   either address is not superpage-aligned.
    /// - [`VmemError::UnsupportedGranularity`] when the slot holds a
    ///   fourth-level table pointer; nothing installs those in the window,
    ///   and 4 KiB mappings are not supported here.
    pub fn map(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmemError> {
        if !flags.usable() || !flags.used() {
            return Err(VmemError::InvalidFlags);
        }
        if directory_slot(va) != u64::from(KERNEL_WINDOW_SLOT) {
            return Err(VmemError::InvalidAddress);
        }
        if !va.is_aligned::<Size2M>() || !pa.is_aligned::<Size2M>() {
            return Err(VmemError::InvalidAddress);
        }
        let index = L2Index::from(va).as_usize();
        let pd = self.directory_table();
        let entry = pd.get(index);
        if entry.present() && !entry.page_size() {
            return Err(VmemError::UnsupportedGranularity);
        }
        pd.set(
            index,
            PageTableEntry::kernel_superpage(PhysicalPage::from_addr(pa), true),
        );
        self.hardware.invalidate(va);
        Ok(())
    }

    /// Borrow the window's page directory for reading.
    fn directory_ref(&self) -> &PageTable {
        // SAFETY: fixed frame laid out at bootstrap; access is serialized
        // by the caller holding the space.
        unsafe { table_at::<M, PageTable>(self.mapper, self.directory) }
    }

    /// Remove the window superpage mapping at `va` and invalidate it.
    ///
    /// # Errors
    /// - [`VmemError::InvalidAddress`] when `va` is outside the window or
    ///   not superpage-aligned.
    /// - [`VmemError::NotMapped`] when the slot holds no superpage.
    pub fn unmap(&mut self, va: VirtualAddress) -> Result<(), VmemError> {
        if directory_slot(va) != u64::from(KERNEL_WINDOW_SLOT) {
            return Err(VmemError::InvalidAddress);
        }
        if !va.is_aligned::<Size2M>() {
            return Err(VmemError::InvalidAddress);
        }
        let index = L2Index::from(va).as_usize();
        let pd = self.directory_table();
        let entry = pd.get(index);
        if entry.leaf_2m().is_none() {
            return Err(VmemError::NotMapped);
        }
        pd.set(index, PageTableEntry::new());
        self.hardware.invalidate(va);
        Ok(())
    }

    /// Translate a window address to its physical address.
    ///
    /// `None` outside the window, for an empty slot, and for a slot that
    /// holds anything but a superpage leaf.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if directory_slot(va) != u64::from(KERNEL_WINDOW_SLOT) {
            return None;
        }
        let entry = self.directory_ref().get(L2Index::from(va).as_usize());
        let base = entry.leaf_2m()?;
        Some(base.join(va.offset::<Size2M>()))
    }

    /// Reserve `2^order` contiguous, unbacked superpages from the general
    /// kernel region and return the run's first page.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] when no free run of that order exists.
    pub fn reserve_pages(&mut self, order: u8) -> Result<VirtualPage<Size2M>, VmemError> {
        let pages = self.logical_pages();
        let index = self
            .lists
            .alloc(pages, Zone::LowMem, order)
            .map_err(|_| VmemError::OutOfMemory)?;
        Ok(Self::window_page(index.as_usize()))
    }

    /// Return a reserved run of `2^order` superpages to the free lists.
    ///
    /// The pages must be detached; freeing coalesces with free neighbors.
    ///
    /// # Errors
    /// [`VmemError::InvalidAddress`] unless the run satisfies
    /// [`Self::is_general_run`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn release_pages(&mut self, page: VirtualPage<Size2M>, order: u8) -> Result<(), VmemError> {
        let index = self.general_run(page, order)?;
        let pages = self.logical_pages();
        self.lists.free(pages, PageIndex::new(index as u32), order);
        Ok(())
    }

    /// Back the reserved window page `page` with the physical superpage
    /// `backing` and install the mapping.
    ///
    /// # Errors
    /// - [`VmemError::InvalidAddress`] when `page` is outside the general
    ///   kernel region.
    /// - [`VmemError::InvalidFlags`] when the logical page is not reserved.
    /// - [`VmemError::AlreadyMapped`] when the page already has a backing.
    pub fn attach(
        &mut self,
        page: VirtualPage<Size2M>,
        backing: PhysicalPage<Size2M>,
    ) -> Result<(), VmemError> {
        let index = self.general_run(page, 0)?;
        let descriptor = self.logical_pages()[index];
        if !descriptor.is_usable() || !descriptor.is_used() {
            return Err(VmemError::InvalidFlags);
        }
        if descriptor.backing().as_u64() != 0 {
            return Err(VmemError::AlreadyMapped);
        }
        self.map(page.base(), backing.base(), descriptor.flags())?;
        self.logical_pages()[index].set_backing(backing.base());
        Ok(())
    }

    /// Unmap the window page `page` and strip its backing, returning the
    /// physical superpage for the caller to free.
    ///
    /// Only general-region pages detach. The boot-owned mappings — low
    /// memory, the metadata run, the device window — are permanent, even
    /// though their descriptors carry the same usable/used/backing shape
    /// as an attached page.
    ///
    /// # Errors
    /// - [`VmemError::InvalidAddress`] when `page` is outside the general
    ///   kernel region.
    /// - [`VmemError::InvalidFlags`] when the logical page is not reserved.
    /// - [`VmemError::NotMapped`] when the page has no backing.
    pub fn detach(&mut self, page: VirtualPage<Size2M>) -> Result<PhysicalPage<Size2M>, VmemError> {
        let index = self.general_run(page, 0)?;
        let descriptor = self.logical_pages()[index];
        if !descriptor.is_usable() || !descriptor.is_used() {
            return Err(VmemError::InvalidFlags);
        }
        let backing = descriptor.backing();
        if backing.as_u64() == 0 {
            return Err(VmemError::NotMapped);
        }
        self.unmap(page.base())?;
        self.logical_pages()[index].set_backing(PhysicalAddress::zero());
        Ok(PhysicalPage::from_addr(backing))
    }

    /// Whether `run` names `2^order` superpages lying wholly inside the
    /// general kernel region, aligned for the order.
    ///
    /// Exactly these runs come out of [`Self::reserve_pages`], and only
    /// they pass [`Self::attach`], [`Self::detach`] and
    /// [`Self::release_pages`].
    #[must_use]
    pub fn is_general_run(&self, run: VirtualPage<Size2M>, order: u8) -> bool {
        self.general_run(run, order).is_ok()
    }

    /// Take one raw 4 KiB page from the table-page pool.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] when the pool is empty.
    pub(crate) fn pool_alloc(&mut self) -> Result<PhysicalPage<Size4K>, VmemError> {
        let Some(index) = self.pool_head else {
            return Err(VmemError::OutOfMemory);
        };
        let page = Self::pool_page(index);
        // SAFETY: a pooled page is unreferenced; its leading bytes hold
        // the link written by pool_free or the threader.
        let link: &u32 = unsafe { self.mapper.phys_to_mut(page.base()) };
        self.pool_head = if *link == POOL_END { None } else { Some(*link) };
        Ok(page)
    }

    /// Return a 4 KiB page to the table-page pool.
    pub(crate) fn pool_free(&mut self, page: PhysicalPage<Size4K>) {
        let pa = page.base().as_u64();
        debug_assert!(
            pa >= BOOTSTRAP_BASE && pa < BOOTSTRAP_BASE + BOOTSTRAP_SIZE,
            "pool page outside the bookkeeping region"
        );
        // SAFETY: the caller relinquishes the page; its content is dead.
        let link: &mut u32 = unsafe { self.mapper.phys_to_mut(page.base()) };
        *link = self.pool_head.unwrap_or(POOL_END);
        self.pool_head = Some(Self::pool_index(page));
    }

    /// The second-level entry carrying the window's page directory, the
    /// value process spaces alias into their own second-level table.
    pub(crate) fn window_directory_entry(&self) -> PageTableEntry {
        // SAFETY: the table was laid out at bootstrap and only this space
        // materializes it.
        let pdpt = unsafe { table_at::<M, PageTable>(self.mapper, self.pointer_table) };
        pdpt.get(usize::from(KERNEL_WINDOW_SLOT))
    }

    pub(crate) const fn mapper(&self) -> &'c M {
        self.mapper
    }

    pub(crate) const fn hardware(&self) -> &'c H {
        self.hardware
    }

    /// Initialize the logical page array: the low-memory reservation, the
    /// metadata run backed by the descriptor region, the general kernel
    /// region, and the identity-aliased device window.
    #[allow(clippy::cast_possible_truncation)]
    fn prepare_logical_pages(&mut self, metadata: PhysicalPage<Size2M>, metadata_pages: u64) {
        let low = (LOW_MEMORY_BOUND >> SUPERPAGE_SHIFT) as usize;
        let metadata_end = low + metadata_pages as usize;
        let pages = self.logical_pages();
        for (index, descriptor) in pages.iter_mut().enumerate() {
            *descriptor = PageDescriptor::new();
            let n = index as u64;
            if index < low {
                // Boot reservation: occupied, never reflected or handed out.
                descriptor.set_used(true);
                descriptor.set_backing(PhysicalAddress::new(n << SUPERPAGE_SHIFT));
            } else if index < metadata_end {
                descriptor.set_usable(true);
                descriptor.set_used(true);
                descriptor
                    .set_backing(metadata.base() + ((n - low as u64) << SUPERPAGE_SHIFT));
            } else if index < KERNEL_REGION_PAGES {
                descriptor.set_usable(true);
            } else {
                // Device window: backed by the numerically equal physical
                // addresses, where the APICs and friends live.
                descriptor.set_usable(true);
                descriptor.set_used(true);
                descriptor.set_backing(PhysicalAddress::new(
                    KERNEL_WINDOW_BASE + (n << SUPERPAGE_SHIFT),
                ));
            }
        }
    }

    /// Thread every remaining 4 KiB page of the bookkeeping region onto
    /// the pool. Returns the page count.
    fn thread_pool(&mut self, first: PhysicalAddress) -> usize {
        let end = BOOTSTRAP_BASE + BOOTSTRAP_SIZE;
        let mut pa = first.as_u64();
        let mut count = 0usize;
        while pa + 4096 <= end {
            self.pool_free(PhysicalPage::from_addr(PhysicalAddress::new(pa)));
            count += 1;
            pa += 4096;
        }
        count
    }

    /// Install a superpage mapping for every logical page that is both
    /// usable and used. Returns the mapping count.
    fn reflect(&mut self) -> Result<usize, VmemError> {
        let mut mapped = 0usize;
        for index in 0..KERNEL_WINDOW_PAGES {
            let descriptor = self.logical_pages()[index];
            if !descriptor.is_usable() || !descriptor.is_used() {
                continue;
            }
            self.map(
                Self::window_page(index).base(),
                descriptor.backing(),
                descriptor.flags(),
            )?;
            mapped += 1;
        }
        debug!("kernel window: {mapped} superpages reflected");
        Ok(mapped)
    }

    /// Materialize the logical page array.
    ///
    /// The returned borrow is deliberately unbound: the array lives in the
    /// bookkeeping region, not in `self`. Callers keep at most one such
    /// borrow alive at a time.
    fn logical_pages<'a>(&mut self) -> &'a mut [PageDescriptor; KERNEL_WINDOW_PAGES] {
        // SAFETY: laid out at bootstrap inside the reserved region; every
        // access funnels through &mut self.
        unsafe { self.mapper.phys_to_mut(self.pages) }
    }

    /// Borrow the window's page directory for writing.
    ///
    /// Unbound like [`logical_pages`](Self::logical_pages); the frame is
    /// fixed and all writers funnel through `&mut self`.
    fn directory_table<'a>(&mut self) -> &'a mut PageTable {
        // SAFETY: fixed frame laid out at bootstrap; access is serialized
        // by the caller holding the space.
        unsafe { table_at::<M, PageTable>(self.mapper, self.directory) }
    }

    /// The window page at logical index `index`.
    #[allow(clippy::cast_possible_truncation)]
    const fn window_page(index: usize) -> VirtualPage<Size2M> {
        VirtualPage::from_page_number((KERNEL_WINDOW_BASE >> SUPERPAGE_SHIFT) + index as u64)
    }

    /// Logical index of a window page, or [`VmemError::InvalidAddress`]
    /// outside the window.
    fn window_index(page: VirtualPage<Size2M>) -> Result<usize, VmemError> {
        let va = page.base();
        if directory_slot(va) != u64::from(KERNEL_WINDOW_SLOT) {
            return Err(VmemError::InvalidAddress);
        }
        Ok(L2Index::from(va).as_usize())
    }

    /// Logical index of a `2^order` run lying wholly inside the general
    /// kernel region, or [`VmemError::InvalidAddress`] for anything else:
    /// outside the window, an out-of-range order, an index the order
    /// leaves unaligned, or a run touching boot-owned pages.
    fn general_run(&self, page: VirtualPage<Size2M>, order: u8) -> Result<usize, VmemError> {
        let index = Self::window_index(page)?;
        if order > MAX_BUDDY_ORDER
            || index & ((1 << order) - 1) != 0
            || index < self.general_base
            || index + (1 << order) > KERNEL_REGION_PAGES
        {
            return Err(VmemError::InvalidAddress);
        }
        Ok(index)
    }

    /// The pool page at region-relative index `index`.
    const fn pool_page(index: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_page_number((BOOTSTRAP_BASE >> 12) + index as u64)
    }

    /// Region-relative index of a pool page.
    #[allow(clippy::cast_possible_truncation)]
    const fn pool_index(page: PhysicalPage<Size4K>) -> u32 {
        ((page.base().as_u64() - BOOTSTRAP_BASE) >> 12) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HardwareEvent, MockHardware, TestPhys};

    /// Simulated RAM covering the whole bookkeeping region.
    fn ram() -> TestPhys {
        TestPhys::with_frames(((BOOTSTRAP_BASE + BOOTSTRAP_SIZE) / 4096) as usize)
    }

    /// The 64 MiB machine: descriptor metadata in one superpage at 32 MiB.
    fn metadata() -> PhysicalPage<Size2M> {
        PhysicalPage::from_addr(PhysicalAddress::new(0x0200_0000))
    }

    fn boot<'c>(
        phys: &'c TestPhys,
        hardware: &'c MockHardware,
    ) -> KernelSpace<'c, TestPhys, MockHardware> {
        KernelSpace::bootstrap(phys, hardware, metadata(), 1).expect("bootstrap")
    }

    #[test]
    fn bootstrap_wires_three_tables_and_switches() {
        let phys = ram();
        let hardware = MockHardware::new();
        let space = boot(&phys, &hardware);

        let pml4 = unsafe { table_at::<TestPhys, PageTable>(&phys, space.root) };
        assert_eq!(pml4.get(0).next_table(), Some(space.pointer_table));
        let pdpt = unsafe { table_at::<TestPhys, PageTable>(&phys, space.pointer_table) };
        assert_eq!(
            pdpt.get(usize::from(KERNEL_WINDOW_SLOT)).next_table(),
            Some(space.directory)
        );

        // 16 global identity superpages cover low memory.
        let pd = unsafe { table_at::<TestPhys, PageTable>(&phys, space.directory) };
        for i in 0..16 {
            let entry = pd.get(i);
            assert_eq!(entry.leaf_2m(), Some(PhysicalPage::from_page_number(i as u64)));
            assert!(entry.global());
            assert!(!entry.user());
        }

        // The switch happens with global pages disabled.
        let events = hardware.events.borrow();
        assert_eq!(events[0], HardwareEvent::DisableGlobalPages);
        assert_eq!(events[1], HardwareEvent::LoadRoot(space.root));
        assert_eq!(events[2], HardwareEvent::EnableGlobalPages);
    }

    #[test]
    fn reflection_covers_metadata_and_device_runs() {
        let phys = ram();
        let hardware = MockHardware::new();
        let space = boot(&phys, &hardware);

        // Window page 16 carries the descriptor superpage at 32 MiB.
        let metadata_va = VirtualAddress::new(KERNEL_WINDOW_BASE + 16 * SUPERPAGE_SIZE);
        assert_eq!(
            space.translate(metadata_va),
            Some(PhysicalAddress::new(0x0200_0000))
        );

        // The device window aliases its own numeric addresses.
        let device_va =
            VirtualAddress::new(KERNEL_WINDOW_BASE + KERNEL_REGION_PAGES as u64 * SUPERPAGE_SIZE);
        assert_eq!(space.translate(device_va), Some(PhysicalAddress::new(device_va.as_u64())));

        // The general region stays unmapped until attached.
        let general_va = VirtualAddress::new(KERNEL_WINDOW_BASE + 17 * SUPERPAGE_SIZE);
        assert_eq!(space.translate(general_va), None);

        // Low memory is reachable through the bootstrap identity entries.
        let low_va = VirtualAddress::new(KERNEL_WINDOW_BASE + 3 * SUPERPAGE_SIZE + 0x123);
        assert_eq!(
            space.translate(low_va),
            Some(PhysicalAddress::new(3 * SUPERPAGE_SIZE + 0x123))
        );

        // One metadata page plus the 192-page device window, one
        // invalidation each.
        assert_eq!(hardware.invalidations(), 193);
    }

    #[test]
    fn oversized_metadata_run_overflows_the_layout() {
        let phys = ram();
        let hardware = MockHardware::new();
        let result = KernelSpace::bootstrap(&phys, &hardware, metadata(), 320);
        assert_eq!(result.err(), Some(VmemError::LayoutOverflow));
    }

    #[test]
    fn map_validates_flags_window_and_alignment() {
        let phys = ram();
        let hardware = MockHardware::new();
        let mut space = boot(&phys, &hardware);

        let va = VirtualAddress::new(KERNEL_WINDOW_BASE + 17 * SUPERPAGE_SIZE);
        let pa = PhysicalAddress::new(0x0280_0000);
        let good = PageFlags::new().with_usable(true).with_used(true);

        assert_eq!(
            space.map(va, pa, PageFlags::new().with_usable(true)),
            Err(VmemError::InvalidFlags)
        );
        assert_eq!(
            space.map(VirtualAddress::new(0x8000_0000), pa, good),
            Err(VmemError::InvalidAddress)
        );
        assert_eq!(
            space.map(va + 0x1000, pa, good),
            Err(VmemError::InvalidAddress)
        );
        assert_eq!(
            space.map(va, pa + 0x1000, good),
            Err(VmemError::InvalidAddress)
        );

        space.map(va, pa, good).expect("map");
        assert_eq!(space.translate(va + 0x42), Some(pa + 0x42));

        // A slot holding a table pointer is never remapped.
        let table = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x11_0000));
        space
            .directory_table()
            .set(18, PageTableEntry::directory(table));
        let table_va = VirtualAddress::new(KERNEL_WINDOW_BASE + 18 * SUPERPAGE_SIZE);
        assert_eq!(
            space.map(table_va, pa, good),
            Err(VmemError::UnsupportedGranularity)
        );
        assert_eq!(space.translate(table_va), None);
    }

    #[test]
    fn unmap_clears_and_rejects_absent_mappings() {
        let phys = ram();
        let hardware = MockHardware::new();
        let mut space = boot(&phys, &hardware);

        let va = VirtualAddress::new(KERNEL_WINDOW_BASE + 20 * SUPERPAGE_SIZE);
        let good = PageFlags::new().with_usable(true).with_used(true);
        space.map(va, PhysicalAddress::new(0x0280_0000), good).expect("map");

        space.unmap(va).expect("unmap");
        assert_eq!(space.translate(va), None);
        assert_eq!(space.unmap(va), Err(VmemError::NotMapped));
        assert_eq!(
            space.unmap(VirtualAddress::new(0x4000_0000)),
            Err(VmemError::InvalidAddress)
        );
    }

    #[test]
    fn reserve_attach_detach_release_cycle() {
        let phys = ram();
        let hardware = MockHardware::new();
        let mut space = boot(&phys, &hardware);

        // Page 16 carries metadata, so the first free logical page is 17.
        let run = space.reserve_pages(0).expect("reserve");
        assert_eq!(run.base().as_u64(), KERNEL_WINDOW_BASE + 17 * SUPERPAGE_SIZE);

        let backing = PhysicalPage::<Size2M>::from_addr(PhysicalAddress::new(0x0380_0000));
        space.attach(run, backing).expect("attach");
        assert_eq!(space.translate(run.base()), Some(backing.base()));
        assert_eq!(space.attach(run, backing), Err(VmemError::AlreadyMapped));

        assert_eq!(space.detach(run), Ok(backing));
        assert_eq!(space.translate(run.base()), None);
        assert_eq!(space.detach(run), Err(VmemError::NotMapped));

        space.release_pages(run, 0).expect("release");
        assert_eq!(space.reserve_pages(0), Ok(run));
    }

    #[test]
    fn attach_rejects_unreserved_and_boot_owned_pages() {
        let phys = ram();
        let hardware = MockHardware::new();
        let mut space = boot(&phys, &hardware);

        let backing = PhysicalPage::<Size2M>::from_addr(PhysicalAddress::new(0x0380_0000));

        // Not reserved: usable but unused.
        let free = VirtualPage::<Size2M>::containing_address(VirtualAddress::new(
            KERNEL_WINDOW_BASE + 30 * SUPERPAGE_SIZE,
        ));
        assert_eq!(space.attach(free, backing), Err(VmemError::InvalidFlags));

        // The low reservation is boot-owned.
        let low = VirtualPage::<Size2M>::containing_address(VirtualAddress::new(
            KERNEL_WINDOW_BASE + 2 * SUPERPAGE_SIZE,
        ));
        assert_eq!(space.attach(low, backing), Err(VmemError::InvalidAddress));

        // So is the device window.
        let device = VirtualPage::<Size2M>::containing_address(VirtualAddress::new(
            KERNEL_WINDOW_BASE + 400 * SUPERPAGE_SIZE,
        ));
        assert_eq!(space.attach(device, backing), Err(VmemError::InvalidAddress));

        // Outside the window entirely.
        let outside = VirtualPage::<Size2M>::containing_address(VirtualAddress::new(0x4000_0000));
        assert_eq!(space.attach(outside, backing), Err(VmemError::InvalidAddress));
    }

    #[test]
    fn boot_owned_pages_survive_detach_and_release_attempts() {
        let phys = ram();
        let hardware = MockHardware::new();
        let mut space = boot(&phys, &hardware);

        // The metadata page and a device page look exactly like attached
        // pages: usable, used, backed. They still must not come apart.
        let metadata_page = VirtualPage::<Size2M>::containing_address(VirtualAddress::new(
            KERNEL_WINDOW_BASE + 16 * SUPERPAGE_SIZE,
        ));
        let device = VirtualPage::<Size2M>::containing_address(VirtualAddress::new(
            KERNEL_WINDOW_BASE + 400 * SUPERPAGE_SIZE,
        ));

        assert_eq!(space.detach(metadata_page), Err(VmemError::InvalidAddress));
        assert_eq!(space.detach(device), Err(VmemError::InvalidAddress));
        assert_eq!(
            space.release_pages(metadata_page, 0),
            Err(VmemError::InvalidAddress)
        );
        assert_eq!(space.release_pages(device, 0), Err(VmemError::InvalidAddress));

        // Both mappings are intact.
        assert_eq!(
            space.translate(metadata_page.base()),
            Some(PhysicalAddress::new(0x0200_0000))
        );
        assert_eq!(
            space.translate(device.base()),
            Some(PhysicalAddress::new(device.base().as_u64()))
        );

        // A run reaching past the general region is rejected whole.
        let straddle = VirtualPage::<Size2M>::containing_address(VirtualAddress::new(
            KERNEL_WINDOW_BASE + 256 * SUPERPAGE_SIZE,
        ));
        assert!(!space.is_general_run(straddle, 7));
        assert_eq!(
            space.release_pages(straddle, 7),
            Err(VmemError::InvalidAddress)
        );

        // The free lists never saw any of it: the first reservation is
        // still page 17.
        let run = space.reserve_pages(0).expect("reserve");
        assert_eq!(run.base().as_u64(), KERNEL_WINDOW_BASE + 17 * SUPERPAGE_SIZE);
        assert!(space.is_general_run(run, 0));
    }

    #[test]
    fn reserve_coalesces_after_release() {
        let phys = ram();
        let hardware = MockHardware::new();
        let mut space = boot(&phys, &hardware);

        // Take the order-2 block at 20, give it back, take it again.
        let run = space.reserve_pages(2).expect("reserve");
        assert_eq!(run.base().as_u64(), KERNEL_WINDOW_BASE + 20 * SUPERPAGE_SIZE);
        space.release_pages(run, 2).expect("release");
        assert_eq!(space.reserve_pages(2), Ok(run));
    }

    #[test]
    fn pool_hands_out_every_threaded_page_once() {
        let phys = ram();
        let hardware = MockHardware::new();
        let mut space = boot(&phys, &hardware);

        let array_bytes = KERNEL_WINDOW_PAGES * size_of::<PageDescriptor>();
        let expected =
            (BOOTSTRAP_SIZE as usize - 3 * 4096 - array_bytes.next_multiple_of(4096)) / 4096;

        let mut seen = std::collections::HashSet::new();
        let mut count = 0usize;
        loop {
            match space.pool_alloc() {
                Ok(page) => {
                    let pa = page.base().as_u64();
                    assert!(pa >= BOOTSTRAP_BASE && pa < BOOTSTRAP_BASE + BOOTSTRAP_SIZE);
                    assert!(seen.insert(pa), "page handed out twice");
                    count += 1;
                }
                Err(VmemError::OutOfMemory) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(count, expected);

        // Freeing revives the pool in LIFO order.
        let page = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x20_0000));
        space.pool_free(page);
        assert_eq!(space.pool_alloc(), Ok(page));
        assert_eq!(space.pool_alloc(), Err(VmemError::OutOfMemory));
    }

    #[test]
    fn window_alias_is_base_plus_physical() {
        let pa = PhysicalAddress::new(0x12_3000);
        assert_eq!(window_alias(pa).as_u64(), KERNEL_WINDOW_BASE + 0x12_3000);
    }
}

//! # Memory Management
//!
//! The front door of the memory subsystem. [`init_physical_memory`] runs the
//! boot pipeline once and returns a [`MemoryManager`]; everything the rest
//! of the kernel does with memory afterwards is a method on that manager.
//!
//! ```text
//! boot memory map ──► scan: size, place, flag the page descriptors
//!                            │
//!                            ▼
//!                     zone: classify (DMA / low / UMA / NUMA)
//!                            │
//!                            ▼
//!                     kernel space bootstrap: tables, window, reflection
//!                            │
//!                            ▼
//!                     buddy free lists ──► MemoryManager
//! ```
//!
//! The manager's operations come in three rings:
//!
//! - raw physical blocks: [`MemoryManager::alloc_pages`] /
//!   [`MemoryManager::free_pages`];
//! - the kernel window: [`MemoryManager::kernel_map`] /
//!   [`MemoryManager::kernel_unmap`] / [`MemoryManager::kernel_v2p`], plus
//!   the backed variants [`MemoryManager::kernel_alloc_pages`] /
//!   [`MemoryManager::kernel_free_pages`];
//! - process spaces: [`MemoryManager::process_space_create`],
//!   [`MemoryManager::process_map`], [`MemoryManager::process_v2p`] and
//!   [`MemoryManager::process_space_destroy`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use core::slice;

use kernel_bootinfo::memory_map::SystemMemoryMap;
use kernel_bootinfo::numa::ProximityMap;
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress, VirtualPage,
};
use kernel_pmem::{
    scan, zone, PageDescriptor, PageFlags, PhysicalMemory, PmemError, Zone, MAX_BUDDY_ORDER,
};
use kernel_vmem::{
    Granularity, KernelSpace, MapFlags, PagingHardware, PhysMapper, ProcessAddressSpace, VmemError,
};
use log::{debug, info};

/// Errors of the memory subsystem as the rest of the kernel sees them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No free block satisfies the request.
    #[error("out of memory")]
    OutOfMemory,
    /// An address or page run is out of range or misaligned.
    #[error("invalid address")]
    InvalidAddress,
    /// The named logical page is in no state for the operation.
    #[error("invalid page flags")]
    InvalidFlags,
    /// The requested granularity cannot be served at this address.
    #[error("unsupported mapping granularity")]
    UnsupportedGranularity,
    /// Bookkeeping structures do not fit their reserved region.
    #[error("bookkeeping layout overflow")]
    LayoutOverflow,
    /// The target already carries a mapping.
    #[error("already mapped")]
    AlreadyMapped,
    /// The target carries no mapping.
    #[error("not mapped")]
    NotMapped,
}

impl From<PmemError> for Error {
    fn from(error: PmemError) -> Self {
        match error {
            PmemError::OutOfMemory => Self::OutOfMemory,
            PmemError::LayoutOverflow => Self::LayoutOverflow,
        }
    }
}

impl From<VmemError> for Error {
    fn from(error: VmemError) -> Self {
        match error {
            VmemError::OutOfMemory => Self::OutOfMemory,
            VmemError::InvalidAddress => Self::InvalidAddress,
            VmemError::InvalidFlags => Self::InvalidFlags,
            VmemError::UnsupportedGranularity => Self::UnsupportedGranularity,
            VmemError::LayoutOverflow => Self::LayoutOverflow,
            VmemError::AlreadyMapped => Self::AlreadyMapped,
            VmemError::NotMapped => Self::NotMapped,
        }
    }
}

/// Owner of the initialized memory subsystem: the physical allocator plus
/// the kernel address space. Built once by [`init_physical_memory`].
pub struct MemoryManager<'c, M: PhysMapper, H: PagingHardware> {
    physical: PhysicalMemory<'c>,
    kernel: KernelSpace<'c, M, H>,
}

/// Bring up physical and kernel-virtual memory from the boot memory map.
///
/// The pipeline runs once, in order: size the descriptor array from the
/// map's span and place it in usable memory, apply the map and the
/// proximity table to the descriptors, switch to the kernel's own address
/// space (which reflects the descriptor region into the kernel window), and
/// build the buddy free lists over the finished descriptors.
///
/// On return the boot page tables are dead and the kernel runs on the root
/// reported by [`MemoryManager::kernel_root`].
///
/// # Errors
/// [`Error::LayoutOverflow`] when no usable region can host the descriptor
/// array, or the bootstrap structures outgrow their fixed region.
pub fn init_physical_memory<'c, M: PhysMapper, H: PagingHardware>(
    map: SystemMemoryMap<'_>,
    numa: Option<ProximityMap<'_>>,
    mapper: &'c M,
    hardware: &'c H,
) -> Result<MemoryManager<'c, M, H>, Error> {
    let npages = scan::page_count(map);
    let bytes = scan::metadata_bytes(npages);
    let metadata = scan::find_metadata_region(map, bytes)?;
    let metadata_pages = scan::metadata_pages(bytes);
    let count = usize::try_from(npages).map_err(|_| Error::LayoutOverflow)?;

    // Descriptor preparation happens before the address-space switch, while
    // the boot linear map still covers the region.
    {
        // SAFETY: the region was just chosen from usable memory above the
        // low reservation; nothing else references it yet.
        let pages = unsafe { descriptor_slice(mapper, metadata, count) };
        scan::reset(pages);
        scan::reserve_low_memory(pages);
        scan::reserve_metadata(pages, metadata, metadata_pages)?;
        scan::mark_usable(pages, map);
        zone::classify_pages(pages, numa);
    }

    let kernel = KernelSpace::bootstrap(mapper, hardware, metadata, metadata_pages)?;

    // SAFETY: the preparation slice is gone; this one stays unique for the
    // manager's lifetime.
    let pages = unsafe { descriptor_slice(mapper, metadata, count) };
    let physical = PhysicalMemory::new(pages);
    info!("memory management online");
    Ok(MemoryManager { physical, kernel })
}

/// Materialize the descriptor array hosted at `metadata`.
///
/// # Safety
/// At most one returned slice may be live at a time, and nothing else may
/// reference the region while it is.
unsafe fn descriptor_slice<'c, M: PhysMapper>(
    mapper: &M,
    metadata: PhysicalPage<Size2M>,
    count: usize,
) -> &'c mut [PageDescriptor] {
    // SAFETY: per the function contract; descriptors are plain data and the
    // region holds at least `count` of them by construction.
    unsafe {
        let first: &'c mut PageDescriptor = mapper.phys_to_mut(metadata.base());
        slice::from_raw_parts_mut(core::ptr::from_mut(first), count)
    }
}

impl<'c, M: PhysMapper, H: PagingHardware> MemoryManager<'c, M, H> {
    /// Allocate `2^order` contiguous physical superpages from `zone`.
    ///
    /// # Errors
    /// [`Error::OutOfMemory`] when the zone holds no block of sufficient
    /// order.
    pub fn alloc_pages(&mut self, zone: Zone, order: u8) -> Result<PhysicalPage<Size2M>, Error> {
        Ok(self.physical.alloc(zone, order)?)
    }

    /// Free a block previously returned by [`Self::alloc_pages`].
    ///
    /// # Errors
    /// [`Error::InvalidAddress`] when the order is out of range, the block
    /// is misaligned for it, or the block exceeds the managed span.
    pub fn free_pages(&mut self, page: PhysicalPage<Size2M>, order: u8) -> Result<(), Error> {
        let number = page.page_number();
        if order > MAX_BUDDY_ORDER
            || !number.is_multiple_of(1 << order)
            || number + (1 << order) > self.physical.page_count() as u64
        {
            return Err(Error::InvalidAddress);
        }
        self.physical.free(page, order);
        Ok(())
    }

    /// Install a kernel-window superpage mapping of `va` onto `pa`.
    ///
    /// `flags` are the window page's logical flags; the page must be
    /// reserved (usable and used). An existing superpage mapping at `va` is
    /// replaced.
    ///
    /// # Errors
    /// - [`Error::InvalidFlags`] unless `flags` say usable and used.
    /// - [`Error::InvalidAddress`] when `va` is outside the kernel window
    ///   or either address is not superpage-aligned.
    /// - [`Error::UnsupportedGranularity`] when the slot holds a
    ///   fourth-level table.
    pub fn kernel_map(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), Error> {
        Ok(self.kernel.map(va, pa, flags)?)
    }

    /// Remove the kernel-window superpage mapping at `va`.
    ///
    /// # Errors
    /// - [`Error::InvalidAddress`] when `va` is outside the kernel window
    ///   or not superpage-aligned.
    /// - [`Error::NotMapped`] when no superpage mapping covers `va`.
    pub fn kernel_unmap(&mut self, va: VirtualAddress) -> Result<(), Error> {
        Ok(self.kernel.unmap(va)?)
    }

    /// Resolve a kernel-window virtual address to its physical address.
    #[must_use]
    pub fn kernel_v2p(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.kernel.translate(va)
    }

    /// The kernel's top-level table page, for reloading the root register
    /// after running on a process space.
    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalPage<Size4K> {
        self.kernel.root()
    }

    /// Allocate `2^order` contiguous kernel superpages: reserve a window
    /// run, back every page with one physical superpage, and map it.
    ///
    /// Backing comes from UMA first, then the low and DMA zones. On any
    /// mid-run failure the pages backed so far are freed and the run is
    /// released.
    ///
    /// # Errors
    /// [`Error::OutOfMemory`] when the window or every zone is exhausted.
    pub fn kernel_alloc_pages(&mut self, order: u8) -> Result<VirtualPage<Size2M>, Error> {
        let run = self.kernel.reserve_pages(order)?;
        for index in 0..1u64 << order {
            let page = VirtualPage::<Size2M>::from_page_number(run.page_number() + index);
            let backing = match self.backing_alloc() {
                Ok(backing) => backing,
                Err(error) => {
                    self.unwind_kernel_run(run, order, index);
                    return Err(error.into());
                }
            };
            if let Err(error) = self.kernel.attach(page, backing) {
                self.physical.free(backing, 0);
                self.unwind_kernel_run(run, order, index);
                return Err(error.into());
            }
        }
        Ok(run)
    }

    /// Free a backed kernel run allocated by [`Self::kernel_alloc_pages`]:
    /// every page's backing superpage returns to its zone and the window
    /// run becomes reservable again.
    ///
    /// The run is validated whole before anything detaches, so a run the
    /// allocator never handed out — boot-owned window pages, or a
    /// misstated order — fails with every mapping still in place. A
    /// failure past that point leaves the earlier pages already detached.
    ///
    /// # Errors
    /// - [`Error::InvalidAddress`] when `run` does not name a
    ///   general-region window run of this order.
    /// - [`Error::NotMapped`] when a page of the run carries no backing.
    pub fn kernel_free_pages(&mut self, run: VirtualPage<Size2M>, order: u8) -> Result<(), Error> {
        if !self.kernel.is_general_run(run, order) {
            return Err(Error::InvalidAddress);
        }
        for index in 0..1u64 << order {
            let page = VirtualPage::<Size2M>::from_page_number(run.page_number() + index);
            let backing = self.kernel.detach(page)?;
            self.physical.free(backing, 0);
        }
        Ok(self.kernel.release_pages(run, order)?)
    }

    /// Create a process address space aliasing the kernel window.
    ///
    /// # Errors
    /// [`Error::OutOfMemory`] when the table-page pool cannot cover the
    /// fixed table cost; nothing is consumed in that case.
    pub fn process_space_create(&mut self) -> Result<ProcessAddressSpace, Error> {
        Ok(ProcessAddressSpace::create(&mut self.kernel)?)
    }

    /// Map `va` onto `pa` in `space` at the requested granularity.
    ///
    /// # Errors
    /// - [`Error::InvalidAddress`] when `va` is outside the space's slots,
    ///   inside the kernel alias, or misaligned for the granularity.
    /// - [`Error::OutOfMemory`] when a 4 KiB mapping needs a fresh table
    ///   and the pool is empty.
    pub fn process_map(
        &mut self,
        space: &mut ProcessAddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
        granularity: Granularity,
    ) -> Result<(), Error> {
        Ok(space.map(&mut self.kernel, va, pa, granularity, flags)?)
    }

    /// Resolve `va` through `space`, including the kernel alias.
    #[must_use]
    pub fn process_v2p(
        &self,
        space: &ProcessAddressSpace,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        space.translate(&self.kernel, va)
    }

    /// Tear down `space`, returning all of its table pages to the pool.
    ///
    /// The space's root must not be loaded anymore.
    pub fn process_space_destroy(&mut self, space: ProcessAddressSpace) {
        space.destroy(&mut self.kernel);
    }

    /// One physical superpage of kernel backing, from the most plentiful
    /// zone that still has one.
    fn backing_alloc(&mut self) -> Result<PhysicalPage<Size2M>, PmemError> {
        for zone in [Zone::Uma, Zone::LowMem, Zone::Dma] {
            match self.physical.alloc(zone, 0) {
                Ok(page) => return Ok(page),
                Err(PmemError::OutOfMemory) => {}
                Err(error) => return Err(error),
            }
        }
        Err(PmemError::OutOfMemory)
    }

    /// Roll back a partially backed run: detach and free the first
    /// `attached` pages, then release the whole run.
    fn unwind_kernel_run(&mut self, run: VirtualPage<Size2M>, order: u8, attached: u64) {
        for index in 0..attached {
            let page = VirtualPage::<Size2M>::from_page_number(run.page_number() + index);
            if let Ok(backing) = self.kernel.detach(page) {
                self.physical.free(backing, 0);
            }
        }
        if let Err(error) = self.kernel.release_pages(run, order) {
            let base = run.base().as_u64();
            debug!("window run at {base:#x} leaked: {error}");
        }
    }
}

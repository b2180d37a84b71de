//! # Kernel Memory Layout
//!
//! Fixed constants shared by the physical and virtual memory crates. Byte
//! addresses and byte counts are plain `u64`, page counts are `usize`;
//! page-typed wrappers live with the code that uses them.

/// Size of one kernel superpage in bytes (2 MiB).
///
/// Every mapping the kernel makes for itself uses this granularity; 4 KiB
/// pages only ever appear in process address spaces.
pub const SUPERPAGE_SIZE: u64 = 0x20_0000;

/// log2 of [`SUPERPAGE_SIZE`].
pub const SUPERPAGE_SHIFT: u32 = 21;

/// Physical bound of the low memory region (32 MiB).
///
/// Everything below this address is owned by early boot: legacy firmware
/// areas, the kernel image, and the bootstrap region. The physical page
/// allocator never hands out frames from this range, and the bootstrap
/// page tables identity-map exactly this much into the kernel window.
pub const LOW_MEMORY_BOUND: u64 = 0x0200_0000;

/// Upper bound of the boot-time linear map (3 GiB).
///
/// The boot stage runs with virtual equal to physical for all addresses
/// below this bound. Physical structures the kernel must touch before its
/// own window is active (page descriptors, bootstrap tables) have to be
/// placed below it.
pub const BOOT_LINEAR_BOUND: u64 = 0xC000_0000;

/// Physical base of the bootstrap region (1 MiB).
///
/// A fixed range claimed before any allocator exists. The initial kernel
/// page tables are carved from its start and the remainder feeds the
/// page-table pool.
pub const BOOTSTRAP_BASE: u64 = 0x10_0000;

/// Size of the bootstrap region in bytes (4 MiB).
pub const BOOTSTRAP_SIZE: u64 = 0x40_0000;

/// Virtual base of the kernel window (3 GiB).
///
/// Numerically equal to [`BOOT_LINEAR_BOUND`] so that low physical memory
/// appears at the same addresses under both the boot linear map and the
/// kernel's own tables.
pub const KERNEL_WINDOW_BASE: u64 = 0xC000_0000;

/// Index of the kernel window within a level-3 table.
///
/// The window is the fourth 1 GiB slot of the low canonical range; process
/// address spaces alias this slot instead of owning it.
pub const KERNEL_WINDOW_SLOT: u16 = 3;

/// Number of superpages in the kernel window (1 GiB total).
pub const KERNEL_WINDOW_PAGES: usize = 512;

/// Number of window superpages available for general kernel use.
///
/// Pages `[0, KERNEL_REGION_PAGES)` of the window hold the low memory
/// mirror, the descriptor metadata, and on-demand kernel allocations.
pub const KERNEL_REGION_PAGES: usize = 320;

/// Number of window superpages reserved for device mappings.
///
/// Pages `[KERNEL_REGION_PAGES, KERNEL_WINDOW_PAGES)` are identity-backed
/// at their own physical addresses for MMIO use.
pub const DEVICE_REGION_PAGES: usize = 192;

const _: () = {
    assert!(BOOTSTRAP_BASE.is_multiple_of(4096));
    assert!(BOOTSTRAP_BASE + BOOTSTRAP_SIZE <= LOW_MEMORY_BOUND);
    assert!(LOW_MEMORY_BOUND.is_multiple_of(SUPERPAGE_SIZE));
    assert!(KERNEL_WINDOW_BASE == (KERNEL_WINDOW_SLOT as u64) * 0x4000_0000);
    assert!(KERNEL_REGION_PAGES + DEVICE_REGION_PAGES == KERNEL_WINDOW_PAGES);
    assert!(SUPERPAGE_SIZE == 1 << SUPERPAGE_SHIFT);
};

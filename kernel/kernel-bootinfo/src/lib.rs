//! # Boot-Time Memory Information
//!
//! This crate defines the data the memory subsystem receives from the boot
//! environment, plus the fixed layout constants every other memory crate
//! builds on. It is the authoritative source for the shape of the firmware
//! memory map, the proximity (NUMA) hints, and the kernel's superpage window.
//!
//! ## Overview
//!
//! Physical memory management starts from two inputs handed over by the boot
//! stage: a memory map describing which physical ranges exist and what they
//! are good for, and an optional proximity table associating ranges with
//! NUMA domains. Both are plain, `#[repr(C)]`-compatible data so they can be
//! produced by loader code without pulling in any kernel machinery.
//!
//! The crate is organized into three modules:
//!
//! ### Memory Map ([`memory_map`])
//! The firmware view of physical memory:
//! * **Region kinds**: usable RAM, firmware reservations, ACPI ranges, bad RAM
//! * **Entries**: `(base, length, kind)` triples in no particular order
//! * **Map view**: borrowed slice with span and usable-range helpers
//!
//! ### Proximity Domains ([`numa`])
//! Optional locality hints:
//! * **Regions**: `(domain, base, length)` triples, SRAT-like
//! * **Map view**: linear first-match address resolution
//!
//! ### Memory Layout ([`layout`])
//! The fixed constants of the kernel's memory design:
//! * **Superpage geometry**: all kernel mappings use 2 MiB pages
//! * **Kernel window**: one 1 GiB slot of kernel virtual address space
//! * **Bootstrap region**: low physical range claimed for early page tables
//!
//! ## Kernel Window
//!
//! The kernel owns exactly one 1 GiB aligned window of virtual address
//! space, carved into 512 superpages with fixed sub-regions:
//!
//! ```text
//! Kernel Window (1 GiB, 512 × 2 MiB pages):
//!
//! 0xC000_0000 ┌─────────────────────────────────┐ page 0
//!             │   Low Memory Mirror             │
//!             │   (BIOS, boot data, bootstrap)  │
//! 0xC200_0000 ├─────────────────────────────────┤ page 16
//!             │   Page Descriptor Metadata      │
//!             ├─────────────────────────────────┤ page 16 + n
//!             │   General Kernel Pages          │
//!             │   (backed on demand)            │
//! 0xE800_0000 ├─────────────────────────────────┤ page 320
//!             │   Device Window                 │
//!             │   (identity-backed MMIO)        │
//! 0xFFFF_FFFF └─────────────────────────────────┘ page 512
//! ```
//!
//! The window base sits at 3 GiB so that early boot code, which runs under a
//! linear map where virtual equals physical below [`layout::BOOT_LINEAR_BOUND`],
//! keeps working while the kernel's own tables are being built.
//!
//! ## Physical Memory Layout
//!
//! ```text
//! Physical Memory:
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │   Legacy Low Memory             │
//!             │   (BIOS, VGA, DMA buffers)      │
//! 0x0010_0000 ├─────────────────────────────────┤ BOOTSTRAP_BASE
//!             │   Bootstrap Region (4 MiB)      │
//!             │   (initial tables, table pool)  │
//! 0x0050_0000 ├─────────────────────────────────┤
//!             │   Kernel Image & Boot Data      │
//! 0x0200_0000 ├─────────────────────────────────┤ LOW_MEMORY_BOUND
//!             │   General RAM                   │
//!             │   (buddy-managed)               │
//!             └─────────────────────────────────┘
//! ```
//!
//! ## ABI Compatibility
//!
//! * **`#[repr(C)]`** data with fixed-size integers throughout
//! * **`#[repr(u32)]`** kind tags with pinned discriminants
//! * **No unsafe code**: marked `#![deny(unsafe_code)]`
//!
//! All layout constants are `const` and validated by compile-time assertions,
//! so a misconfigured window or bootstrap region fails the build instead of
//! the boot.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod layout;
pub mod memory_map;
pub mod numa;

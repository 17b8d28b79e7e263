//! # Fast-Path DMA Mapping
//!
//! A latency-optimized translator from CPU physical memory into a bounded
//! device address space of an I/O translation unit, for drivers that map and
//! unmap single buffers at high frequency.
//!
//! ## What you get
//! - A bitmap [`IovaAllocator`] with a wrapping scan cursor and deferred,
//!   batched TLB invalidation.
//! - A [`FastMapping`] engine: [`map_page`](FastMapping::map_page),
//!   [`unmap_page`](FastMapping::unmap_page), directional syncs,
//!   [`map_resource`](FastMapping::map_resource) and
//!   [`bulk_alloc`](FastMapping::bulk_alloc).
//! - Lifecycle through [`IovaSpace`] and [`DeviceBinding`].
//! - A [`DiagnosticsHook`] that is told when a mapping lands on a leaf that
//!   was never invalidated.
//! - A software [`FlatPageTable`] implementing the [`TranslationTable`] port.
//!
//! ## Deferred invalidation
//!
//! Two bitmaps of equal length cover the window, one bit per fast page:
//!
//! ```text
//! allocated:  bit set ⇔ page is mapped right now
//! tlb_dirty:  bit set ⇔ page is mapped, or was unmapped and may still sit
//!             in a device TLB
//!
//! allocated ⊆ tlb_dirty
//! ```
//!
//! Freeing clears only `allocated` and marks the space stale. The scan looks
//! at `tlb_dirty`, so freed pages are not reused until the allocator runs out
//! of room; only then does it issue one address-space-wide invalidation,
//! copy `allocated` over `tlb_dirty` and retry once.
//!
//! ```text
//!  scan [cursor..end) ─► scan [0..end) ─► stale? ─► invalidate_all
//!          │                  │                          │
//!          └── found ◄────────┘        copy + clear_stale_entries
//!                                                        │
//!                                       scan [0..end) once more ─► found / OutOfSpace
//! ```
//!
//! ## Locking
//!
//! Each address space owns one [`SpinLock`](kernel_sync::SpinLock), taken
//! with interrupts masked. Bitmap updates and translation-table map/unmap
//! calls happen under it; CPU cache maintenance never does.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod addresses;
mod attrs;
mod bitmap;
mod bulk;
mod diagnostics;
mod error;
mod flat_table;
mod iova;
mod lifecycle;
mod mapping;
mod ports;

pub use addresses::{DmaAddress, PhysicalAddress, align_down, checked_align_up};
pub use attrs::{CpuMapping, DmaAttrs, DmaDirection, IommuProt};
pub use bitmap::Bitmap;
pub use bulk::BulkAllocation;
pub use diagnostics::{DiagnosticsHook, LogDiagnostics, StaleTlbReport};
pub use error::DmaError;
pub use flat_table::{FastPte, FlatPageTable};
pub use iova::{AllocatorStats, IovaAllocator, Region};
pub use lifecycle::{DeviceBinding, ErratumConfig, IovaSpace, ResourceKind, ResourceWindow};
pub use mapping::{FastMapping, Segment};
pub use ports::{CacheMaintenance, FrameProvider, LeafWrite, TableError, TranslationTable};

/// log2 of the fast-path page granularity.
pub const FAST_PAGE_SHIFT: u32 = 12;

/// Fast-path page granularity: one bitmap bit per page of this size.
pub const FAST_PAGE_SIZE: u64 = 1 << FAST_PAGE_SHIFT;

/// Exclusive upper bound of any fast-path window (`base + size`).
pub const MAX_IOVA_END: u64 = 1 << 32;

/// Minimum IOVA alignment on parts affected by the prefetch erratum.
pub const ERRATUM_MIN_IOVA_ALIGN: u64 = 64 * 1024;

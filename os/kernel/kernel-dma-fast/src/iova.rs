//! # IOVA region allocator
//!
//! Hands out naturally aligned runs of fast pages from a fixed window and
//! defers device TLB invalidation until address space runs out.
//!
//! ```text
//! allocate:  scan tlb_dirty from cursor ─► wrap to 0 ─► sweep if stale ─► scan once more
//!            set bits in allocated and tlb_dirty, advance cursor, map guard
//! free:      unmap guard, clear bits in allocated only, mark stale
//! sweep:     invalidate_all, tlb_dirty := allocated, clear stale leaves
//! ```
//!
//! The allocator owns no lock. It lives inside the address space's
//! [`SpinLock`](kernel_sync::SpinLock) and every method runs with it held.

use crate::addresses::{DmaAddress, PhysicalAddress, align_down, checked_align_up};
use crate::attrs::IommuProt;
use crate::bitmap::Bitmap;
use crate::diagnostics::{DiagnosticsHook, StaleTlbReport};
use crate::error::DmaError;
use crate::lifecycle::ErratumConfig;
use crate::ports::{LeafWrite, TableError, TranslationTable};
use crate::{FAST_PAGE_SHIFT, FAST_PAGE_SIZE, MAX_IOVA_END};
use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;

/// A run of pages handed out by [`IovaAllocator::allocate`].
///
/// `pages` includes the trailing `guard_pages`; the caller owns only the
/// first `pages - guard_pages` of them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub iova: DmaAddress,
    pub first_page: usize,
    pub pages: usize,
    pub guard_pages: usize,
}

impl Region {
    /// Bytes usable by the caller.
    #[inline]
    #[must_use]
    pub const fn usable_len(&self) -> u64 {
        ((self.pages - self.guard_pages) as u64) << FAST_PAGE_SHIFT
    }
}

/// Allocator event counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub frees: u64,
    /// Address-space-wide invalidation sweeps.
    pub sweeps: u64,
    /// Allocations that failed for lack of space.
    pub failures: u64,
}

/// Sizes derived from a request.
#[derive(Copy, Clone, Debug)]
struct Layout {
    usable: u64,
    guard_len: u64,
    pages: usize,
    guard_pages: usize,
    align_mask: usize,
}

pub struct IovaAllocator {
    base: DmaAddress,
    size: u64,
    pages: usize,
    /// Pages mapped right now.
    allocated: Bitmap,
    /// Pages mapped, or unmapped but possibly still cached by a device TLB.
    tlb_dirty: Bitmap,
    cursor: usize,
    stale: bool,
    erratum: Option<ErratumConfig>,
    stats: AllocatorStats,
    diagnostics: Option<Arc<dyn DiagnosticsHook>>,
}

impl IovaAllocator {
    /// Allocator for `[base, base + size)` with both bitmaps zeroed.
    ///
    /// # Errors
    /// - [`DmaError::InvalidWindow`] if the window is empty or not page aligned.
    /// - [`DmaError::WindowTooLarge`] if it ends above [`MAX_IOVA_END`].
    /// - [`DmaError::OutOfMemory`] if the bitmaps cannot be allocated.
    pub fn new(base: DmaAddress, size: u64) -> Result<Self, DmaError> {
        if size == 0 || size % FAST_PAGE_SIZE != 0 || base.page_offset() != 0 {
            return Err(DmaError::InvalidWindow);
        }
        match base.as_u64().checked_add(size) {
            Some(end) if end <= MAX_IOVA_END => {}
            _ => return Err(DmaError::WindowTooLarge { base, size }),
        }

        let pages = usize::try_from(size >> FAST_PAGE_SHIFT)
            .map_err(|_| DmaError::WindowTooLarge { base, size })?;
        let allocated = Bitmap::try_new(pages).ok_or(DmaError::OutOfMemory)?;
        let tlb_dirty = Bitmap::try_new(pages).ok_or(DmaError::OutOfMemory)?;

        Ok(Self {
            base,
            size,
            pages,
            allocated,
            tlb_dirty,
            cursor: 0,
            stale: false,
            erratum: None,
            stats: AllocatorStats::default(),
            diagnostics: None,
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> DmaAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Number of fast pages in the window.
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    #[must_use]
    pub const fn allocated(&self) -> &Bitmap {
        &self.allocated
    }

    #[inline]
    #[must_use]
    pub const fn tlb_dirty(&self) -> &Bitmap {
        &self.tlb_dirty
    }

    /// Page index the next scan starts at.
    #[inline]
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether freed pages await a TLB invalidation.
    #[inline]
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> AllocatorStats {
        self.stats
    }

    #[inline]
    #[must_use]
    pub const fn erratum(&self) -> Option<ErratumConfig> {
        self.erratum
    }

    /// `allocated ⊆ tlb_dirty`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.allocated.is_subset_of(&self.tlb_dirty)
    }

    /// Window covered by this allocator.
    #[must_use]
    pub fn window(&self) -> Range<DmaAddress> {
        self.base..self.base + self.size
    }

    pub(crate) const fn set_erratum(&mut self, erratum: Option<ErratumConfig>) {
        self.erratum = erratum;
    }

    pub(crate) fn set_diagnostics(
        &mut self,
        hook: Option<Arc<dyn DiagnosticsHook>>,
    ) -> Option<Arc<dyn DiagnosticsHook>> {
        core::mem::replace(&mut self.diagnostics, hook)
    }

    /// Mark `[start, end)` as permanently occupied in both bitmaps.
    ///
    /// `start` is rounded down and `end` up to the page size, then both are
    /// clamped to the window. Returns the range actually reserved, or `None`
    /// if nothing of it falls inside the window.
    pub fn reserve(&mut self, start: DmaAddress, end: DmaAddress) -> Option<Range<DmaAddress>> {
        let window = self.window();
        let start = align_down(start.as_u64(), FAST_PAGE_SIZE).max(window.start.as_u64());
        let end = checked_align_up(end.as_u64(), FAST_PAGE_SIZE)
            .unwrap_or(u64::MAX)
            .min(window.end.as_u64());
        if start >= end {
            return None;
        }

        let first = self.page_index(DmaAddress::new(start))?;
        let count = usize::try_from((end - start) >> FAST_PAGE_SHIFT).ok()?;
        self.allocated.set_range(first, count);
        self.tlb_dirty.set_range(first, count);
        Some(DmaAddress::new(start)..DmaAddress::new(end))
    }

    /// Reserve a run covering `size` bytes, plus the erratum guard if one is
    /// configured.
    ///
    /// `skip_sync` is forwarded to [`TranslationTable::clear_stale_entries`]
    /// if a sweep is needed.
    ///
    /// # Errors
    /// - [`DmaError::InvalidSize`] for a zero or overflowing size.
    /// - [`DmaError::OutOfSpace`] if no run is free after one sweep, or the
    ///   guard mapping could not be installed.
    pub fn allocate<T: TranslationTable>(
        &mut self,
        table: &T,
        size: u64,
        skip_sync: bool,
    ) -> Result<Region, DmaError> {
        let layout = self.layout(size)?;
        let Some(first) = self.find(table, &layout, skip_sync) else {
            self.stats.failures += 1;
            return Err(DmaError::OutOfSpace);
        };

        self.allocated.set_range(first, layout.pages);
        self.tlb_dirty.set_range(first, layout.pages);
        self.cursor = first + layout.pages;
        if self.cursor >= self.pages {
            self.cursor = 0;
        }

        let iova = self.page_address(first);
        if let Some(erratum) = self.erratum.filter(|_| layout.guard_len > 0) {
            let guard = self.install(
                table,
                iova + layout.usable,
                erratum.guard_page,
                layout.guard_len,
                IommuProt::GUARD,
            );
            if let Err(e) = guard {
                log::error!("guard mapping at {} failed: {e}", iova + layout.usable);
                // The pages stay blocked in tlb_dirty until the next sweep
                // clears whatever part of the guard was written.
                self.allocated.clear_range(first, layout.pages);
                self.stale = true;
                self.stats.failures += 1;
                return Err(DmaError::OutOfSpace);
            }
        }

        self.stats.allocations += 1;
        Ok(Region {
            iova,
            first_page: first,
            pages: layout.pages,
            guard_pages: layout.guard_pages,
        })
    }

    /// Release the run at `iova` that was allocated for `size` bytes.
    ///
    /// The pages become free in `allocated` but stay blocked in `tlb_dirty`
    /// until the next sweep. The caller must present the size it allocated
    /// with; no record of past allocations is kept.
    ///
    /// # Errors
    /// - [`DmaError::InvalidSize`] for a zero or overflowing size.
    /// - [`DmaError::OutOfRange`] if the run does not lie inside the window.
    pub fn free<T: TranslationTable>(
        &mut self,
        table: &T,
        iova: DmaAddress,
        size: u64,
    ) -> Result<Region, DmaError> {
        let layout = self.layout(size)?;
        let first = self.page_index(iova).ok_or(DmaError::OutOfRange(iova))?;
        if first + layout.pages > self.pages {
            return Err(DmaError::OutOfRange(iova));
        }

        let iova = iova.page_base();
        if layout.guard_len > 0 {
            table.unmap(iova + layout.usable, layout.guard_len);
        }

        self.allocated.clear_range(first, layout.pages);
        self.stale = true;
        self.stats.frees += 1;
        Ok(Region {
            iova,
            first_page: first,
            pages: layout.pages,
            guard_pages: layout.guard_pages,
        })
    }

    /// Install a mapping, forwarding a write over a stale leaf to the
    /// diagnostics hook.
    pub(crate) fn install<T: TranslationTable>(
        &self,
        table: &T,
        iova: DmaAddress,
        phys: PhysicalAddress,
        len: u64,
        prot: IommuProt,
    ) -> Result<(), TableError> {
        if let LeafWrite::OverStale { iova: at } = table.map(iova, phys, len, prot)? {
            self.report_stale(at);
        }
        Ok(())
    }

    fn report_stale(&self, iova: DmaAddress) {
        let Some(hook) = &self.diagnostics else {
            return;
        };
        let Some(index) = self.page_index(iova) else {
            log::warn!("stale leaf reported at {iova}, outside {}+{:#x}", self.base, self.size);
            return;
        };
        let report = StaleTlbReport {
            iova,
            index,
            allocated: &self.allocated,
            tlb_dirty: &self.tlb_dirty,
        };
        hook.mapped_over_stale(&report);
    }

    fn layout(&self, size: u64) -> Result<Layout, DmaError> {
        let usable = checked_align_up(size, FAST_PAGE_SIZE)
            .filter(|&u| u != 0)
            .ok_or(DmaError::InvalidSize(size))?;
        let guard_len = match self.erratum {
            Some(e) => {
                checked_align_up(usable, e.min_iova_align).ok_or(DmaError::InvalidSize(size))?
                    - usable
            }
            None => 0,
        };
        let total = usable.checked_add(guard_len).ok_or(DmaError::InvalidSize(size))?;
        let pages = usize::try_from(total >> FAST_PAGE_SHIFT).map_err(|_| DmaError::OutOfSpace)?;
        if pages > self.pages {
            return Err(DmaError::OutOfSpace);
        }
        let usable_pages =
            usize::try_from(usable >> FAST_PAGE_SHIFT).map_err(|_| DmaError::OutOfSpace)?;

        Ok(Layout {
            usable,
            guard_len,
            pages,
            guard_pages: pages - usable_pages,
            align_mask: pages.next_power_of_two() - 1,
        })
    }

    fn find<T: TranslationTable>(&mut self, table: &T, layout: &Layout, skip_sync: bool) -> Option<usize> {
        let found = self
            .tlb_dirty
            .find_zero_area(self.cursor, layout.pages, layout.align_mask)
            .or_else(|| self.tlb_dirty.find_zero_area(0, layout.pages, layout.align_mask));
        if found.is_some() || !self.stale {
            return found;
        }

        self.sweep(table, skip_sync);
        self.tlb_dirty.find_zero_area(0, layout.pages, layout.align_mask)
    }

    /// Invalidate the whole address space and make `tlb_dirty` exact again.
    fn sweep<T: TranslationTable>(&mut self, table: &T, skip_sync: bool) {
        let freed = self.tlb_dirty.count_ones() - self.allocated.count_ones();
        log::debug!(
            "iova space {}+{:#x}: invalidating, reclaiming {freed} pages",
            self.base,
            self.size
        );

        table.invalidate_all();
        self.tlb_dirty.copy_from(&self.allocated);
        self.stale = false;
        table.clear_stale_entries(self.window(), skip_sync);
        self.stats.sweeps += 1;
    }

    fn page_index(&self, iova: DmaAddress) -> Option<usize> {
        let off = iova.checked_offset_from(self.base)?;
        let idx = usize::try_from(off >> FAST_PAGE_SHIFT).ok()?;
        (idx < self.pages).then_some(idx)
    }

    fn page_address(&self, index: usize) -> DmaAddress {
        self.base + ((index as u64) << FAST_PAGE_SHIFT)
    }
}

impl fmt::Debug for IovaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IovaAllocator")
            .field("base", &self.base)
            .field("size", &format_args!("{:#x}", self.size))
            .field("allocated", &self.allocated)
            .field("tlb_dirty", &self.tlb_dirty)
            .field("cursor", &self.cursor)
            .field("stale", &self.stale)
            .field("erratum", &self.erratum)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

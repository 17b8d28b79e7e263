//! # Fast-path mapping engine
//!
//! Composes the [`IovaAllocator`] with the collaborator ports into the
//! driver-facing DMA operations.
//!
//! Cache maintenance always runs outside the address-space lock. On unmap
//! the physical address needed for the invalidate is captured before the
//! translation is removed.

use crate::addresses::{DmaAddress, PhysicalAddress, checked_align_up};
use crate::attrs::{DmaAttrs, DmaDirection, IommuProt};
use crate::diagnostics::DiagnosticsHook;
use crate::error::DmaError;
use crate::iova::IovaAllocator;
use crate::ports::{CacheMaintenance, FrameProvider, TranslationTable};
use crate::FAST_PAGE_SIZE;
use alloc::sync::Arc;
use kernel_sync::SpinLock;

/// A physically contiguous piece of a buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub phys: PhysicalAddress,
    pub len: u64,
}

impl Segment {
    #[inline]
    #[must_use]
    pub const fn new(phys: PhysicalAddress, len: u64) -> Self {
        Self { phys, len }
    }
}

/// A device address space bound to a device, ready for DMA mapping.
///
/// Created by [`IovaSpace::attach`](crate::IovaSpace::attach).
pub struct FastMapping<T, C, F> {
    pub(crate) allocator: SpinLock<IovaAllocator>,
    pub(crate) table: T,
    pub(crate) cache: C,
    pub(crate) frames: F,
    pub(crate) coherent: bool,
    base: DmaAddress,
    size: u64,
}

/// Page-aligned span covering `size` bytes starting `in_page` into a page.
fn span_len(in_page: u64, size: u64) -> Result<u64, DmaError> {
    if size == 0 {
        return Err(DmaError::InvalidSize(size));
    }
    in_page
        .checked_add(size)
        .and_then(|l| checked_align_up(l, FAST_PAGE_SIZE))
        .ok_or(DmaError::InvalidSize(size))
}

impl<T, C, F> FastMapping<T, C, F>
where
    T: TranslationTable,
    C: CacheMaintenance,
    F: FrameProvider,
{
    pub(crate) fn new(
        allocator: SpinLock<IovaAllocator>,
        table: T,
        cache: C,
        frames: F,
        coherent: bool,
    ) -> Self {
        let (base, size) = allocator.with_lock(|a| (a.base(), a.size()));
        Self {
            allocator,
            table,
            cache,
            frames,
            coherent,
            base,
            size,
        }
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

    /// Default coherency of the bound device.
    #[inline]
    #[must_use]
    pub const fn is_coherent(&self) -> bool {
        self.coherent
    }

    #[inline]
    pub const fn table(&self) -> &T {
        &self.table
    }

    #[inline]
    pub const fn cache(&self) -> &C {
        &self.cache
    }

    #[inline]
    pub const fn frames(&self) -> &F {
        &self.frames
    }

    /// Run `f` over the locked allocator.
    pub fn inspect<R>(&self, f: impl FnOnce(&IovaAllocator) -> R) -> R {
        let a = self.allocator.lock_irqsave();
        f(&a)
    }

    /// Replace the diagnostics hook, returning the previous one.
    pub fn register_diagnostics(
        &self,
        hook: Arc<dyn DiagnosticsHook>,
    ) -> Option<Arc<dyn DiagnosticsHook>> {
        self.allocator.lock_irqsave().set_diagnostics(Some(hook))
    }

    /// Tear the mapping down and hand the translation table back.
    ///
    /// Taking `self` by value rules out concurrent operations.
    pub fn destroy(self) -> T {
        let a = self.allocator.into_inner();
        let live = a.allocated().count_ones();
        if live > 0 {
            log::warn!("destroying iova space {} with {live} pages still allocated", a.base());
        }
        log::debug!("iova space {}+{:#x} destroyed", a.base(), a.size());
        self.table
    }

    /// `[iova, iova + len)` lies inside the window.
    fn check_window(&self, iova: DmaAddress, len: u64) -> Result<(), DmaError> {
        let end = self.base.as_u64() + self.size;
        let ok = iova >= self.base && iova.as_u64().checked_add(len).is_some_and(|e| e <= end);
        if ok { Ok(()) } else { Err(DmaError::OutOfRange(iova)) }
    }

    /// Install `len` bytes at a fresh region, rolling the region back if the
    /// table refuses.
    fn map_locked(
        &self,
        a: &mut IovaAllocator,
        phys: PhysicalAddress,
        len: u64,
        prot: IommuProt,
        skip_sync: bool,
    ) -> Result<DmaAddress, DmaError> {
        let region = a.allocate(&self.table, len, skip_sync)?;
        if let Err(source) = a.install(&self.table, region.iova, phys, len, prot) {
            self.table.unmap(region.iova, len);
            if let Err(e) = a.free(&self.table, region.iova, len) {
                log::error!("rollback of {} failed: {e}", region.iova);
            }
            log::error!("mapping {phys} at {} rejected: {source}", region.iova);
            return Err(DmaError::TableInstallFailed {
                iova: region.iova,
                source,
            });
        }
        Ok(region.iova)
    }

    /// Map `size` bytes at `phys + offset` for the device.
    ///
    /// Returns the device address of `phys + offset`; its in-page offset is
    /// preserved.
    ///
    /// # Errors
    /// - [`DmaError::InvalidSize`] for a zero or overflowing size.
    /// - [`DmaError::OutOfSpace`] if no region is free after one sweep.
    /// - [`DmaError::TableInstallFailed`] if the table refused the mapping.
    pub fn map_page(
        &self,
        phys: PhysicalAddress,
        offset: u64,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<DmaAddress, DmaError> {
        let target = phys
            .as_u64()
            .checked_add(offset)
            .map(PhysicalAddress::new)
            .ok_or(DmaError::InvalidSize(size))?;
        let in_page = target.page_offset();
        let len = span_len(in_page, size)?;
        let coherent = attrs.resolve_coherent(self.coherent);
        let prot = IommuProt::for_mapping(dir, attrs, coherent);

        if !coherent && !attrs.skips_cpu_sync() {
            self.cache.flush(target, size, dir);
        }

        let iova = {
            let mut a = self.allocator.lock_irqsave();
            self.map_locked(&mut a, target.page_base(), len, prot, attrs.skips_cpu_sync())?
        };

        log::trace!("map {iova} -> {} len {len:#x} {prot:?}", target.page_base());
        Ok(iova + in_page)
    }

    /// Undo [`map_page`](Self::map_page). `size`, `dir` and `attrs` must
    /// match the mapping call.
    ///
    /// # Errors
    /// - [`DmaError::InvalidSize`] for a zero or overflowing size.
    /// - [`DmaError::OutOfRange`] if the range is not inside the window.
    /// - [`DmaError::InvalidTranslation`] if a non-coherent mapping has no
    ///   translation; nothing is unmapped in that case.
    pub fn unmap_page(
        &self,
        iova: DmaAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        let in_page = iova.page_offset();
        let len = span_len(in_page, size)?;
        let start = iova.page_base();
        self.check_window(start, len)?;

        let coherent = attrs.resolve_coherent(self.coherent);
        if !coherent && !attrs.skips_cpu_sync() {
            let Some(phys) = self.table.iova_to_phys(iova) else {
                log::error!("unmap of {iova}: no translation");
                return Err(DmaError::InvalidTranslation(iova));
            };
            self.cache.invalidate(phys, size, dir);
        }

        {
            let mut a = self.allocator.lock_irqsave();
            self.table.unmap(start, len);
            a.free(&self.table, start, len)?;
        }

        log::trace!("unmap {start} len {len:#x}");
        Ok(())
    }

    /// Hand a mapped buffer back to the CPU after the device wrote it.
    ///
    /// # Errors
    /// [`DmaError::InvalidTranslation`] if a non-coherent `iova` has no
    /// translation.
    pub fn sync_for_cpu(&self, iova: DmaAddress, size: u64, dir: DmaDirection) -> Result<(), DmaError> {
        if self.table.is_coherent(iova) {
            return Ok(());
        }
        let phys = self.translate(iova)?;
        self.cache.invalidate(phys, size, dir);
        Ok(())
    }

    /// Hand a mapped buffer to the device after the CPU wrote it.
    ///
    /// # Errors
    /// [`DmaError::InvalidTranslation`] if a non-coherent `iova` has no
    /// translation.
    pub fn sync_for_device(
        &self,
        iova: DmaAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        if self.table.is_coherent(iova) {
            return Ok(());
        }
        let phys = self.translate(iova)?;
        self.cache.flush(phys, size, dir);
        Ok(())
    }

    fn translate(&self, iova: DmaAddress) -> Result<PhysicalAddress, DmaError> {
        self.table.iova_to_phys(iova).ok_or_else(|| {
            log::error!("sync of {iova}: no translation");
            DmaError::InvalidTranslation(iova)
        })
    }

    /// Map a raw physical range such as a register window. Device memory
    /// protection, no cache maintenance.
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page).
    pub fn map_resource(
        &self,
        phys: PhysicalAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<DmaAddress, DmaError> {
        let in_page = phys.page_offset();
        let len = span_len(in_page, size)?;
        let prot = IommuProt::for_resource(dir);

        let iova = {
            let mut a = self.allocator.lock_irqsave();
            self.map_locked(&mut a, phys.page_base(), len, prot, attrs.skips_cpu_sync())?
        };

        log::trace!("map resource {iova} -> {} len {len:#x}", phys.page_base());
        Ok(iova + in_page)
    }

    /// Undo [`map_resource`](Self::map_resource).
    ///
    /// # Errors
    /// - [`DmaError::InvalidSize`] for a zero or overflowing size.
    /// - [`DmaError::OutOfRange`] if the range is not inside the window.
    pub fn unmap_resource(
        &self,
        iova: DmaAddress,
        size: u64,
        _dir: DmaDirection,
        _attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        let len = span_len(iova.page_offset(), size)?;
        let start = iova.page_base();
        self.check_window(start, len)?;

        let mut a = self.allocator.lock_irqsave();
        self.table.unmap(start, len);
        a.free(&self.table, start, len)?;
        drop(a);

        log::trace!("unmap resource {start} len {len:#x}");
        Ok(())
    }

    /// Scatter-gather lists are not handled here; use the generic path.
    ///
    /// # Errors
    /// Always [`DmaError::Unsupported`].
    pub fn map_sg(
        &self,
        segments: &[Segment],
        _dir: DmaDirection,
        _attrs: DmaAttrs,
    ) -> Result<DmaAddress, DmaError> {
        log::warn!("map_sg of {} segments on the fast path", segments.len());
        Err(DmaError::Unsupported)
    }

    /// # Errors
    /// Always [`DmaError::Unsupported`].
    pub fn unmap_sg(
        &self,
        segments: &[Segment],
        _dir: DmaDirection,
        _attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        log::warn!("unmap_sg of {} segments on the fast path", segments.len());
        Err(DmaError::Unsupported)
    }

    /// # Errors
    /// Always [`DmaError::Unsupported`].
    pub fn sync_sg_for_cpu(&self, segments: &[Segment], _dir: DmaDirection) -> Result<(), DmaError> {
        log::warn!("sync_sg_for_cpu of {} segments on the fast path", segments.len());
        Err(DmaError::Unsupported)
    }

    /// # Errors
    /// Always [`DmaError::Unsupported`].
    pub fn sync_sg_for_device(&self, segments: &[Segment], _dir: DmaDirection) -> Result<(), DmaError> {
        log::warn!("sync_sg_for_device of {} segments on the fast path", segments.len());
        Err(DmaError::Unsupported)
    }
}

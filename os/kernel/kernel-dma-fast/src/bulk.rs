//! # Bulk allocations
//!
//! Buffers built from individually acquired frames, mapped contiguously for
//! the device and remapped contiguously for the CPU.

use crate::addresses::{DmaAddress, PhysicalAddress, checked_align_up};
use crate::attrs::{CpuMapping, DmaAttrs, DmaDirection, IommuProt};
use crate::error::DmaError;
use crate::mapping::{FastMapping, Segment};
use crate::ports::{CacheMaintenance, FrameProvider, TranslationTable};
use crate::{FAST_PAGE_SHIFT, FAST_PAGE_SIZE};
use alloc::vec::Vec;
use core::ptr::NonNull;

/// A buffer returned by [`FastMapping::bulk_alloc`].
///
/// Must be handed back to [`FastMapping::bulk_free`] of the same mapping.
#[derive(Debug)]
#[must_use]
pub struct BulkAllocation {
    cpu: NonNull<u8>,
    dma: DmaAddress,
    size: u64,
    frames: Vec<PhysicalAddress>,
}

impl BulkAllocation {
    /// CPU virtual address of the buffer.
    #[inline]
    #[must_use]
    pub const fn cpu_ptr(&self) -> NonNull<u8> {
        self.cpu
    }

    #[inline]
    #[must_use]
    pub const fn dma_address(&self) -> DmaAddress {
        self.dma
    }

    /// Size in bytes, a multiple of the fast page size.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Backing frames in buffer order.
    #[inline]
    #[must_use]
    pub fn frames(&self) -> &[PhysicalAddress] {
        &self.frames
    }

    /// Physically contiguous runs of the backing frames, in buffer order.
    #[must_use]
    pub fn segments(&self) -> Vec<Segment> {
        coalesce(&self.frames)
    }
}

/// Merge adjacent frames into contiguous segments.
fn coalesce(frames: &[PhysicalAddress]) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    for &frame in frames {
        match segments.last_mut() {
            Some(last) if last.phys.as_u64() + last.len == frame.as_u64() => {
                last.len += FAST_PAGE_SIZE;
            }
            _ => segments.push(Segment::new(frame, FAST_PAGE_SIZE)),
        }
    }
    segments
}

impl<T, C, F> FastMapping<T, C, F>
where
    T: TranslationTable,
    C: CacheMaintenance,
    F: FrameProvider,
{
    /// Allocate a buffer of `size` bytes (rounded up to the page size),
    /// readable and writable by the device.
    ///
    /// If a segment cannot be mapped, the region is released and the frames
    /// returned, but segments mapped before it are not unmapped.
    ///
    /// # Errors
    /// - [`DmaError::InvalidSize`] for a zero or overflowing size.
    /// - [`DmaError::FramesUnavailable`] if the frames cannot be acquired.
    /// - [`DmaError::OutOfSpace`] if no region is free after one sweep.
    /// - [`DmaError::TableInstallFailed`] if a segment was refused.
    /// - [`DmaError::RemapFailed`] if the CPU remap failed; the device
    ///   mapping is fully undone in that case.
    pub fn bulk_alloc(&self, size: u64, attrs: DmaAttrs) -> Result<BulkAllocation, DmaError> {
        let size = checked_align_up(size, FAST_PAGE_SIZE)
            .filter(|&s| s != 0)
            .ok_or(DmaError::InvalidSize(size))?;
        let count = usize::try_from(size >> FAST_PAGE_SHIFT).map_err(|_| DmaError::InvalidSize(size))?;
        let coherent = attrs.resolve_coherent(self.coherent);
        let prot = IommuProt::for_mapping(DmaDirection::Bidirectional, attrs, coherent);

        let Some(frames) = self.frames.acquire_frames(count) else {
            log::error!("bulk alloc: no frames for {count} pages");
            return Err(DmaError::FramesUnavailable(count));
        };

        let segments = coalesce(&frames);
        if !coherent {
            for seg in &segments {
                self.cache.flush(seg.phys, seg.len, DmaDirection::Bidirectional);
            }
        }

        let mapped = {
            let mut a = self.allocator.lock_irqsave();
            a.allocate(&self.table, size, attrs.skips_cpu_sync()).and_then(|region| {
                let mut at = region.iova;
                for seg in &segments {
                    if let Err(source) = a.install(&self.table, at, seg.phys, seg.len, prot) {
                        // Earlier segments are not unmapped.
                        if let Err(e) = a.free(&self.table, region.iova, size) {
                            log::error!("bulk alloc: rollback of {} failed: {e}", region.iova);
                        }
                        return Err(DmaError::TableInstallFailed { iova: at, source });
                    }
                    at += seg.len;
                }
                Ok(region.iova)
            })
        };
        let dma = match mapped {
            Ok(dma) => dma,
            Err(e) => {
                log::error!("bulk alloc of {size:#x} bytes failed: {e}");
                self.frames.release_frames(frames);
                return Err(e);
            }
        };

        let remap = CpuMapping::for_attrs(attrs, coherent);
        let Some(cpu) = self.frames.remap_for_cpu(&frames, size, remap) else {
            log::error!("bulk alloc: cpu remap of {size:#x} bytes failed");
            {
                let mut a = self.allocator.lock_irqsave();
                self.table.unmap(dma, size);
                if let Err(e) = a.free(&self.table, dma, size) {
                    log::error!("bulk alloc: rollback of {dma} failed: {e}");
                }
            }
            self.frames.release_frames(frames);
            return Err(DmaError::RemapFailed);
        };

        log::trace!("bulk alloc {dma} len {size:#x} in {} segments", segments.len());
        Ok(BulkAllocation {
            cpu,
            dma,
            size,
            frames,
        })
    }

    /// Release a buffer from [`bulk_alloc`](Self::bulk_alloc).
    ///
    /// # Errors
    /// [`DmaError::OutOfRange`] if the allocation does not belong to this
    /// window. The frames are released regardless.
    pub fn bulk_free(&self, alloc: BulkAllocation) -> Result<(), DmaError> {
        let BulkAllocation {
            cpu,
            dma,
            size,
            frames,
        } = alloc;

        self.frames.unmap_cpu_remap(cpu, size);
        let freed = {
            let mut a = self.allocator.lock_irqsave();
            self.table.unmap(dma, size);
            a.free(&self.table, dma, size).map(|_| ())
        };
        self.frames.release_frames(frames);

        log::trace!("bulk free {dma} len {size:#x}");
        freed
    }
}

//! # Flat software translation table
//!
//! A [`TranslationTable`] over one flat array of leaf descriptors, one per
//! fast page of the window. It models what matters to the fast path: leaves
//! that were unmapped keep a *stale* marker until the owner invalidates and
//! clears them, so a mapping installed over one can be detected.

use crate::addresses::{DmaAddress, PhysicalAddress};
use crate::attrs::IommuProt;
use crate::ports::{LeafWrite, TableError, TranslationTable};
use crate::{FAST_PAGE_SHIFT, FAST_PAGE_SIZE};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::SpinLock;

/// One leaf descriptor of a [`FlatPageTable`].
///
/// | Bits   | Field    | Meaning |
/// |--------|----------|---------|
/// | 0      | `valid`  | Entry translates |
/// | 1      | `read`   | Device may read |
/// | 2      | `write`  | Device may write |
/// | 3      | `cache`  | Cacheable, snooped |
/// | 4      | `noexec` | No instruction fetch |
/// | 5      | `mmio`   | Device memory |
/// | 6      | `guard`  | Erratum guard, no access |
/// | 7      | `stale`  | Unmapped, not yet invalidated |
/// | 8–11   | reserved | |
/// | 12–51  | `frame`  | Physical frame number |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct FastPte {
    pub valid: bool,
    pub read: bool,
    pub write: bool,
    pub cache: bool,
    pub noexec: bool,
    pub mmio: bool,
    pub guard: bool,
    pub stale: bool,
    #[bits(4)]
    __: u8,
    /// Physical address bits [51:12].
    #[bits(40)]
    pub frame: u64,
    #[bits(12)]
    __: u16,
}

impl FastPte {
    /// Highest frame number the `frame` field holds.
    pub const MAX_FRAME: u64 = (1 << 40) - 1;

    /// Live leaf for `phys` with `prot`.
    ///
    /// `phys >> FAST_PAGE_SHIFT` must not exceed [`MAX_FRAME`](Self::MAX_FRAME).
    #[must_use]
    pub const fn leaf(phys: PhysicalAddress, prot: IommuProt) -> Self {
        Self::new()
            .with_valid(true)
            .with_read(prot.contains(IommuProt::READ))
            .with_write(prot.contains(IommuProt::WRITE))
            .with_cache(prot.contains(IommuProt::CACHE))
            .with_noexec(prot.contains(IommuProt::NOEXEC))
            .with_mmio(prot.contains(IommuProt::MMIO))
            .with_guard(prot.contains(IommuProt::GUARD))
            .with_frame(phys.as_u64() >> FAST_PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << FAST_PAGE_SHIFT)
    }

    /// Protection encoded in this entry.
    #[must_use]
    pub const fn prot(self) -> IommuProt {
        let mut prot = IommuProt::empty();
        if self.read() {
            prot = prot.union(IommuProt::READ);
        }
        if self.write() {
            prot = prot.union(IommuProt::WRITE);
        }
        if self.cache() {
            prot = prot.union(IommuProt::CACHE);
        }
        if self.noexec() {
            prot = prot.union(IommuProt::NOEXEC);
        }
        if self.mmio() {
            prot = prot.union(IommuProt::MMIO);
        }
        if self.guard() {
            prot = prot.union(IommuProt::GUARD);
        }
        prot
    }
}

/// Software translation table covering `[base, base + size)`.
pub struct FlatPageTable {
    base: DmaAddress,
    entries: SpinLock<Vec<FastPte>>,
    invalidations: AtomicUsize,
}

impl FlatPageTable {
    /// Empty table for the window, or `None` if `size` is not page aligned or
    /// the descriptors cannot be allocated.
    #[must_use]
    pub fn new(base: DmaAddress, size: u64) -> Option<Self> {
        if size % FAST_PAGE_SIZE != 0 {
            return None;
        }
        let pages = usize::try_from(size >> FAST_PAGE_SHIFT).ok()?;
        let mut entries = Vec::new();
        entries.try_reserve_exact(pages).ok()?;
        entries.resize(pages, FastPte::new());
        Some(Self {
            base,
            entries: SpinLock::new(entries),
            invalidations: AtomicUsize::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> DmaAddress {
        self.base
    }

    /// Number of [`invalidate_all`](TranslationTable::invalidate_all) calls.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Descriptor covering `iova`.
    #[must_use]
    pub fn entry(&self, iova: DmaAddress) -> Option<FastPte> {
        let idx = self.index_of(iova)?;
        self.entries.with_lock(|e| e.get(idx).copied())
    }

    /// Number of live leaves.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.entries.with_lock(|e| e.iter().filter(|p| p.valid()).count())
    }

    /// Number of leaves awaiting invalidation.
    #[must_use]
    pub fn stale_pages(&self) -> usize {
        self.entries.with_lock(|e| e.iter().filter(|p| p.stale()).count())
    }

    fn index_of(&self, iova: DmaAddress) -> Option<usize> {
        let off = iova.checked_offset_from(self.base)?;
        usize::try_from(off >> FAST_PAGE_SHIFT).ok()
    }

    /// Page indices covered by `[iova, iova + len)`, if inside the table.
    fn span(&self, iova: DmaAddress, len: u64, pages: usize) -> Option<Range<usize>> {
        let first = self.index_of(iova)?;
        let count = usize::try_from(len.div_ceil(FAST_PAGE_SIZE)).ok()?;
        let end = first.checked_add(count)?;
        (end <= pages).then_some(first..end)
    }
}

impl TranslationTable for FlatPageTable {
    fn map(
        &self,
        iova: DmaAddress,
        phys: PhysicalAddress,
        len: u64,
        prot: IommuProt,
    ) -> Result<LeafWrite, TableError> {
        let mut entries = self.entries.lock();
        let span = self
            .span(iova, len, entries.len())
            .ok_or(TableError::OutOfRange)?;

        let first_frame = phys.as_u64() >> FAST_PAGE_SHIFT;
        let fits = (span.len() as u64)
            .saturating_sub(1)
            .checked_add(first_frame)
            .is_some_and(|last| last <= FastPte::MAX_FRAME);
        if !fits {
            return Err(TableError::OutOfRange);
        }

        if entries[span.clone()].iter().any(|p| p.valid()) {
            return Err(TableError::AlreadyMapped);
        }

        let mut write = LeafWrite::Clean;
        for (n, idx) in span.enumerate() {
            let n = n as u64;
            if entries[idx].stale() && write == LeafWrite::Clean {
                write = LeafWrite::OverStale {
                    iova: iova.page_base() + (n << FAST_PAGE_SHIFT),
                };
            }
            let frame = PhysicalAddress::new((first_frame + n) << FAST_PAGE_SHIFT);
            entries[idx] = FastPte::leaf(frame, prot);
        }
        Ok(write)
    }

    fn unmap(&self, iova: DmaAddress, len: u64) -> u64 {
        let mut entries = self.entries.lock();
        let Some(span) = self.span(iova, len, entries.len()) else {
            return 0;
        };

        let mut unmapped = 0;
        for pte in &mut entries[span] {
            if pte.valid() {
                *pte = FastPte::new().with_stale(true);
                unmapped += FAST_PAGE_SIZE;
            }
        }
        unmapped
    }

    fn iova_to_phys(&self, iova: DmaAddress) -> Option<PhysicalAddress> {
        let pte = self.entry(iova)?;
        (pte.valid() && !pte.guard()).then(|| pte.physical_address() + iova.page_offset())
    }

    fn is_coherent(&self, iova: DmaAddress) -> bool {
        self.entry(iova).is_some_and(|p| p.valid() && p.cache())
    }

    fn clear_stale_entries(&self, range: Range<DmaAddress>, _skip_sync: bool) {
        let mut entries = self.entries.lock();
        let first = self.index_of(range.start).unwrap_or(0);
        let end = self
            .index_of(range.end)
            .map_or(entries.len(), |e| e.min(entries.len()));
        for pte in entries.iter_mut().take(end).skip(first) {
            if pte.stale() {
                *pte = FastPte::new();
            }
        }
    }

    fn invalidate_all(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

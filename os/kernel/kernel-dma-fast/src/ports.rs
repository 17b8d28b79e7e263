//! # Collaborator interfaces
//!
//! The mapper does not walk page tables, touch CPU caches or allocate host
//! memory itself. It drives three collaborators through these traits:
//!
//! - [`TranslationTable`]: installs and removes leaf entries of the device
//!   address space and performs TLB maintenance.
//! - [`CacheMaintenance`]: cleans/invalidates CPU caches over physical ranges.
//! - [`FrameProvider`]: hands out host frames and remaps them for CPU access.
//!
//! All collaborators are invoked with `&self`; implementations keep their
//! own interior state. [`TranslationTable::map`] and
//! [`TranslationTable::unmap`] are called with the address-space lock held
//! and must not block.

use crate::addresses::{DmaAddress, PhysicalAddress};
use crate::attrs::{CpuMapping, DmaDirection, IommuProt};
use alloc::vec::Vec;
use core::ops::Range;
use core::ptr::NonNull;

/// Failure reported by a [`TranslationTable`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("out of table memory")]
    NoMemory,
    #[error("address outside the table's range")]
    OutOfRange,
    #[error("entry is already mapped")]
    AlreadyMapped,
    #[error("mapping rejected")]
    Rejected,
}

/// What a successful [`TranslationTable::map`] wrote over.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub enum LeafWrite {
    /// Every written leaf was empty.
    Clean,
    /// At least one written leaf still held a translation that was never
    /// invalidated; `iova` is the first such address.
    OverStale { iova: DmaAddress },
}

/// Translation-table engine of one device address space.
pub trait TranslationTable: Send + Sync {
    /// Install `len` bytes at `iova → phys` with `prot`.
    ///
    /// `iova`, `phys` and `len` are multiples of the fast page size.
    ///
    /// # Errors
    /// Any [`TableError`]; nothing is guaranteed about entries written
    /// before the failure.
    fn map(
        &self,
        iova: DmaAddress,
        phys: PhysicalAddress,
        len: u64,
        prot: IommuProt,
    ) -> Result<LeafWrite, TableError>;

    /// Remove `len` bytes at `iova`. Returns the number of bytes unmapped.
    ///
    /// No TLB maintenance is implied.
    fn unmap(&self, iova: DmaAddress, len: u64) -> u64;

    /// Translate a device address, including its in-page offset.
    fn iova_to_phys(&self, iova: DmaAddress) -> Option<PhysicalAddress>;

    /// Whether the mapping at `iova` is cache coherent.
    fn is_coherent(&self, iova: DmaAddress) -> bool;

    /// Erase leaf entries in `range` that are unmapped but still marked as
    /// awaiting invalidation. Called right after [`invalidate_all`](Self::invalidate_all).
    fn clear_stale_entries(&self, range: Range<DmaAddress>, skip_sync: bool);

    /// Invalidate every cached translation of this address space.
    fn invalidate_all(&self);
}

/// CPU cache maintenance over physical ranges.
pub trait CacheMaintenance: Send + Sync {
    /// Make CPU writes visible to the device before it accesses the range.
    fn flush(&self, phys: PhysicalAddress, len: u64, dir: DmaDirection);

    /// Drop CPU cache lines so the CPU observes what the device wrote.
    fn invalidate(&self, phys: PhysicalAddress, len: u64, dir: DmaDirection);
}

/// Host frame allocation and CPU-side remapping for bulk allocations.
pub trait FrameProvider: Send + Sync {
    /// Acquire `count` fast-page frames, not necessarily contiguous.
    /// All or nothing.
    fn acquire_frames(&self, count: usize) -> Option<Vec<PhysicalAddress>>;

    fn release_frames(&self, frames: Vec<PhysicalAddress>);

    /// Map `frames` virtually contiguous for the CPU.
    fn remap_for_cpu(
        &self,
        frames: &[PhysicalAddress],
        size: u64,
        mapping: CpuMapping,
    ) -> Option<NonNull<u8>>;

    fn unmap_cpu_remap(&self, ptr: NonNull<u8>, size: u64);
}

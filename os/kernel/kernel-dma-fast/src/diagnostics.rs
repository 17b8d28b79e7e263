//! # Stale-TLB diagnostics
//!
//! A translation table that finds itself writing a leaf entry over one that
//! was unmapped but never invalidated reports it through
//! [`LeafWrite::OverStale`](crate::LeafWrite::OverStale). The allocator turns
//! that into a [`StaleTlbReport`] for the registered [`DiagnosticsHook`].
//!
//! Such a write means a freed page was handed out again while a device TLB
//! could still translate it. Nothing is repaired; the hook only reports.

use crate::DmaAddress;
use crate::bitmap::Bitmap;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot handed to a [`DiagnosticsHook`].
#[derive(Debug)]
pub struct StaleTlbReport<'a> {
    /// Device address of the offending leaf.
    pub iova: DmaAddress,
    /// Page index of `iova` inside the window.
    pub index: usize,
    pub allocated: &'a Bitmap,
    pub tlb_dirty: &'a Bitmap,
}

/// Observer for mappings installed over stale translations.
///
/// Invoked with the address-space lock held; must not block and must not
/// call back into the mapper.
pub trait DiagnosticsHook: Send + Sync {
    fn mapped_over_stale(&self, report: &StaleTlbReport<'_>);
}

/// Words per dump row (32 bytes).
const DUMP_ROW_WORDS: usize = 4;

/// Default hook: logs the offending address and dumps the occupancy bitmap.
#[derive(Debug)]
pub struct LogDiagnostics {
    events: AtomicUsize,
    last_index: AtomicUsize,
}

impl LogDiagnostics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events: AtomicUsize::new(0),
            last_index: AtomicUsize::new(usize::MAX),
        }
    }

    /// Number of reports received so far.
    #[must_use]
    pub fn events(&self) -> usize {
        self.events.load(Ordering::Relaxed)
    }

    /// Page index of the most recent report.
    #[must_use]
    pub fn last_index(&self) -> Option<usize> {
        match self.last_index.load(Ordering::Relaxed) {
            usize::MAX => None,
            idx => Some(idx),
        }
    }
}

impl Default for LogDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsHook for LogDiagnostics {
    fn mapped_over_stale(&self, report: &StaleTlbReport<'_>) {
        self.last_index.store(report.index, Ordering::Relaxed);
        self.events.fetch_add(1, Ordering::Relaxed);

        log::error!("Mapped over stale tlb at {}", report.iova);
        log::error!("bitmap (failure at idx {}):", report.index);
        for (row, chunk) in report.allocated.words().chunks(DUMP_ROW_WORDS).enumerate() {
            match *chunk {
                [a, b, c, d] => log::error!(
                    "bmap: {:08x}: {a:016x} {b:016x} {c:016x} {d:016x}",
                    row * DUMP_ROW_WORDS * 8
                ),
                [a, b, c] => log::error!(
                    "bmap: {:08x}: {a:016x} {b:016x} {c:016x}",
                    row * DUMP_ROW_WORDS * 8
                ),
                [a, b] => log::error!("bmap: {:08x}: {a:016x} {b:016x}", row * DUMP_ROW_WORDS * 8),
                [a] => log::error!("bmap: {:08x}: {a:016x}", row * DUMP_ROW_WORDS * 8),
                _ => {}
            }
        }
    }
}

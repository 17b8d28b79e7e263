//! # Address space lifecycle
//!
//! ```text
//! IovaSpace::create(base, size) ─► reserve(..)* ─► attach(DeviceBinding) ─► FastMapping
//!                                                                               │
//!                                                     table ◄── destroy() ◄─────┘
//! ```
//!
//! A space is never visible to other callers until [`IovaSpace::attach`]
//! returns; any failure before that drops all partial state.

use crate::addresses::{DmaAddress, PhysicalAddress};
use crate::diagnostics::{DiagnosticsHook, LogDiagnostics};
use crate::error::DmaError;
use crate::iova::IovaAllocator;
use crate::mapping::FastMapping;
use crate::ports::{CacheMaintenance, FrameProvider, TranslationTable};
use crate::FAST_PAGE_SIZE;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_sync::SpinLock;

/// Settings for parts that prefetch past the end of a mapping.
///
/// Every allocation is padded to `min_iova_align` and the padding is mapped
/// to `guard_page` with guard protection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ErratumConfig {
    pub min_iova_align: u64,
    pub guard_page: PhysicalAddress,
}

impl ErratumConfig {
    #[must_use]
    pub const fn new(min_iova_align: u64, guard_page: PhysicalAddress) -> Self {
        Self {
            min_iova_align,
            guard_page,
        }
    }

    /// Power-of-two alignment of at least one page and an aligned guard page.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.min_iova_align.is_power_of_two()
            && self.min_iova_align >= FAST_PAGE_SIZE
            && self.guard_page.is_page_aligned()
    }
}

/// Type of a bus resource window.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    Memory,
    Io,
    Other,
}

/// A host bridge window whose bus addresses must never be handed out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResourceWindow {
    pub kind: ResourceKind,
    /// CPU address of the first byte.
    pub start: u64,
    /// CPU address of the last byte (inclusive).
    pub end: u64,
    /// CPU address minus bus address.
    pub offset: u64,
}

impl ResourceWindow {
    /// Bus address range `[start, end]`, or `None` if the window does not
    /// occupy bus addresses or the offset does not fit.
    #[must_use]
    pub fn bus_range(&self) -> Option<(DmaAddress, DmaAddress)> {
        if !matches!(self.kind, ResourceKind::Memory | ResourceKind::Io) {
            return None;
        }
        let start = self.start.checked_sub(self.offset)?;
        let end = self.end.checked_sub(self.offset)?;
        Some((DmaAddress::new(start), DmaAddress::new(end)))
    }
}

/// Everything [`IovaSpace::attach`] binds to an address space.
pub struct DeviceBinding<T, C, F> {
    pub(crate) table: T,
    pub(crate) cache: C,
    pub(crate) frames: F,
    pub(crate) coherent: bool,
    pub(crate) erratum: Option<ErratumConfig>,
    pub(crate) windows: Vec<ResourceWindow>,
    pub(crate) diagnostics: Option<Arc<dyn DiagnosticsHook>>,
}

impl<T, C, F> DeviceBinding<T, C, F>
where
    T: TranslationTable,
    C: CacheMaintenance,
    F: FrameProvider,
{
    /// Non-coherent device, no erratum, no windows, default diagnostics.
    pub fn new(table: T, cache: C, frames: F) -> Self {
        Self {
            table,
            cache,
            frames,
            coherent: false,
            erratum: None,
            windows: Vec::new(),
            diagnostics: None,
        }
    }

    /// Default coherency of the device's mappings.
    #[must_use]
    pub const fn with_coherent(mut self, coherent: bool) -> Self {
        self.coherent = coherent;
        self
    }

    #[must_use]
    pub const fn with_erratum(mut self, erratum: ErratumConfig) -> Self {
        self.erratum = Some(erratum);
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: ResourceWindow) -> Self {
        self.windows.push(window);
        self
    }

    /// Hook to register instead of [`LogDiagnostics`].
    #[must_use]
    pub fn with_diagnostics(mut self, hook: Arc<dyn DiagnosticsHook>) -> Self {
        self.diagnostics = Some(hook);
        self
    }
}

/// A device address space that is created but not yet bound to a device.
#[derive(Debug)]
pub struct IovaSpace {
    allocator: IovaAllocator,
}

impl IovaSpace {
    /// Create the space `[base, base + size)`.
    ///
    /// # Errors
    /// - [`DmaError::InvalidWindow`] if the window is empty or not page aligned.
    /// - [`DmaError::WindowTooLarge`] if `base + size` exceeds [`MAX_IOVA_END`](crate::MAX_IOVA_END).
    /// - [`DmaError::OutOfMemory`] if the bitmaps cannot be allocated.
    pub fn create(base: DmaAddress, size: u64) -> Result<Self, DmaError> {
        Ok(Self {
            allocator: IovaAllocator::new(base, size)?,
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> DmaAddress {
        self.allocator.base()
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.allocator.size()
    }

    #[inline]
    #[must_use]
    pub const fn allocator(&self) -> &IovaAllocator {
        &self.allocator
    }

    /// Permanently occupy `[start, end)`. See [`IovaAllocator::reserve`].
    pub fn reserve(&mut self, start: DmaAddress, end: DmaAddress) -> Option<Range<DmaAddress>> {
        self.allocator.reserve(start, end)
    }

    /// Bind the space to a device and make it usable.
    ///
    /// Applies the erratum configuration, reserves the bus ranges of the
    /// binding's memory and I/O windows and registers the diagnostics hook
    /// ([`LogDiagnostics`] unless the binding provides one).
    ///
    /// # Errors
    /// [`DmaError::InvalidErratum`] if the erratum alignment is not a power
    /// of two of at least one page, or the guard page is not page aligned.
    pub fn attach<T, C, F>(
        mut self,
        binding: DeviceBinding<T, C, F>,
    ) -> Result<FastMapping<T, C, F>, DmaError>
    where
        T: TranslationTable,
        C: CacheMaintenance,
        F: FrameProvider,
    {
        let DeviceBinding {
            table,
            cache,
            frames,
            coherent,
            erratum,
            windows,
            diagnostics,
        } = binding;

        if let Some(e) = erratum {
            if !e.is_valid() {
                return Err(DmaError::InvalidErratum);
            }
        }
        self.allocator.set_erratum(erratum);

        for window in &windows {
            let Some((start, last)) = window.bus_range() else {
                continue;
            };
            // `last` is inclusive; rounding it up covers its page.
            let end = DmaAddress::new(last.as_u64().saturating_add(1));
            if let Some(got) = self.allocator.reserve(start, end) {
                log::debug!("iova allocator reserved {}-{}", got.start, got.end);
            }
        }

        let hook = diagnostics.unwrap_or_else(|| Arc::new(LogDiagnostics::new()));
        let _ = self.allocator.set_diagnostics(Some(hook));

        log::info!(
            "fast-path iova space {}+{:#x} attached ({}coherent{})",
            self.allocator.base(),
            self.allocator.size(),
            if coherent { "" } else { "non-" },
            if erratum.is_some() { ", guarded" } else { "" }
        );

        Ok(FastMapping::new(
            SpinLock::new(self.allocator),
            table,
            cache,
            frames,
            coherent,
        ))
    }
}

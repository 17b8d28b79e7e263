use crate::addresses::DmaAddress;
use crate::ports::TableError;

/// Errors returned by the fast-path mapper.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DmaError {
    /// No aligned run of free pages, even after an invalidation sweep.
    #[error("device address space exhausted")]
    OutOfSpace,
    /// The translation table rejected a mapping; the region was rolled back.
    #[error("translation table rejected mapping at {iova}")]
    TableInstallFailed {
        iova: DmaAddress,
        #[source]
        source: TableError,
    },
    /// An address expected to be mapped has no translation.
    #[error("no translation for mapped address {0}")]
    InvalidTranslation(DmaAddress),
    /// Scatter-gather lists are not handled by the fast path.
    #[error("scatter-gather mapping is not supported by the fast path")]
    Unsupported,
    #[error("address window must be non-empty and page aligned")]
    InvalidWindow,
    #[error("address window {base} + {size:#x} exceeds the supported span")]
    WindowTooLarge { base: DmaAddress, size: u64 },
    #[error("out of memory for allocator bookkeeping")]
    OutOfMemory,
    #[error("invalid erratum configuration")]
    InvalidErratum,
    #[error("invalid mapping size {0:#x}")]
    InvalidSize(u64),
    #[error("range at {0} lies outside the address window")]
    OutOfRange(DmaAddress),
    #[error("could not acquire {0} frames")]
    FramesUnavailable(usize),
    #[error("failed to remap frames for CPU access")]
    RemapFailed,
}

//! Transfer direction, per-call attributes and the protections derived from them.

/// Direction of a DMA transfer, seen from the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DmaDirection {
    /// The device both reads and writes the buffer.
    Bidirectional,
    /// The device reads the buffer (CPU → device).
    ToDevice,
    /// The device writes the buffer (device → CPU).
    FromDevice,
    /// No transfer; mapped without access rights.
    None,
}

bitflags::bitflags! {
    /// Per-call mapping attributes.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct DmaAttrs: u32 {
        /// Caller takes care of CPU cache maintenance.
        const SKIP_CPU_SYNC      = 1 << 0;
        /// Treat the mapping as coherent regardless of the device default.
        const FORCE_COHERENT     = 1 << 1;
        /// Treat the mapping as non-coherent regardless of the device default.
        const FORCE_NON_COHERENT = 1 << 2;
        /// Device-side strongly ordered (MMIO) mapping, CPU-side uncached.
        const STRONGLY_ORDERED   = 1 << 3;
        /// CPU-side write-combined remap for bulk allocations.
        const WRITE_COMBINE      = 1 << 4;
        /// Allow instruction fetch by the device.
        const EXEC_MAPPING       = 1 << 5;
    }
}

impl DmaAttrs {
    #[inline]
    #[must_use]
    pub const fn skips_cpu_sync(self) -> bool {
        self.contains(Self::SKIP_CPU_SYNC)
    }

    /// Resolve coherency against the device default.
    #[inline]
    #[must_use]
    pub const fn resolve_coherent(self, device_default: bool) -> bool {
        if self.contains(Self::FORCE_COHERENT) {
            true
        } else if self.contains(Self::FORCE_NON_COHERENT) {
            false
        } else {
            device_default
        }
    }
}

bitflags::bitflags! {
    /// Protection bits of a translation-table entry.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct IommuProt: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        /// Cacheable, snooped by the CPU caches.
        const CACHE  = 1 << 2;
        const NOEXEC = 1 << 3;
        /// Device (strongly ordered) memory.
        const MMIO   = 1 << 4;
        /// Erratum guard entry; grants no access.
        const GUARD  = 1 << 5;
    }
}

impl IommuProt {
    /// Access rights implied by a transfer direction.
    #[must_use]
    pub const fn from_direction(dir: DmaDirection) -> Self {
        match dir {
            DmaDirection::Bidirectional => Self::READ.union(Self::WRITE),
            DmaDirection::ToDevice => Self::READ,
            DmaDirection::FromDevice => Self::WRITE,
            DmaDirection::None => Self::empty(),
        }
    }

    /// Full protection for a data mapping.
    #[must_use]
    pub const fn for_mapping(dir: DmaDirection, attrs: DmaAttrs, coherent: bool) -> Self {
        let mut prot = Self::from_direction(dir);
        if !attrs.contains(DmaAttrs::EXEC_MAPPING) {
            prot = prot.union(Self::NOEXEC);
        }
        if attrs.contains(DmaAttrs::STRONGLY_ORDERED) {
            prot = prot.union(Self::MMIO);
        }
        if coherent {
            prot = prot.union(Self::CACHE);
        }
        prot
    }

    /// Protection for a raw resource (register window) mapping.
    #[must_use]
    pub const fn for_resource(dir: DmaDirection) -> Self {
        Self::from_direction(dir).union(Self::MMIO)
    }
}

/// Memory type of the CPU-side remap of a bulk allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CpuMapping {
    Cached,
    WriteCombine,
    NonCached,
}

impl CpuMapping {
    #[must_use]
    pub const fn for_attrs(attrs: DmaAttrs, coherent: bool) -> Self {
        if attrs.contains(DmaAttrs::STRONGLY_ORDERED) {
            Self::NonCached
        } else if !coherent || attrs.contains(DmaAttrs::WRITE_COMBINE) {
            Self::WriteCombine
        } else {
            Self::Cached
        }
    }
}

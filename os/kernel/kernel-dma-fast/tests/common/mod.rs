#![allow(dead_code)]

use kernel_dma_fast::{
    CacheMaintenance, CpuMapping, DeviceBinding, DmaAddress, DmaDirection, ErratumConfig,
    FastMapping, FlatPageTable, FrameProvider, IommuProt, IovaSpace, LeafWrite, PhysicalAddress,
    TableError, TranslationTable, FAST_PAGE_SIZE,
};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const BASE: u64 = 0x8000_0000;
pub const G: u64 = FAST_PAGE_SIZE;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheOp {
    Flush,
    Invalidate,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CacheCall {
    pub op: CacheOp,
    pub phys: PhysicalAddress,
    pub len: u64,
    pub dir: DmaDirection,
}

/// Records every cache maintenance call.
#[derive(Default)]
pub struct RecordingCache {
    calls: Mutex<Vec<CacheCall>>,
}

impl RecordingCache {
    pub fn calls(&self) -> Vec<CacheCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl CacheMaintenance for RecordingCache {
    fn flush(&self, phys: PhysicalAddress, len: u64, dir: DmaDirection) {
        self.calls.lock().unwrap().push(CacheCall {
            op: CacheOp::Flush,
            phys,
            len,
            dir,
        });
    }

    fn invalidate(&self, phys: PhysicalAddress, len: u64, dir: DmaDirection) {
        self.calls.lock().unwrap().push(CacheCall {
            op: CacheOp::Invalidate,
            phys,
            len,
            dir,
        });
    }
}

/// Hands out frames from a counter, `stride` pages apart, and backs CPU
/// remaps with heap buffers.
pub struct TestFrames {
    next: AtomicUsize,
    stride: u64,
    outstanding: AtomicUsize,
    available: AtomicUsize,
    fail_remap: AtomicBool,
    remaps: Mutex<Vec<(usize, Box<[u8]>, CpuMapping)>>,
}

impl TestFrames {
    /// Physically contiguous frames.
    pub fn contiguous() -> Self {
        Self::with_stride(1)
    }

    /// Every frame `stride` pages after the previous one.
    pub fn with_stride(stride: u64) -> Self {
        Self {
            next: AtomicUsize::new(0x10_0000),
            stride,
            outstanding: AtomicUsize::new(0),
            available: AtomicUsize::new(usize::MAX),
            fail_remap: AtomicBool::new(false),
            remaps: Mutex::new(Vec::new()),
        }
    }

    pub fn limit(&self, frames: usize) {
        self.available.store(frames, Ordering::SeqCst);
    }

    pub fn fail_remap(&self, fail: bool) {
        self.fail_remap.store(fail, Ordering::SeqCst);
    }

    /// Frames acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn live_remaps(&self) -> usize {
        self.remaps.lock().unwrap().len()
    }

    pub fn last_remap_mapping(&self) -> Option<CpuMapping> {
        self.remaps.lock().unwrap().last().map(|r| r.2)
    }
}

impl FrameProvider for TestFrames {
    fn acquire_frames(&self, count: usize) -> Option<Vec<PhysicalAddress>> {
        if count > self.available.load(Ordering::SeqCst) {
            return None;
        }
        let step = usize::try_from(self.stride * G).unwrap();
        let frames = (0..count)
            .map(|_| PhysicalAddress::new(self.next.fetch_add(step, Ordering::SeqCst) as u64))
            .collect();
        self.outstanding.fetch_add(count, Ordering::SeqCst);
        Some(frames)
    }

    fn release_frames(&self, frames: Vec<PhysicalAddress>) {
        self.outstanding.fetch_sub(frames.len(), Ordering::SeqCst);
    }

    fn remap_for_cpu(
        &self,
        _frames: &[PhysicalAddress],
        size: u64,
        mapping: CpuMapping,
    ) -> Option<NonNull<u8>> {
        if self.fail_remap.load(Ordering::SeqCst) {
            return None;
        }
        let mut buf = vec![0u8; usize::try_from(size).unwrap()].into_boxed_slice();
        let ptr = NonNull::new(buf.as_mut_ptr())?;
        self.remaps
            .lock()
            .unwrap()
            .push((ptr.as_ptr() as usize, buf, mapping));
        Some(ptr)
    }

    fn unmap_cpu_remap(&self, ptr: NonNull<u8>, size: u64) {
        let mut remaps = self.remaps.lock().unwrap();
        let idx = remaps
            .iter()
            .position(|r| r.0 == ptr.as_ptr() as usize)
            .expect("unknown remap");
        assert_eq!(remaps[idx].1.len() as u64, size);
        remaps.swap_remove(idx);
    }
}

/// [`FlatPageTable`] with failure injection.
pub struct FaultyTable {
    inner: FlatPageTable,
    map_calls: AtomicUsize,
    fail_at: AtomicUsize,
    fail_guard: AtomicBool,
    force_over_stale: AtomicBool,
    stale_clears: AtomicUsize,
}

impl FaultyTable {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            inner: FlatPageTable::new(DmaAddress::new(base), size).unwrap(),
            map_calls: AtomicUsize::new(0),
            fail_at: AtomicUsize::new(usize::MAX),
            fail_guard: AtomicBool::new(false),
            force_over_stale: AtomicBool::new(false),
            stale_clears: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &FlatPageTable {
        &self.inner
    }

    /// Fail the `n`-th map call from now (1-based).
    pub fn fail_nth_map(&self, n: usize) {
        let done = self.map_calls.load(Ordering::SeqCst);
        self.fail_at.store(done + n, Ordering::SeqCst);
    }

    pub fn fail_guard_maps(&self, fail: bool) {
        self.fail_guard.store(fail, Ordering::SeqCst);
    }

    /// Report the next successful map as written over a stale leaf.
    pub fn force_over_stale(&self) {
        self.force_over_stale.store(true, Ordering::SeqCst);
    }

    pub fn stale_clears(&self) -> usize {
        self.stale_clears.load(Ordering::SeqCst)
    }
}

impl TranslationTable for FaultyTable {
    fn map(
        &self,
        iova: DmaAddress,
        phys: PhysicalAddress,
        len: u64,
        prot: IommuProt,
    ) -> Result<LeafWrite, TableError> {
        let call = self.map_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at.load(Ordering::SeqCst) {
            return Err(TableError::NoMemory);
        }
        if prot.contains(IommuProt::GUARD) && self.fail_guard.load(Ordering::SeqCst) {
            return Err(TableError::Rejected);
        }
        let write = self.inner.map(iova, phys, len, prot)?;
        if self.force_over_stale.swap(false, Ordering::SeqCst) {
            return Ok(LeafWrite::OverStale { iova });
        }
        Ok(write)
    }

    fn unmap(&self, iova: DmaAddress, len: u64) -> u64 {
        self.inner.unmap(iova, len)
    }

    fn iova_to_phys(&self, iova: DmaAddress) -> Option<PhysicalAddress> {
        self.inner.iova_to_phys(iova)
    }

    fn is_coherent(&self, iova: DmaAddress) -> bool {
        self.inner.is_coherent(iova)
    }

    fn clear_stale_entries(&self, range: Range<DmaAddress>, skip_sync: bool) {
        self.stale_clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear_stale_entries(range, skip_sync);
    }

    fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}

pub type TestMapping = FastMapping<FaultyTable, RecordingCache, TestFrames>;

pub fn binding(pages: u64, frames: TestFrames) -> DeviceBinding<FaultyTable, RecordingCache, TestFrames> {
    DeviceBinding::new(
        FaultyTable::new(BASE, pages * G),
        RecordingCache::default(),
        frames,
    )
}

/// Attached mapping over `pages` pages at [`BASE`].
pub fn mapping(pages: u64, coherent: bool) -> TestMapping {
    IovaSpace::create(DmaAddress::new(BASE), pages * G)
        .unwrap()
        .attach(binding(pages, TestFrames::contiguous()).with_coherent(coherent))
        .unwrap()
}

/// Attached mapping with the prefetch erratum enabled.
pub fn guarded_mapping(pages: u64, guard_page: PhysicalAddress) -> TestMapping {
    IovaSpace::create(DmaAddress::new(BASE), pages * G)
        .unwrap()
        .attach(
            binding(pages, TestFrames::contiguous())
                .with_coherent(true)
                .with_erratum(ErratumConfig::new(
                    kernel_dma_fast::ERRATUM_MIN_IOVA_ALIGN,
                    guard_page,
                )),
        )
        .unwrap()
}

/// Snapshot of both bitmaps as word vectors.
pub fn bitmaps(m: &TestMapping) -> (Vec<u64>, Vec<u64>) {
    m.inspect(|a| (a.allocated().words().to_vec(), a.tlb_dirty().words().to_vec()))
}

//! Native low-level allocator capability.
//!
//! Page-granularity allocation (contiguous and non-contiguous) takes an
//! explicit [`ReservationCallback`]. Implementations must call
//! [`ReservationCallback::reserve`] before the bytes are committed and
//! [`ReservationCallback::release`] after bytes are given back, including
//! when unwinding a partially performed allocation. If `reserve` fails the
//! allocation fails as a whole and nothing stays reserved.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace};

pub type MachinePageCount = u64;

pub const PAGE_SIZE: u64 = 4096;

/// Run sizes, in pages, that non-contiguous allocations are carved into.
pub const SIZE_CLASSES: [MachinePageCount; 9] = [1, 2, 4, 8, 16, 32, 64, 128, 256];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    Malloc,
    Mmap,
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorKind::Malloc => write!(f, "MALLOC"),
            AllocatorKind::Mmap => write!(f, "MMAP"),
        }
    }
}

/// Accounting hook threaded through a page allocation.
pub trait ReservationCallback {
    /// Called before `bytes` are committed. An error aborts the allocation.
    fn reserve(&self, bytes: u64) -> Result<()>;

    /// Called once `bytes` are no longer held by the allocation.
    fn release(&self, bytes: u64);
}

/// Callback for callers that do no accounting of their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReservation;

impl ReservationCallback for NoopReservation {
    fn reserve(&self, _bytes: u64) -> Result<()> {
        Ok(())
    }

    fn release(&self, _bytes: u64) {}
}

#[derive(Debug)]
pub struct PageRun {
    ptr: NonNull<u8>,
    num_pages: MachinePageCount,
}

impl PageRun {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn num_pages(&self) -> MachinePageCount {
        self.num_pages
    }

    pub fn num_bytes(&self) -> u64 {
        self.num_pages * PAGE_SIZE
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the run owns `num_bytes` bytes starting at `ptr` until it is
        // freed, and the mutable borrow of the run guards exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.num_bytes() as usize) }
    }
}

/// A set of page runs that need not be adjacent.
#[derive(Debug, Default)]
pub struct Allocation {
    runs: Vec<PageRun>,
}

// SAFETY: an Allocation exclusively owns the memory behind its runs.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn num_pages(&self) -> MachinePageCount {
        self.runs.iter().map(|r| r.num_pages).sum()
    }

    pub fn byte_size(&self) -> u64 {
        self.num_pages() * PAGE_SIZE
    }

    pub fn runs(&self) -> &[PageRun] {
        &self.runs
    }

    pub fn runs_mut(&mut self) -> &mut [PageRun] {
        &mut self.runs
    }

    fn take_runs(&mut self) -> Vec<PageRun> {
        std::mem::take(&mut self.runs)
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if !self.runs.is_empty() {
            error!(
                "Allocation dropped with {} pages still allocated",
                self.num_pages()
            );
        }
    }
}

/// A single region of adjacent pages.
#[derive(Debug, Default)]
pub struct ContiguousAllocation {
    region: Option<(NonNull<u8>, MachinePageCount)>,
}

// SAFETY: a ContiguousAllocation exclusively owns its region.
unsafe impl Send for ContiguousAllocation {}
unsafe impl Sync for ContiguousAllocation {}

impl ContiguousAllocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_none()
    }

    pub fn num_pages(&self) -> MachinePageCount {
        self.region.map(|(_, pages)| pages).unwrap_or(0)
    }

    pub fn size(&self) -> u64 {
        self.num_pages() * PAGE_SIZE
    }

    pub fn as_ptr(&self) -> Option<*mut u8> {
        self.region.map(|(ptr, _)| ptr.as_ptr())
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.region {
            // SAFETY: the region is owned by this allocation until freed.
            Some((ptr, pages)) => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), (pages * PAGE_SIZE) as usize)
            },
            None => &mut [],
        }
    }
}

impl Drop for ContiguousAllocation {
    fn drop(&mut self) {
        if self.region.is_some() {
            error!(
                "ContiguousAllocation dropped with {} pages still allocated",
                self.num_pages()
            );
        }
    }
}

/// The allocator a memory pool draws pages and bytes from.
pub trait NativeAllocator: Send + Sync + fmt::Display {
    fn kind(&self) -> AllocatorKind;

    /// Frees whatever `out` holds, then allocates at least `num_pages` pages
    /// into it using runs no smaller than `min_size_class`.
    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation: &dyn ReservationCallback,
        min_size_class: MachinePageCount,
    ) -> Result<()>;

    /// Returns the number of bytes freed. Does not call any reservation hook.
    fn free_non_contiguous(&self, allocation: &mut Allocation) -> u64;

    /// Frees `collateral` and the current contents of `allocation`, then
    /// allocates `num_pages` adjacent pages into `allocation`.
    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        collateral: Option<&mut Allocation>,
        allocation: &mut ContiguousAllocation,
        reservation: &dyn ReservationCallback,
    ) -> Result<()>;

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation);

    fn allocate_bytes(&self, size: u64, alignment: u16) -> Result<NonNull<u8>>;

    /// `ptr` and `size` must match an earlier `allocate_bytes`.
    fn free_bytes(&self, ptr: NonNull<u8>, size: u64);

    fn check_consistency(&self) -> bool;

    fn num_allocated(&self) -> MachinePageCount;

    fn num_mapped(&self) -> MachinePageCount;
}

fn min_class(min_size_class: MachinePageCount) -> MachinePageCount {
    SIZE_CLASSES
        .iter()
        .copied()
        .find(|c| *c >= min_size_class)
        .unwrap_or(SIZE_CLASSES[SIZE_CLASSES.len() - 1])
}

fn next_class(remaining: MachinePageCount, min_class: MachinePageCount) -> MachinePageCount {
    SIZE_CLASSES
        .iter()
        .rev()
        .copied()
        .find(|c| *c <= remaining)
        .unwrap_or(1)
        .max(min_class)
}

/// Size-class runs a page request is carved into, produced lazily so a
/// request is never materialized before it has been reserved.
#[derive(Debug, Clone)]
pub struct RunPlan {
    remaining: MachinePageCount,
    min_class: MachinePageCount,
}

impl Iterator for RunPlan {
    type Item = MachinePageCount;

    fn next(&mut self) -> Option<MachinePageCount> {
        if self.remaining == 0 {
            return None;
        }
        let class = next_class(self.remaining, self.min_class);
        self.remaining = self.remaining.saturating_sub(class);
        Some(class)
    }
}

/// Splits a page request into size-class runs. The last run is rounded up to
/// `min_size_class`, so the plan may cover more pages than requested.
pub fn plan_runs(num_pages: MachinePageCount, min_size_class: MachinePageCount) -> RunPlan {
    RunPlan {
        remaining: num_pages,
        min_class: min_class(min_size_class),
    }
}

/// Pages covered by `plan_runs(num_pages, min_size_class)`, computed without
/// walking the runs. `None` if the total does not fit in a `u64`.
pub fn planned_pages(
    num_pages: MachinePageCount,
    min_size_class: MachinePageCount,
) -> Option<MachinePageCount> {
    let largest = SIZE_CLASSES[SIZE_CLASSES.len() - 1];
    let min_class = min_class(min_size_class);

    // full runs of the largest class are never rounded up
    let full = num_pages / largest * largest;
    let tail: MachinePageCount = plan_runs(num_pages - full, min_class).sum();
    full.checked_add(tail)
}

/// Bytes covered by `num_pages`, or `None` on overflow.
pub fn pages_to_bytes(num_pages: MachinePageCount) -> Option<u64> {
    num_pages.checked_mul(PAGE_SIZE)
}

/// Page allocator backed by the global Rust allocator.
pub struct MallocAllocator {
    capacity: u64,
    allocated_pages: AtomicU64,
    // pages + direct bytes, checked against capacity
    allocated_bytes: AtomicU64,
    small_bytes: AtomicU64,
    small: DashMap<usize, Layout>,
}

impl fmt::Debug for MallocAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MallocAllocator")
            .field("capacity", &self.capacity)
            .field("allocated_pages", &self.allocated_pages.load(Ordering::Relaxed))
            .field("small_bytes", &self.small_bytes.load(Ordering::Relaxed))
            .finish()
    }
}

impl MallocAllocator {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            allocated_pages: AtomicU64::new(0),
            allocated_bytes: AtomicU64::new(0),
            small_bytes: AtomicU64::new(0),
            small: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    fn try_charge(&self, bytes: u64) -> bool {
        self.allocated_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|next| *next <= self.capacity)
            })
            .is_ok()
    }

    fn uncharge(&self, bytes: u64) {
        self.allocated_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn page_layout(num_pages: MachinePageCount) -> Layout {
        // PAGE_SIZE is a power of two and runs are at most 256 pages, or
        // bounded by the caller's request for contiguous regions.
        Layout::from_size_align((num_pages * PAGE_SIZE) as usize, PAGE_SIZE as usize)
            .unwrap_or_else(|_| Layout::new::<u8>())
    }

    fn map_pages(&self, num_pages: MachinePageCount) -> Option<NonNull<u8>> {
        let layout = Self::page_layout(num_pages);
        if layout.size() != (num_pages * PAGE_SIZE) as usize {
            return None;
        }
        // SAFETY: num_pages > 0, so the layout is non-zero sized.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    fn unmap_pages(&self, ptr: NonNull<u8>, num_pages: MachinePageCount) {
        // SAFETY: ptr was returned by map_pages for the same page count.
        unsafe { alloc::dealloc(ptr.as_ptr(), Self::page_layout(num_pages)) };
    }

    fn release_runs(&self, runs: Vec<PageRun>) -> u64 {
        let mut pages = 0;
        for run in runs {
            self.unmap_pages(run.ptr, run.num_pages);
            pages += run.num_pages;
        }
        let bytes = pages * PAGE_SIZE;
        self.allocated_pages.fetch_sub(pages, Ordering::AcqRel);
        self.uncharge(bytes);
        bytes
    }

    fn oversized(&self, num_pages: MachinePageCount) -> Error {
        debug!(num_pages, "page request overflows the byte range");
        self.failure(u64::MAX)
    }

    fn failure(&self, bytes: u64) -> Error {
        Error::AllocationFailed {
            allocator: self.kind().to_string(),
            bytes,
        }
    }
}

impl NativeAllocator for MallocAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Malloc
    }

    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation: &dyn ReservationCallback,
        min_size_class: MachinePageCount,
    ) -> Result<()> {
        if !out.is_empty() {
            let freed = self.free_non_contiguous(out);
            reservation.release(freed);
        }
        if num_pages == 0 {
            return Ok(());
        }

        let bytes = planned_pages(num_pages, min_size_class)
            .and_then(pages_to_bytes)
            .ok_or_else(|| self.oversized(num_pages))?;

        reservation.reserve(bytes)?;

        if !self.try_charge(bytes) {
            debug!(bytes, capacity = self.capacity, "malloc allocator capacity exhausted");
            reservation.release(bytes);
            return Err(self.failure(bytes));
        }

        let mut runs = Vec::new();
        for pages in plan_runs(num_pages, min_size_class) {
            match self.map_pages(pages) {
                Some(ptr) => {
                    self.allocated_pages.fetch_add(pages, Ordering::AcqRel);
                    runs.push(PageRun { ptr, num_pages: pages });
                }
                None => {
                    let mapped = runs.iter().map(|r: &PageRun| r.num_pages).sum::<u64>() * PAGE_SIZE;
                    self.release_runs(runs);
                    self.uncharge(bytes - mapped);
                    reservation.release(bytes);
                    return Err(self.failure(bytes));
                }
            }
        }

        trace!(num_pages, runs = runs.len(), bytes, "non-contiguous allocation");
        out.runs = runs;
        Ok(())
    }

    fn free_non_contiguous(&self, allocation: &mut Allocation) -> u64 {
        let runs = allocation.take_runs();
        self.release_runs(runs)
    }

    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        collateral: Option<&mut Allocation>,
        allocation: &mut ContiguousAllocation,
        reservation: &dyn ReservationCallback,
    ) -> Result<()> {
        let mut freed = 0;
        if let Some(collateral) = collateral {
            freed += self.free_non_contiguous(collateral);
        }
        if !allocation.is_empty() {
            freed += allocation.size();
            self.free_contiguous(allocation);
        }
        if freed > 0 {
            reservation.release(freed);
        }
        if num_pages == 0 {
            return Ok(());
        }

        let bytes = pages_to_bytes(num_pages).ok_or_else(|| self.oversized(num_pages))?;
        reservation.reserve(bytes)?;

        if !self.try_charge(bytes) {
            debug!(bytes, capacity = self.capacity, "malloc allocator capacity exhausted");
            reservation.release(bytes);
            return Err(self.failure(bytes));
        }

        match self.map_pages(num_pages) {
            Some(ptr) => {
                self.allocated_pages.fetch_add(num_pages, Ordering::AcqRel);
                allocation.region = Some((ptr, num_pages));
                trace!(num_pages, bytes, "contiguous allocation");
                Ok(())
            }
            None => {
                self.uncharge(bytes);
                reservation.release(bytes);
                Err(self.failure(bytes))
            }
        }
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) {
        if let Some((ptr, pages)) = allocation.region.take() {
            self.unmap_pages(ptr, pages);
            self.allocated_pages.fetch_sub(pages, Ordering::AcqRel);
            self.uncharge(pages * PAGE_SIZE);
        }
    }

    fn allocate_bytes(&self, size: u64, alignment: u16) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1) as usize, alignment as usize)
            .map_err(|e| Error::InvalidOperation {
                reason: format!("bad layout for {} bytes aligned to {}: {}", size, alignment, e),
            })?;

        if !self.try_charge(size) {
            return Err(self.failure(size));
        }

        // SAFETY: the layout is non-zero sized.
        match NonNull::new(unsafe { alloc::alloc(layout) }) {
            Some(ptr) => {
                self.small.insert(ptr.as_ptr() as usize, layout);
                self.small_bytes.fetch_add(size, Ordering::AcqRel);
                Ok(ptr)
            }
            None => {
                self.uncharge(size);
                Err(self.failure(size))
            }
        }
    }

    fn free_bytes(&self, ptr: NonNull<u8>, size: u64) {
        let addr = ptr.as_ptr() as usize;
        match self.small.remove_if(&addr, |_, layout| layout.size() == size.max(1) as usize) {
            Some((_, layout)) => {
                // SAFETY: removed from the live set, so freed exactly once with
                // the layout it was allocated with.
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                self.small_bytes.fetch_sub(size, Ordering::AcqRel);
                self.uncharge(size);
            }
            None => {
                error!("free_bytes of unknown allocation {:#x} with size {}", addr, size);
                panic!("free_bytes of unknown allocation {:#x} with size {}", addr, size);
            }
        }
    }

    fn check_consistency(&self) -> bool {
        let small: u64 = self
            .small
            .iter()
            .map(|entry| entry.value().size() as u64)
            .sum();
        let pages = self.allocated_pages.load(Ordering::Acquire);
        let small_bytes = self.small_bytes.load(Ordering::Acquire);
        // zero-sized requests occupy one byte of layout but are charged as zero
        small >= small_bytes
            && self.allocated_bytes.load(Ordering::Acquire) == pages * PAGE_SIZE + small_bytes
    }

    fn num_allocated(&self) -> MachinePageCount {
        self.allocated_pages.load(Ordering::Acquire)
    }

    fn num_mapped(&self) -> MachinePageCount {
        self.allocated_pages.load(Ordering::Acquire)
    }
}

impl fmt::Display for MallocAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[MEMORY] {} Allocator: allocated pages {}, mapped pages {}, small bytes {}",
            self.kind(),
            self.num_allocated(),
            self.num_mapped(),
            self.small_bytes.load(Ordering::Relaxed)
        )
    }
}

impl Drop for MallocAllocator {
    fn drop(&mut self) {
        for entry in self.small.iter() {
            // SAFETY: outstanding direct allocations are owned by this allocator.
            unsafe { alloc::dealloc(*entry.key() as *mut u8, *entry.value()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every callback invocation in order.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(bool, u64)>>,
        deny: bool,
    }

    impl ReservationCallback for Recorder {
        fn reserve(&self, bytes: u64) -> Result<()> {
            self.events.lock().push((true, bytes));
            if self.deny {
                return Err(Error::BudgetExhausted {
                    requested: bytes,
                    reserved: 0,
                });
            }
            Ok(())
        }

        fn release(&self, bytes: u64) {
            self.events.lock().push((false, bytes));
        }
    }

    #[test]
    fn test_plan_runs() {
        let plan = |pages, min| plan_runs(pages, min).collect::<Vec<_>>();
        assert_eq!(plan(1, 0), vec![1]);
        assert_eq!(plan(3, 0), vec![2, 1]);
        assert_eq!(plan(300, 0), vec![256, 32, 8, 4]);
        assert_eq!(plan(3, 4), vec![4]);
        assert_eq!(plan(0, 0), Vec::<u64>::new());
    }

    #[test]
    fn test_planned_pages_matches_runs() {
        for (pages, min) in [(0, 0), (1, 0), (3, 4), (300, 0), (300, 16), (1000, 256), (513, 3)] {
            let walked: u64 = plan_runs(pages, min).sum();
            assert_eq!(planned_pages(pages, min), Some(walked));
        }
        assert_eq!(planned_pages(u64::MAX, 256), None);
        assert_eq!(planned_pages(1 << 40, 256), Some(1 << 40));
        assert_eq!(pages_to_bytes(1 << 53), None);
    }

    #[test]
    fn test_non_contiguous_reserves_before_commit() {
        let allocator = MallocAllocator::new(u64::MAX);
        let recorder = Recorder::default();
        let mut allocation = Allocation::new();

        allocator
            .allocate_non_contiguous(5, &mut allocation, &recorder, 0)
            .unwrap();
        assert_eq!(allocation.num_pages(), 5);
        assert_eq!(allocation.num_runs(), 2);
        assert_eq!(allocator.num_allocated(), 5);
        assert_eq!(*recorder.events.lock(), vec![(true, 5 * PAGE_SIZE)]);

        allocation.runs_mut()[0].as_mut_slice().fill(7);

        let freed = allocator.free_non_contiguous(&mut allocation);
        assert_eq!(freed, 5 * PAGE_SIZE);
        assert!(allocation.is_empty());
        assert_eq!(allocator.num_allocated(), 0);
        assert!(allocator.check_consistency());
    }

    #[test]
    fn test_reallocation_releases_previous_contents() {
        let allocator = MallocAllocator::new(u64::MAX);
        let recorder = Recorder::default();
        let mut allocation = Allocation::new();

        allocator.allocate_non_contiguous(2, &mut allocation, &recorder, 0).unwrap();
        allocator.allocate_non_contiguous(1, &mut allocation, &recorder, 0).unwrap();

        assert_eq!(
            *recorder.events.lock(),
            vec![(true, 2 * PAGE_SIZE), (false, 2 * PAGE_SIZE), (true, PAGE_SIZE)]
        );
        allocator.free_non_contiguous(&mut allocation);
    }

    #[test]
    fn test_denied_reservation_allocates_nothing() {
        let allocator = MallocAllocator::new(u64::MAX);
        let recorder = Recorder {
            deny: true,
            ..Default::default()
        };
        let mut allocation = Allocation::new();

        let err = allocator
            .allocate_non_contiguous(4, &mut allocation, &recorder, 0)
            .unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted { .. }));
        assert!(allocation.is_empty());
        assert_eq!(allocator.num_allocated(), 0);
    }

    #[test]
    fn test_capacity_failure_unwinds_reservation() {
        let allocator = MallocAllocator::new(2 * PAGE_SIZE);
        let recorder = Recorder::default();
        let mut allocation = ContiguousAllocation::new();

        let err = allocator
            .allocate_contiguous(4, None, &mut allocation, &recorder)
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            *recorder.events.lock(),
            vec![(true, 4 * PAGE_SIZE), (false, 4 * PAGE_SIZE)]
        );
        assert!(allocation.is_empty());
    }

    #[test]
    fn test_contiguous_frees_collateral() {
        let allocator = MallocAllocator::new(u64::MAX);
        let recorder = Recorder::default();
        let mut collateral = Allocation::new();
        let mut contiguous = ContiguousAllocation::new();

        allocator.allocate_non_contiguous(3, &mut collateral, &recorder, 0).unwrap();
        allocator
            .allocate_contiguous(2, Some(&mut collateral), &mut contiguous, &recorder)
            .unwrap();

        assert!(collateral.is_empty());
        assert_eq!(contiguous.size(), 2 * PAGE_SIZE);
        assert_eq!(allocator.num_allocated(), 2);
        contiguous.as_mut_slice()[0] = 1;

        allocator.free_contiguous(&mut contiguous);
        assert!(contiguous.is_empty());
        assert_eq!(allocator.num_allocated(), 0);
    }

    #[test]
    fn test_direct_bytes() {
        let allocator = MallocAllocator::new(u64::MAX);
        let ptr = allocator.allocate_bytes(100, 64).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        assert_eq!(allocator.allocated_bytes(), 100);
        assert!(allocator.check_consistency());

        allocator.free_bytes(ptr, 100);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "free_bytes of unknown allocation")]
    fn test_free_bytes_size_mismatch_is_fatal() {
        let allocator = MallocAllocator::new(u64::MAX);
        let ptr = allocator.allocate_bytes(64, 16).unwrap();
        allocator.free_bytes(ptr, 32);
    }

    #[test]
    fn test_oversized_requests_fail_before_reserving() {
        let allocator = MallocAllocator::new(u64::MAX);
        let recorder = Recorder::default();

        let mut contiguous = ContiguousAllocation::new();
        let err = allocator
            .allocate_contiguous(1 << 53, None, &mut contiguous, &recorder)
            .unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { .. }));
        assert!(err.is_recoverable());

        let mut allocation = Allocation::new();
        let err = allocator
            .allocate_non_contiguous(u64::MAX, &mut allocation, &recorder, 0)
            .unwrap_err();
        assert!(err.is_recoverable());

        assert!(recorder.events.lock().is_empty());
        assert!(contiguous.is_empty());
        assert!(allocation.is_empty());
        assert_eq!(allocator.num_allocated(), 0);
    }

    #[test]
    fn test_huge_request_is_denied_by_reservation_not_planned() {
        let allocator = MallocAllocator::new(u64::MAX);
        let recorder = Recorder {
            deny: true,
            ..Default::default()
        };
        let mut allocation = Allocation::new();

        let err = allocator
            .allocate_non_contiguous(1 << 40, &mut allocation, &recorder, 256)
            .unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted { .. }));
        assert_eq!(*recorder.events.lock(), vec![(true, (1u64 << 40) * PAGE_SIZE)]);
        assert!(allocation.is_empty());
    }

    #[test]
    fn test_display() {
        let allocator = MallocAllocator::new(u64::MAX);
        assert!(allocator.to_string().starts_with("[MEMORY] MALLOC Allocator"));
    }
}

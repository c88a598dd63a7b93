//! Allocator adapter that keeps the host ledger in step with the native
//! allocator.
//!
//! Every page-level byte the native allocator commits through a
//! [`BridgeAllocator`] is reserved on the host first, and every byte it gives
//! back is unreserved after it has been freed. Direct byte allocations skip
//! the native allocator and go straight to the host's aligned allocator.

use crate::error::{Error, Result};
use crate::host::HostAllocator;
use crate::native::{
    AllocatorKind, Allocation, ContiguousAllocation, MachinePageCount, NativeAllocator,
    ReservationCallback,
};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Reservation callback that charges the host before the caller's own
/// callback, and refunds the host if the caller's callback refuses.
pub struct HostReservation<'a> {
    host: &'a dyn HostAllocator,
    inner: &'a dyn ReservationCallback,
}

impl<'a> HostReservation<'a> {
    pub fn new(host: &'a dyn HostAllocator, inner: &'a dyn ReservationCallback) -> Self {
        Self { host, inner }
    }
}

impl ReservationCallback for HostReservation<'_> {
    fn reserve(&self, bytes: u64) -> Result<()> {
        if !self.host.reserve_bytes(bytes) {
            warn!(bytes, reserved = self.host.reserved_bytes(), "host denied reservation");
            return Err(Error::BudgetExhausted {
                requested: bytes,
                reserved: self.host.reserved_bytes(),
            });
        }

        if let Err(e) = self.inner.reserve(bytes) {
            unreserve_or_abort(self.host, bytes);
            return Err(e);
        }
        Ok(())
    }

    fn release(&self, bytes: u64) {
        self.inner.release(bytes);
        unreserve_or_abort(self.host, bytes);
    }
}

fn unreserve_or_abort(host: &dyn HostAllocator, bytes: u64) {
    if !host.unreserve_bytes(bytes) {
        error!(bytes, reserved = host.reserved_bytes(), "host refused to unreserve bytes");
        panic!(
            "host refused to unreserve {} bytes ({} reserved)",
            bytes,
            host.reserved_bytes()
        );
    }
}

/// Wraps a host allocator and a native allocator into a single
/// [`NativeAllocator`]. One instance is shared by a whole pool subtree.
pub struct BridgeAllocator {
    host: Arc<dyn HostAllocator>,
    native: Arc<dyn NativeAllocator>,
}

impl fmt::Debug for BridgeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeAllocator")
            .field("host", &self.host)
            .field("native", &self.native.kind())
            .finish()
    }
}

impl BridgeAllocator {
    pub fn new(host: Arc<dyn HostAllocator>, native: Arc<dyn NativeAllocator>) -> Self {
        Self { host, native }
    }

    pub fn host(&self) -> &Arc<dyn HostAllocator> {
        &self.host
    }

    pub fn native(&self) -> &Arc<dyn NativeAllocator> {
        &self.native
    }
}

impl NativeAllocator for BridgeAllocator {
    fn kind(&self) -> AllocatorKind {
        self.native.kind()
    }

    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation: &dyn ReservationCallback,
        min_size_class: MachinePageCount,
    ) -> Result<()> {
        let bridged = HostReservation::new(self.host.as_ref(), reservation);
        self.native
            .allocate_non_contiguous(num_pages, out, &bridged, min_size_class)
    }

    fn free_non_contiguous(&self, allocation: &mut Allocation) -> u64 {
        let freed = self.native.free_non_contiguous(allocation);
        unreserve_or_abort(self.host.as_ref(), freed);
        trace!(freed, "non-contiguous free unreserved on host");
        freed
    }

    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        collateral: Option<&mut Allocation>,
        allocation: &mut ContiguousAllocation,
        reservation: &dyn ReservationCallback,
    ) -> Result<()> {
        let bridged = HostReservation::new(self.host.as_ref(), reservation);
        self.native
            .allocate_contiguous(num_pages, collateral, allocation, &bridged)
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) {
        let bytes = allocation.size();
        self.native.free_contiguous(allocation);
        unreserve_or_abort(self.host.as_ref(), bytes);
        trace!(bytes, "contiguous free unreserved on host");
    }

    // TODO: route direct bytes through page-level reservation once the host
    // ledger can tell metadata allocations apart from data buffers.
    fn allocate_bytes(&self, size: u64, alignment: u16) -> Result<NonNull<u8>> {
        self.host.allocate_aligned(alignment, size).ok_or_else(|| {
            error!(size, alignment, "host aligned allocation failed");
            Error::HostAllocationFailed { size, alignment }
        })
    }

    fn free_bytes(&self, ptr: NonNull<u8>, size: u64) {
        if !self.host.free(ptr, size) {
            error!(size, "host free rejected pointer");
            panic!("host free rejected {:p} with size {}", ptr.as_ptr(), size);
        }
    }

    fn check_consistency(&self) -> bool {
        self.native.check_consistency()
    }

    fn num_allocated(&self) -> MachinePageCount {
        self.native.num_allocated()
    }

    fn num_mapped(&self) -> MachinePageCount {
        self.native.num_mapped()
    }
}

impl fmt::Display for BridgeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.native, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BudgetHostAllocator;
    use crate::native::{MallocAllocator, NoopReservation, PAGE_SIZE};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn bridge(budget: u64) -> (Arc<BudgetHostAllocator>, Arc<MallocAllocator>, BridgeAllocator) {
        let host = Arc::new(BudgetHostAllocator::with_budget(budget));
        let native = Arc::new(MallocAllocator::new(u64::MAX));
        let adapter = BridgeAllocator::new(host.clone(), native.clone());
        (host, native, adapter)
    }

    struct Counting(AtomicU64);

    impl ReservationCallback for Counting {
        fn reserve(&self, bytes: u64) -> Result<()> {
            self.0.fetch_add(bytes, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self, bytes: u64) {
            self.0.fetch_sub(bytes, Ordering::SeqCst);
        }
    }

    struct Refusing;

    impl ReservationCallback for Refusing {
        fn reserve(&self, bytes: u64) -> Result<()> {
            Err(Error::CapacityExceeded {
                pool: "test".to_string(),
                requested: bytes,
                capacity: 0,
            })
        }

        fn release(&self, _bytes: u64) {}
    }

    #[test]
    fn test_non_contiguous_pairs_reserve_and_unreserve() {
        let (host, native, adapter) = bridge(16 * PAGE_SIZE);
        let counting = Counting(AtomicU64::new(0));
        let mut allocation = Allocation::new();

        adapter
            .allocate_non_contiguous(3, &mut allocation, &counting, 0)
            .unwrap();
        assert_eq!(host.reserved_bytes(), 3 * PAGE_SIZE);
        assert_eq!(counting.0.load(Ordering::SeqCst), 3 * PAGE_SIZE);
        assert_eq!(adapter.num_allocated(), native.num_allocated());

        let freed = adapter.free_non_contiguous(&mut allocation);
        assert_eq!(freed, 3 * PAGE_SIZE);
        assert_eq!(host.reserved_bytes(), 0);
    }

    #[test]
    fn test_budget_denial_fails_whole_allocation() {
        let (host, native, adapter) = bridge(2 * PAGE_SIZE);
        let mut allocation = Allocation::new();

        let err = adapter
            .allocate_non_contiguous(4, &mut allocation, &NoopReservation, 0)
            .unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted { .. }));
        assert!(err.is_recoverable());
        assert!(allocation.is_empty());
        assert_eq!(host.reserved_bytes(), 0);
        assert_eq!(native.num_allocated(), 0);
    }

    #[test]
    fn test_inner_refusal_refunds_host() {
        let (host, _native, adapter) = bridge(u64::MAX);
        let mut contiguous = ContiguousAllocation::new();

        let err = adapter
            .allocate_contiguous(2, None, &mut contiguous, &Refusing)
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
        assert_eq!(host.reserved_bytes(), 0);
    }

    #[test]
    fn test_contiguous_round_trip() {
        let (host, _native, adapter) = bridge(u64::MAX);
        let mut contiguous = ContiguousAllocation::new();

        adapter
            .allocate_contiguous(2, None, &mut contiguous, &NoopReservation)
            .unwrap();
        assert_eq!(host.reserved_bytes(), 2 * PAGE_SIZE);

        adapter.free_contiguous(&mut contiguous);
        assert_eq!(host.reserved_bytes(), 0);
    }

    #[test]
    fn test_direct_bytes_go_to_host() {
        let (host, native, adapter) = bridge(8192);

        let ptr = adapter.allocate_bytes(4096, 16).unwrap();
        assert_eq!(host.reserved_bytes(), 4096);
        assert_eq!(native.allocated_bytes(), 0);

        let err = adapter.allocate_bytes(8192, 16).unwrap_err();
        assert!(matches!(err, Error::HostAllocationFailed { .. }));
        assert!(!err.is_recoverable());

        adapter.free_bytes(ptr, 4096);
        assert_eq!(host.reserved_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "host free rejected")]
    fn test_mismatched_free_bytes_is_fatal() {
        let (_host, _native, adapter) = bridge(u64::MAX);
        let ptr = adapter.allocate_bytes(128, 16).unwrap();
        adapter.free_bytes(ptr, 64);
    }

    #[test]
    fn test_introspection_delegates() {
        let (_host, native, adapter) = bridge(u64::MAX);
        assert_eq!(adapter.kind(), AllocatorKind::Malloc);
        assert_eq!(adapter.to_string(), native.to_string());
        assert!(adapter.check_consistency());
        assert_eq!(adapter.num_mapped(), 0);
    }
}

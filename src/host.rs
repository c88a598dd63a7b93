//! Host-side allocator capability.
//!
//! The host engine limits memory per task through an opaque reservation
//! ledger. The bridge only ever talks to it through [`HostAllocator`].

use dashmap::DashMap;
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Reservation ledger plus aligned allocation, owned by the host engine.
///
/// All methods must be safe to call concurrently. `reserve_bytes` returning
/// `false` means "insufficient budget" and is not an error on its own.
pub trait HostAllocator: Send + Sync + fmt::Debug {
    fn reserve_bytes(&self, bytes: u64) -> bool;

    fn unreserve_bytes(&self, bytes: u64) -> bool;

    fn allocate_aligned(&self, alignment: u16, size: u64) -> Option<NonNull<u8>>;

    /// `size` must be the size passed to the matching `allocate_aligned`.
    fn free(&self, ptr: NonNull<u8>, size: u64) -> bool;

    fn reserved_bytes(&self) -> u64;
}

/// A host ledger with an optional byte budget.
///
/// Aligned allocations are charged to the same ledger as explicit
/// reservations, so `reserved_bytes` covers both.
pub struct BudgetHostAllocator {
    budget: Option<u64>,
    reserved: AtomicU64,
    peak: AtomicU64,
    // ptr address -> layout of live aligned allocations
    live: DashMap<usize, Layout>,
}

impl fmt::Debug for BudgetHostAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetHostAllocator")
            .field("budget", &self.budget)
            .field("reserved", &self.reserved.load(Ordering::Relaxed))
            .field("peak", &self.peak.load(Ordering::Relaxed))
            .field("live_allocations", &self.live.len())
            .finish()
    }
}

impl Default for BudgetHostAllocator {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl BudgetHostAllocator {
    pub fn with_budget(budget: u64) -> Self {
        Self {
            budget: Some(budget),
            reserved: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            live: DashMap::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            budget: None,
            reserved: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            live: DashMap::new(),
        }
    }

    pub fn budget(&self) -> Option<u64> {
        self.budget
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    fn update_peak(&self, current: u64) {
        let mut peak = self.peak.load(Ordering::Relaxed);
        while current > peak {
            match self
                .peak
                .compare_exchange_weak(peak, current, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => peak = x,
            }
        }
    }
}

impl HostAllocator for BudgetHostAllocator {
    fn reserve_bytes(&self, bytes: u64) -> bool {
        let limit = self.budget.unwrap_or(u64::MAX);
        let result = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|next| *next <= limit)
            });

        match result {
            Ok(previous) => {
                self.update_peak(previous + bytes);
                trace!(bytes, reserved = previous + bytes, "host reservation granted");
                true
            }
            Err(current) => {
                warn!(
                    "Host reservation denied: {} + {} > {}",
                    current, bytes, limit
                );
                false
            }
        }
    }

    fn unreserve_bytes(&self, bytes: u64) -> bool {
        let result = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(bytes)
            });

        match result {
            Ok(previous) => {
                trace!(bytes, reserved = previous - bytes, "host reservation released");
                true
            }
            Err(current) => {
                warn!("Host unreserve of {} bytes exceeds reserved {}", bytes, current);
                false
            }
        }
    }

    fn allocate_aligned(&self, alignment: u16, size: u64) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1) as usize, alignment as usize).ok()?;
        if !self.reserve_bytes(size) {
            return None;
        }

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => {
                self.live.insert(ptr.as_ptr() as usize, layout);
                debug!(size, alignment, "host aligned allocation");
                Some(ptr)
            }
            None => {
                self.unreserve_bytes(size);
                None
            }
        }
    }

    fn free(&self, ptr: NonNull<u8>, size: u64) -> bool {
        let addr = ptr.as_ptr() as usize;
        let layout = match self.live.remove_if(&addr, |_, layout| layout.size() == size.max(1) as usize) {
            Some((_, layout)) => layout,
            None => {
                warn!("Host free of unknown allocation {:#x} with size {}", addr, size);
                return false;
            }
        };

        // SAFETY: the pointer came from `allocate_aligned` with this layout and
        // was removed from the live set, so it is freed exactly once.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        self.unreserve_bytes(size)
    }

    fn reserved_bytes(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }
}

impl Drop for BudgetHostAllocator {
    fn drop(&mut self) {
        for entry in self.live.iter() {
            // SAFETY: every live entry is an outstanding allocation from this
            // allocator; nobody else can free it once the allocator is gone.
            unsafe { alloc::dealloc(*entry.key() as *mut u8, *entry.value()) };
        }
    }
}

//! Hierarchical memory pools.
//!
//! A pool tree has aggregate pools on the inside and leaf pools at the
//! edges. Leaves allocate; aggregates only sum up what their subtree has
//! reserved. Every reservation is charged from the root down before any
//! memory is committed, and released bottom-up after memory is freed, so the
//! root always sees the whole tree's usage.
//!
//! A pool bound to a [`BridgeAllocator`] hands that adapter to every child it
//! creates afterwards, so the whole subtree draws on one host ledger.

use crate::adapter::BridgeAllocator;
use crate::config::PoolOptions;
use crate::error::{Error, Result};
use crate::manager::MemoryManager;
use crate::native::{
    Allocation, ContiguousAllocation, MachinePageCount, NativeAllocator, ReservationCallback,
};
use crate::reclaimer::MemoryReclaimer;
use crate::registry;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use tracing::{debug, error, info, trace, warn};

/// Predicate installed on a root pool, evaluated whenever its reservation
/// changes.
pub type HighUsageCallback = Box<dyn Fn(&MemoryPool) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolKind {
    Aggregate,
    Leaf,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Aggregate => write!(f, "AGGREGATE"),
            PoolKind::Leaf => write!(f, "LEAF"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryPoolStats {
    pub name: String,
    pub kind: PoolKind,
    pub reserved_bytes: u64,
    pub peak_bytes: u64,
    pub capacity: u64,
    pub num_allocs: u64,
    pub num_frees: u64,
    pub num_children: usize,
}

struct UsageTracker {
    // held around counter updates on thread-safe pools
    lock: Option<Mutex<()>>,
    track_usage: bool,
    reserved: AtomicU64,
    peak: AtomicU64,
    num_allocs: AtomicU64,
    num_frees: AtomicU64,
}

impl UsageTracker {
    fn new(options: &PoolOptions) -> Self {
        Self {
            lock: options.thread_safe.then(|| Mutex::new(())),
            track_usage: options.track_usage,
            reserved: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            num_allocs: AtomicU64::new(0),
            num_frees: AtomicU64::new(0),
        }
    }

    fn guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.as_ref().map(|lock| lock.lock())
    }

    /// Returns the new reservation, or the current one if `limit` would be
    /// exceeded.
    fn try_reserve(&self, bytes: u64, limit: u64) -> std::result::Result<u64, u64> {
        let _guard = self.guard();
        let previous = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|next| *next <= limit)
            })?;
        let reserved = previous + bytes;
        if self.track_usage {
            self.peak.fetch_max(reserved, Ordering::AcqRel);
        }
        Ok(reserved)
    }

    fn release(&self, bytes: u64, pool: &str) -> u64 {
        let _guard = self.guard();
        match self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(bytes)
            }) {
            Ok(previous) => previous - bytes,
            Err(current) => {
                error!(pool, bytes, reserved = current, "release exceeds reservation");
                panic!(
                    "memory pool {} released {} bytes with only {} reserved",
                    pool, bytes, current
                );
            }
        }
    }

    fn record_alloc(&self) {
        if self.track_usage {
            self.num_allocs.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_free(&self) {
        if self.track_usage {
            self.num_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }
}

/// Charges page allocations of a native allocator to a pool.
struct PoolReservation<'a> {
    pool: &'a MemoryPool,
}

impl ReservationCallback for PoolReservation<'_> {
    fn reserve(&self, bytes: u64) -> Result<()> {
        self.pool.reserve(bytes)
    }

    fn release(&self, bytes: u64) {
        self.pool.release(bytes);
    }
}

pub struct MemoryPool {
    name: String,
    kind: PoolKind,
    manager: Arc<MemoryManager>,
    parent: Option<Arc<MemoryPool>>,
    options: PoolOptions,
    reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    allocator: RwLock<Arc<dyn NativeAllocator>>,
    // keeps the adapter alive for every descendant that allocates through it
    shared_allocator: RwLock<Option<Arc<BridgeAllocator>>>,
    children: Mutex<HashMap<String, Weak<MemoryPool>>>,
    usage: UsageTracker,
    high_usage_callback: OnceLock<HighUsageCallback>,
    in_high_usage: AtomicBool,
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("options", &self.options)
            .field("reserved", &self.usage.reserved())
            .field("shared_allocator", &self.shared_allocator.read().is_some())
            .finish()
    }
}

impl MemoryPool {
    pub(crate) fn new(
        parent: Option<Arc<MemoryPool>>,
        name: &str,
        kind: PoolKind,
        manager: Arc<MemoryManager>,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
        options: PoolOptions,
    ) -> Arc<Self> {
        let allocator = manager.allocator();
        manager.pool_created();
        debug!(
            pool = name,
            kind = %kind,
            parent = parent.as_ref().map(|p| p.name.as_str()),
            "memory pool created"
        );

        Arc::new(Self {
            name: name.to_string(),
            kind,
            manager,
            parent,
            options,
            reclaimer,
            allocator: RwLock::new(allocator),
            shared_allocator: RwLock::new(None),
            children: Mutex::new(HashMap::new()),
            usage: UsageTracker::new(&options),
            high_usage_callback: OnceLock::new(),
            in_high_usage: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn alignment(&self) -> u16 {
        self.options.alignment
    }

    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    pub fn parent(&self) -> Option<&Arc<MemoryPool>> {
        self.parent.as_ref()
    }

    pub fn root(&self) -> &MemoryPool {
        let mut pool = self;
        while let Some(parent) = &pool.parent {
            pool = parent;
        }
        pool
    }

    pub fn reclaimer(&self) -> Option<&Arc<dyn MemoryReclaimer>> {
        self.reclaimer.as_ref()
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.usage.reserved()
    }

    pub fn peak_bytes(&self) -> u64 {
        self.usage.peak.load(Ordering::Acquire)
    }

    /// Reservation limit of the tree this pool belongs to.
    pub fn capacity(&self) -> u64 {
        self.root().options.capacity
    }

    /// The allocator this pool allocates through: its bound adapter if any,
    /// otherwise its manager's native allocator.
    pub fn allocator(&self) -> Arc<dyn NativeAllocator> {
        self.allocator.read().clone()
    }

    pub fn shared_allocator(&self) -> Option<Arc<BridgeAllocator>> {
        self.shared_allocator.read().clone()
    }

    pub fn children(&self) -> Vec<Arc<MemoryPool>> {
        self.children
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn child_count(&self) -> usize {
        self.children
            .lock()
            .values()
            .filter(|child| child.strong_count() > 0)
            .count()
    }

    pub fn child(&self, name: &str) -> Option<Arc<MemoryPool>> {
        self.children.lock().get(name).and_then(Weak::upgrade)
    }

    /// Calls `visitor` on each live child until it returns false. The child
    /// registry is not locked while the visitor runs.
    pub fn visit_children<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<MemoryPool>) -> bool,
    {
        for child in self.children() {
            if !visitor(&child) {
                break;
            }
        }
    }

    pub fn add_leaf_child(self: &Arc<Self>, name: &str) -> Result<Arc<MemoryPool>> {
        self.check_pool_management_op("add_leaf_child")?;
        self.add_child(name, PoolKind::Leaf, self.reclaimer.clone())
    }

    /// Creates an aggregate child. Without an explicit reclaimer the child
    /// shares this pool's reclaimer.
    pub fn add_aggregate_child(
        self: &Arc<Self>,
        name: &str,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    ) -> Result<Arc<MemoryPool>> {
        self.check_pool_management_op("add_aggregate_child")?;
        self.add_child(
            name,
            PoolKind::Aggregate,
            reclaimer.or_else(|| self.reclaimer.clone()),
        )
    }

    fn add_child(
        self: &Arc<Self>,
        name: &str,
        kind: PoolKind,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    ) -> Result<Arc<MemoryPool>> {
        if self.child(name).is_some() {
            return Err(Error::PoolExists {
                name: name.to_string(),
            });
        }

        let child = self.gen_child(name, kind, reclaimer);

        let inserted = {
            let mut children = self.children.lock();
            let taken = children
                .get(name)
                .map(|existing| existing.strong_count() > 0)
                .unwrap_or(false);
            if !taken {
                children.insert(name.to_string(), Arc::downgrade(&child));
            }
            !taken
        };

        if !inserted {
            // lost a race for the name; the loser is dropped outside the lock
            drop(child);
            return Err(Error::PoolExists {
                name: name.to_string(),
            });
        }
        Ok(child)
    }

    /// Builds a child against the process-wide default manager with this
    /// pool's options, and binds it to this pool's adapter if there is one.
    fn gen_child(
        self: &Arc<Self>,
        name: &str,
        kind: PoolKind,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    ) -> Arc<MemoryPool> {
        let options = PoolOptions {
            alignment: self.options.alignment,
            track_usage: self.options.track_usage,
            thread_safe: self.options.thread_safe,
            check_usage_leak: self.options.check_usage_leak,
            capacity: u64::MAX,
        };
        let child = MemoryPool::new(
            Some(self.clone()),
            name,
            kind,
            registry::default_memory_manager(),
            reclaimer,
            options,
        );
        if let Some(shared) = self.shared_allocator() {
            child.bind_allocator(shared);
        }
        child
    }

    /// Binds this aggregate pool, and every child created from it afterwards,
    /// to `adapter`.
    pub fn set_allocator_shared(&self, adapter: Arc<BridgeAllocator>) -> Result<()> {
        self.check_pool_management_op("set_allocator_shared")?;
        self.bind_allocator(adapter);
        Ok(())
    }

    fn bind_allocator(&self, adapter: Arc<BridgeAllocator>) {
        let allocator: Arc<dyn NativeAllocator> = adapter.clone();
        *self.allocator.write() = allocator;
        *self.shared_allocator.write() = Some(adapter);
        debug!(pool = %self.name, kind = %self.kind, "allocator adapter bound");
    }

    fn check_pool_management_op(&self, operation: &str) -> Result<()> {
        if self.kind != PoolKind::Aggregate {
            error!(pool = %self.name, operation, "pool management on non-aggregate pool");
            return Err(Error::PoolManagementNotAllowed {
                operation: operation.to_string(),
                pool: self.to_string(),
            });
        }
        Ok(())
    }

    /// Leaves always allocate; aggregates only when bound to an adapter.
    pub fn can_allocate(&self) -> bool {
        self.kind == PoolKind::Leaf || self.shared_allocator.read().is_some()
    }

    fn check_allocation_capable(&self) -> Result<()> {
        if !self.can_allocate() {
            error!(pool = %self.name, "allocation on pure aggregate pool");
            return Err(Error::NotAllocationCapable {
                pool: self.to_string(),
            });
        }
        Ok(())
    }

    pub fn allocate(&self, size: u64) -> Result<NonNull<u8>> {
        self.check_allocation_capable()?;
        self.reserve(size)?;

        match self.allocator().allocate_bytes(size, self.options.alignment) {
            Ok(ptr) => {
                self.usage.record_alloc();
                trace!(pool = %self.name, size, "allocated bytes");
                Ok(ptr)
            }
            Err(e) => {
                self.release(size);
                Err(e)
            }
        }
    }

    pub fn free(&self, ptr: NonNull<u8>, size: u64) {
        self.allocator().free_bytes(ptr, size);
        self.release(size);
        self.usage.record_free();
        trace!(pool = %self.name, size, "freed bytes");
    }

    pub fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        min_size_class: MachinePageCount,
    ) -> Result<()> {
        self.check_allocation_capable()?;
        let reservation = PoolReservation { pool: self };
        self.allocator()
            .allocate_non_contiguous(num_pages, out, &reservation, min_size_class)
            .map_err(|e| {
                debug!(pool = %self.name, num_pages, error = %e, "non-contiguous allocation failed");
                e
            })?;
        self.usage.record_alloc();
        Ok(())
    }

    pub fn free_non_contiguous(&self, allocation: &mut Allocation) {
        let freed = self.allocator().free_non_contiguous(allocation);
        self.release(freed);
        self.usage.record_free();
    }

    pub fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        allocation: &mut ContiguousAllocation,
    ) -> Result<()> {
        self.check_allocation_capable()?;
        let reservation = PoolReservation { pool: self };
        self.allocator()
            .allocate_contiguous(num_pages, None, allocation, &reservation)
            .map_err(|e| {
                debug!(pool = %self.name, num_pages, error = %e, "contiguous allocation failed");
                e
            })?;
        self.usage.record_alloc();
        Ok(())
    }

    pub fn free_contiguous(&self, allocation: &mut ContiguousAllocation) {
        let bytes = allocation.size();
        self.allocator().free_contiguous(allocation);
        self.release(bytes);
        self.usage.record_free();
    }

    /// Charges `bytes` to this pool and all its ancestors. The root enforces
    /// its capacity; nothing is charged anywhere if it refuses.
    pub(crate) fn reserve(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }

        match &self.parent {
            Some(parent) => {
                parent.reserve(bytes)?;
                // children have no capacity of their own
                if let Err(current) = self.usage.try_reserve(bytes, u64::MAX) {
                    parent.release(bytes);
                    return Err(Error::CapacityExceeded {
                        pool: self.name.clone(),
                        requested: bytes,
                        capacity: current,
                    });
                }
            }
            None => {
                let capacity = self.options.capacity;
                if let Err(current) = self.usage.try_reserve(bytes, capacity) {
                    warn!(
                        "Memory pool {} reservation denied: {} + {} > {}",
                        self.name, current, bytes, capacity
                    );
                    return Err(Error::CapacityExceeded {
                        pool: self.name.clone(),
                        requested: bytes,
                        capacity,
                    });
                }
                self.on_usage_change();
            }
        }
        Ok(())
    }

    pub(crate) fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }

        self.usage.release(bytes, &self.name);
        match &self.parent {
            Some(parent) => parent.release(bytes),
            None => self.on_usage_change(),
        }
    }

    /// Installs the high-usage predicate. Only allowed once, on a root pool.
    pub fn set_high_usage_callback(&self, callback: HighUsageCallback) -> Result<()> {
        if self.parent.is_some() {
            return Err(Error::InvalidOperation {
                reason: format!("high usage callback can only be set on a root pool, not {}", self.name),
            });
        }
        self.high_usage_callback
            .set(callback)
            .map_err(|_| Error::InvalidOperation {
                reason: format!("high usage callback already set on {}", self.name),
            })?;
        self.on_usage_change();
        Ok(())
    }

    /// Evaluates the root's high-usage predicate. False if none is installed.
    pub fn high_usage(&self) -> bool {
        let root = self.root();
        root.high_usage_callback
            .get()
            .map(|callback| callback(root))
            .unwrap_or(false)
    }

    fn on_usage_change(&self) {
        let Some(callback) = self.high_usage_callback.get() else {
            return;
        };

        let high = callback(self);
        let was_high = self.in_high_usage.swap(high, Ordering::AcqRel);
        if high && !was_high {
            warn!(pool = %self.name, reserved = self.reserved_bytes(), "memory pool entered high usage");
        } else if !high && was_high {
            info!(pool = %self.name, reserved = self.reserved_bytes(), "memory pool left high usage");
        }
    }

    pub fn reclaimable_bytes(&self) -> Option<u64> {
        self.reclaimer
            .as_ref()
            .and_then(|reclaimer| reclaimer.reclaimable_bytes(self))
    }

    pub fn reclaim(&self, target_bytes: u64) -> u64 {
        match &self.reclaimer {
            Some(reclaimer) => reclaimer.reclaim(self, target_bytes),
            None => 0,
        }
    }

    pub fn stats(&self) -> MemoryPoolStats {
        MemoryPoolStats {
            name: self.name.clone(),
            kind: self.kind,
            reserved_bytes: self.reserved_bytes(),
            peak_bytes: self.peak_bytes(),
            capacity: self.capacity(),
            num_allocs: self.usage.num_allocs.load(Ordering::Relaxed),
            num_frees: self.usage.num_frees.load(Ordering::Relaxed),
            num_children: self.child_count(),
        }
    }
}

impl fmt::Display for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Memory Pool[{} {} {} {} {}]<reserved {} peak {}>",
            self.name,
            self.kind,
            self.allocator.read().kind(),
            if self.options.track_usage { "track-usage" } else { "no-usage-track" },
            if self.options.thread_safe { "thread-safe" } else { "non-thread-safe" },
            self.reserved_bytes(),
            self.peak_bytes()
        )
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let leaked = self.usage.reserved();
        if leaked > 0 {
            // keep the ancestors' ledgers consistent even when we abort below
            if let Some(parent) = &self.parent {
                parent.release(leaked);
            }
        }

        if let Some(parent) = &self.parent {
            let mut children = parent.children.lock();
            let dead = children
                .get(&self.name)
                .map(|child| child.strong_count() == 0)
                .unwrap_or(false);
            if dead {
                children.remove(&self.name);
            }
        }
        self.manager.pool_dropped();

        if leaked > 0 {
            if self.options.check_usage_leak && !thread::panicking() {
                error!(pool = %self.name, leaked, "memory pool destroyed with outstanding reservations");
                panic!("memory pool {} leaked {} reserved bytes", self.name, leaked);
            }
            warn!(pool = %self.name, leaked, "memory pool destroyed with outstanding reservations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerOptions;
    use crate::host::{BudgetHostAllocator, HostAllocator};
    use crate::native::PAGE_SIZE;

    fn root(options: PoolOptions) -> Arc<MemoryPool> {
        let manager = Arc::new(MemoryManager::new(ManagerOptions::default()));
        manager.add_root_pool("test_root", options, None).unwrap()
    }

    #[test]
    fn test_leaf_reservation_propagates_to_root() {
        let root = root(PoolOptions::default());
        let agg = root.add_aggregate_child("agg", None).unwrap();
        let leaf = agg.add_leaf_child("leaf").unwrap();

        let mut allocation = Allocation::new();
        leaf.allocate_non_contiguous(2, &mut allocation, 0).unwrap();
        assert_eq!(leaf.reserved_bytes(), 2 * PAGE_SIZE);
        assert_eq!(agg.reserved_bytes(), 2 * PAGE_SIZE);
        assert_eq!(root.reserved_bytes(), 2 * PAGE_SIZE);

        leaf.free_non_contiguous(&mut allocation);
        assert_eq!(root.reserved_bytes(), 0);
        assert_eq!(leaf.peak_bytes(), 2 * PAGE_SIZE);

        let stats = leaf.stats();
        assert_eq!(stats.num_allocs, 1);
        assert_eq!(stats.num_frees, 1);
    }

    #[test]
    fn test_child_inherits_options() {
        let root = root(PoolOptions {
            alignment: 64,
            thread_safe: false,
            ..Default::default()
        });
        let leaf = root.add_leaf_child("leaf").unwrap();
        assert_eq!(leaf.alignment(), 64);
        assert!(!leaf.options().thread_safe);
        assert_eq!(leaf.options().capacity, u64::MAX);
        assert!(leaf.to_string().contains("non-thread-safe"));
    }

    #[test]
    fn test_duplicate_child_name_rejected() {
        let root = root(PoolOptions::default());
        let first = root.add_leaf_child("dup").unwrap();
        let err = root.add_leaf_child("dup").unwrap_err();
        assert!(matches!(err, Error::PoolExists { .. }));

        drop(first);
        assert_eq!(root.child_count(), 0);
        assert!(root.add_leaf_child("dup").is_ok());
    }

    #[test]
    fn test_leaf_cannot_manage_children() {
        let root = root(PoolOptions::default());
        let leaf = root.add_leaf_child("leaf").unwrap();
        let err = leaf.add_leaf_child("nested").unwrap_err();
        assert!(matches!(err, Error::PoolManagementNotAllowed { .. }));
    }

    #[test]
    fn test_pure_aggregate_rejects_allocation() {
        let root = root(PoolOptions::default());
        let mut allocation = Allocation::new();
        let err = root.allocate_non_contiguous(1, &mut allocation, 0).unwrap_err();
        assert!(matches!(err, Error::NotAllocationCapable { .. }));
        assert!(root.allocate(64).is_err());
        assert_eq!(root.reserved_bytes(), 0);
    }

    #[test]
    fn test_set_allocator_shared_on_leaf_fails() {
        let root = root(PoolOptions::default());
        let leaf = root.add_leaf_child("leaf").unwrap();
        let host: Arc<dyn HostAllocator> = Arc::new(BudgetHostAllocator::unlimited());
        let adapter = Arc::new(BridgeAllocator::new(host, leaf.allocator()));

        let err = leaf.set_allocator_shared(adapter).unwrap_err();
        assert!(matches!(err, Error::PoolManagementNotAllowed { .. }));
        assert!(leaf.shared_allocator().is_none());
    }

    #[test]
    fn test_bound_aggregate_allocates_through_adapter() {
        let root = root(PoolOptions::default());
        let agg = root.add_aggregate_child("wrapped", None).unwrap();
        let host = Arc::new(BudgetHostAllocator::unlimited());
        let adapter = Arc::new(BridgeAllocator::new(host.clone(), agg.allocator()));
        agg.set_allocator_shared(adapter).unwrap();

        assert!(agg.can_allocate());
        let mut contiguous = ContiguousAllocation::new();
        agg.allocate_contiguous(1, &mut contiguous).unwrap();
        assert_eq!(host.reserved_bytes(), PAGE_SIZE);
        assert_eq!(root.reserved_bytes(), PAGE_SIZE);

        agg.free_contiguous(&mut contiguous);
        assert_eq!(host.reserved_bytes(), 0);
    }

    #[test]
    fn test_root_capacity_enforced() {
        let root = root(PoolOptions {
            capacity: 3 * PAGE_SIZE,
            ..Default::default()
        });
        let leaf = root.add_leaf_child("leaf").unwrap();
        let mut allocation = Allocation::new();

        let err = leaf.allocate_non_contiguous(4, &mut allocation, 0).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
        assert!(err.is_recoverable());
        assert_eq!(leaf.reserved_bytes(), 0);
        assert_eq!(root.reserved_bytes(), 0);
        assert_eq!(leaf.capacity(), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_high_usage_callback_only_on_root_once() {
        let root = root(PoolOptions::default());
        let leaf = root.add_leaf_child("leaf").unwrap();

        assert!(leaf
            .set_high_usage_callback(Box::new(|_: &MemoryPool| true))
            .is_err());
        root.set_high_usage_callback(Box::new(|pool: &MemoryPool| pool.reserved_bytes() > 0))
            .unwrap();
        assert!(root
            .set_high_usage_callback(Box::new(|_: &MemoryPool| false))
            .is_err());

        assert!(!leaf.high_usage());
        let ptr = leaf.allocate(128).unwrap();
        assert!(leaf.high_usage());
        leaf.free(ptr, 128);
        assert!(!root.high_usage());
    }

    #[test]
    fn test_leak_on_drop_with_checking_disabled_is_silent() {
        let root = root(PoolOptions {
            check_usage_leak: false,
            ..Default::default()
        });
        let leaf = root.add_leaf_child("leaky").unwrap();
        leaf.reserve(4096).unwrap();
        assert_eq!(root.reserved_bytes(), 4096);

        drop(leaf);
        assert_eq!(root.reserved_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "leaked 4096 reserved bytes")]
    fn test_leak_on_drop_is_fatal() {
        let root = root(PoolOptions::default());
        let leaf = root.add_leaf_child("leaky").unwrap();
        leaf.reserve(4096).unwrap();
        drop(leaf);
    }

    #[test]
    fn test_visit_children_stops_early() {
        let root = root(PoolOptions::default());
        let _a = root.add_leaf_child("a").unwrap();
        let _b = root.add_leaf_child("b").unwrap();

        let mut visited = 0;
        root.visit_children(|_| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);
        assert_eq!(root.children().len(), 2);
    }
}

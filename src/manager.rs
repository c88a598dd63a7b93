use crate::config::{ManagerOptions, PoolOptions};
use crate::error::Result;
use crate::native::{MallocAllocator, NativeAllocator};
use crate::pool::{MemoryPool, PoolKind};
use crate::reclaimer::MemoryReclaimer;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Owns the native allocator that pools draw from unless a subtree is bound
/// to its own allocator adapter.
pub struct MemoryManager {
    options: ManagerOptions,
    allocator: Arc<dyn NativeAllocator>,
    num_pools: AtomicUsize,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("options", &self.options)
            .field("allocator", &self.allocator.kind())
            .field("num_pools", &self.num_pools.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self::with_allocator(options, Arc::new(MallocAllocator::new(options.capacity)))
    }

    pub fn with_allocator(options: ManagerOptions, allocator: Arc<dyn NativeAllocator>) -> Self {
        info!(
            alignment = options.alignment,
            capacity = options.capacity,
            allocator = %allocator.kind(),
            "memory manager created"
        );
        Self {
            options,
            allocator,
            num_pools: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn alignment(&self) -> u16 {
        self.options.alignment
    }

    pub fn allocator(&self) -> Arc<dyn NativeAllocator> {
        self.allocator.clone()
    }

    /// Live pools created against this manager.
    pub fn num_pools(&self) -> usize {
        self.num_pools.load(Ordering::Acquire)
    }

    pub fn add_root_pool(
        self: &Arc<Self>,
        name: &str,
        options: PoolOptions,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    ) -> Result<Arc<MemoryPool>> {
        options.validate()?;
        Ok(MemoryPool::new(
            None,
            name,
            PoolKind::Aggregate,
            self.clone(),
            reclaimer,
            options,
        ))
    }

    pub(crate) fn pool_created(&self) {
        self.num_pools.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn pool_dropped(&self) {
        self.num_pools.fetch_sub(1, Ordering::AcqRel);
    }
}

//! Memory accounting bridge between a host engine's reservation ledger and a
//! hierarchical query-engine memory pool tree.
//!
//! The host tracks memory per task through [`HostAllocator`]. The query
//! engine draws memory from a tree of [`MemoryPool`]s. A [`BridgeAllocator`]
//! bound to an aggregate pool makes every page the subtree commits show up
//! as a reservation on the host, and every page it frees as an
//! unreservation.
//!
//! ```no_run
//! use lightning_pool_bridge::{as_aggregate_pool, BudgetHostAllocator, ContiguousAllocation, HostAllocator};
//! use std::sync::Arc;
//!
//! # fn main() -> lightning_pool_bridge::Result<()> {
//! let host = Arc::new(BudgetHostAllocator::with_budget(64 * 1024 * 1024));
//! let task_pool = as_aggregate_pool(host.clone())?;
//! let operator = task_pool.add_leaf_child("hash_join")?;
//!
//! let mut buffer = ContiguousAllocation::new();
//! operator.allocate_contiguous(16, &mut buffer)?;
//! assert_eq!(host.reserved_bytes(), 16 * 4096);
//! operator.free_contiguous(&mut buffer);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod batch;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod manager;
pub mod native;
pub mod pool;
pub mod reclaimer;
pub mod registry;
pub mod spill;

pub use adapter::{BridgeAllocator, HostReservation};
pub use batch::{BatchIterator, CurrentBatch, NativeBatch, TaskContext};
pub use config::{BridgeConfig, LoggingOptions, ManagerOptions, PoolOptions};
pub use error::{Error, Result};
pub use host::{BudgetHostAllocator, HostAllocator};
pub use manager::MemoryManager;
pub use native::{
    Allocation, AllocatorKind, ContiguousAllocation, MachinePageCount, MallocAllocator,
    NativeAllocator, NoopReservation, ReservationCallback, PAGE_SIZE,
};
pub use pool::{HighUsageCallback, MemoryPool, MemoryPoolStats, PoolKind};
pub use reclaimer::{DefaultReclaimer, MemoryReclaimer};
pub use registry::{
    as_aggregate_pool, default_leaf_pool, default_memory_manager, default_root_pool,
};
pub use spill::SpillTrigger;

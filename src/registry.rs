//! Process-wide pools.
//!
//! The default manager, the default root pool and its default leaf are each
//! built at most once, on first use, and live for the rest of the process.
//! [`as_aggregate_pool`] hangs one adapter-bound aggregate subtree off the
//! default root per host allocator.

use crate::adapter::BridgeAllocator;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::host::HostAllocator;
use crate::manager::MemoryManager;
use crate::pool::{MemoryPool, PoolKind};
use crate::reclaimer::DefaultReclaimer;
use crate::spill::SpillTrigger;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

pub const ROOT_POOL_NAME: &str = "root";
pub const DEFAULT_LEAF_POOL_NAME: &str = "default_leaf";
pub const WRAPPED_ROOT_PREFIX: &str = "wrapped_root";

static CONFIG: OnceLock<BridgeConfig> = OnceLock::new();
static DEFAULT_MANAGER: OnceLock<Arc<MemoryManager>> = OnceLock::new();
static DEFAULT_POOLS: OnceLock<DefaultPools> = OnceLock::new();
static WRAPPED_ROOT_ID: AtomicU32 = AtomicU32::new(0);

struct DefaultPools {
    root: Arc<MemoryPool>,
    leaf: Arc<MemoryPool>,
}

/// Sets the process-wide configuration. Must happen before the first use of
/// any default pool to take effect, and can only happen once.
pub fn initialize(config: BridgeConfig) -> Result<()> {
    config.validate()?;
    CONFIG.set(config).map_err(|_| Error::AlreadyInitialized)?;
    info!("memory pool registry initialized");
    Ok(())
}

/// The process-wide configuration, read from the environment if
/// [`initialize`] was never called.
pub fn config() -> &'static BridgeConfig {
    CONFIG.get_or_init(|| {
        BridgeConfig::from_env().unwrap_or_else(|e| {
            warn!("Invalid memory pool environment configuration, using defaults: {}", e);
            BridgeConfig::default()
        })
    })
}

pub fn default_memory_manager() -> Arc<MemoryManager> {
    DEFAULT_MANAGER
        .get_or_init(|| Arc::new(MemoryManager::new(config().manager)))
        .clone()
}

fn default_pools() -> &'static DefaultPools {
    DEFAULT_POOLS.get_or_init(|| {
        let config = config();
        let root = MemoryPool::new(
            None,
            ROOT_POOL_NAME,
            PoolKind::Aggregate,
            default_memory_manager(),
            Some(DefaultReclaimer::create()),
            config.pool,
        );

        let trigger = SpillTrigger::from_config(config);
        if let Err(e) = trigger.install(&root) {
            error!("Failed to install spill trigger on default root pool: {}", e);
        }

        // a fresh root has no children, so the name cannot be taken
        let leaf = match root.add_leaf_child(DEFAULT_LEAF_POOL_NAME) {
            Ok(leaf) => leaf,
            Err(e) => {
                error!("Failed to create default leaf pool: {}", e);
                panic!("failed to create default leaf pool: {}", e);
            }
        };

        info!(spill_threshold = trigger.threshold(), "default memory pools created");
        DefaultPools { root, leaf }
    })
}

pub fn default_root_pool() -> Arc<MemoryPool> {
    default_pools().root.clone()
}

/// Leaf for allocations with no particular host allocator. It allocates
/// through the default manager and is not charged to any host ledger.
pub fn default_leaf_pool() -> Arc<MemoryPool> {
    default_pools().leaf.clone()
}

/// Creates a uniquely named aggregate child of the default root whose whole
/// subtree is accounted against `host`.
pub fn as_aggregate_pool(host: Arc<dyn HostAllocator>) -> Result<Arc<MemoryPool>> {
    let id = WRAPPED_ROOT_ID.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}{}", WRAPPED_ROOT_PREFIX, id);
    wrap_host_allocator(&default_root_pool(), &name, host)
}

/// Adds aggregate child `name` under `parent` and binds it to a fresh
/// adapter over `host` and the child's own native allocator.
pub fn wrap_host_allocator(
    parent: &Arc<MemoryPool>,
    name: &str,
    host: Arc<dyn HostAllocator>,
) -> Result<Arc<MemoryPool>> {
    let pool = parent.add_aggregate_child(name, Some(DefaultReclaimer::create()))?;
    let native = pool.allocator();
    let adapter = Arc::new(BridgeAllocator::new(host, native));
    pool.set_allocator_shared(adapter)?;
    debug!(pool = name, parent = parent.name(), "host allocator wrapped");
    Ok(pool)
}

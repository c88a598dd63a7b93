//! Reclaimers are attached to pools and asked to free memory under pressure.
//! How a leaf actually frees memory belongs to the operator that owns it.

use crate::pool::{MemoryPool, PoolKind};
use std::sync::Arc;
use tracing::debug;

pub trait MemoryReclaimer: Send + Sync {
    /// Bytes `pool` could give back, or `None` if it cannot reclaim at all.
    fn reclaimable_bytes(&self, pool: &MemoryPool) -> Option<u64>;

    /// Try to free at least `target_bytes` from `pool` (0 means as much as
    /// possible). Returns the number of bytes actually freed.
    fn reclaim(&self, pool: &MemoryPool, target_bytes: u64) -> u64;
}

/// Walks aggregate pools and delegates to each child's own reclaimer,
/// largest reclaimable child first. Leaves have nothing to reclaim.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultReclaimer;

impl DefaultReclaimer {
    pub fn create() -> Arc<dyn MemoryReclaimer> {
        Arc::new(DefaultReclaimer)
    }
}

impl MemoryReclaimer for DefaultReclaimer {
    fn reclaimable_bytes(&self, pool: &MemoryPool) -> Option<u64> {
        if pool.kind() == PoolKind::Leaf {
            return None;
        }

        let mut reclaimable = None;
        pool.visit_children(|child| {
            if let Some(bytes) = child.reclaimable_bytes() {
                reclaimable = Some(reclaimable.unwrap_or(0) + bytes);
            }
            true
        });
        reclaimable
    }

    fn reclaim(&self, pool: &MemoryPool, target_bytes: u64) -> u64 {
        if pool.kind() == PoolKind::Leaf {
            return 0;
        }

        let mut candidates: Vec<(u64, Arc<MemoryPool>)> = pool
            .children()
            .into_iter()
            .filter_map(|child| child.reclaimable_bytes().map(|bytes| (bytes, child)))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut reclaimed = 0;
        for (_, child) in candidates {
            let remaining = if target_bytes == 0 {
                0
            } else {
                target_bytes - reclaimed
            };
            reclaimed += child.reclaim(remaining);
            if target_bytes != 0 && reclaimed >= target_bytes {
                break;
            }
        }

        debug!(pool = pool.name(), target_bytes, reclaimed, "reclaimed memory");
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManagerOptions, PoolOptions};
    use crate::manager::MemoryManager;

    struct Fixed(u64);

    impl MemoryReclaimer for Fixed {
        fn reclaimable_bytes(&self, _pool: &MemoryPool) -> Option<u64> {
            Some(self.0)
        }

        fn reclaim(&self, _pool: &MemoryPool, target_bytes: u64) -> u64 {
            if target_bytes == 0 {
                self.0
            } else {
                target_bytes.min(self.0)
            }
        }
    }

    fn root() -> Arc<MemoryPool> {
        let manager = Arc::new(MemoryManager::new(ManagerOptions::default()));
        manager
            .add_root_pool("root", PoolOptions::default(), Some(DefaultReclaimer::create()))
            .unwrap()
    }

    #[test]
    fn test_leaves_have_nothing_to_reclaim() {
        let root = root();
        let leaf = root.add_leaf_child("leaf").unwrap();
        assert!(leaf.reclaimable_bytes().is_none());
        assert_eq!(leaf.reclaim(1024), 0);
        assert!(root.reclaimable_bytes().is_none());
    }

    #[test]
    fn test_largest_child_reclaimed_first() {
        let root = root();
        let _small = root.add_aggregate_child("small", Some(Arc::new(Fixed(100)))).unwrap();
        let _large = root.add_aggregate_child("large", Some(Arc::new(Fixed(300)))).unwrap();

        assert_eq!(root.reclaimable_bytes(), Some(400));
        assert_eq!(root.reclaim(250), 250);
        assert_eq!(root.reclaim(350), 350);
        assert_eq!(root.reclaim(0), 400);
    }
}

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::pool::MemoryPool;

/// Signals that operators should spill once a root pool's reservation
/// reaches a fixed threshold. It only reports; freeing memory is up to the
/// operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillTrigger {
    threshold: u64,
}

impl SpillTrigger {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.spill_threshold)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn should_spill(&self, reserved_bytes: u64) -> bool {
        reserved_bytes >= self.threshold
    }

    /// Installs the trigger as `root`'s high-usage callback. The threshold is
    /// captured by value and cannot be changed afterwards.
    pub fn install(self, root: &MemoryPool) -> Result<()> {
        root.set_high_usage_callback(Box::new(move |pool: &MemoryPool| {
            self.should_spill(pool.reserved_bytes())
        }))
    }
}

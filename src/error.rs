use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, Serialize)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid alignment {alignment}: must be a power of two between {min} and {max}")]
    InvalidAlignment { alignment: u16, min: u16, max: u16 },

    #[error("Memory pool registry already initialized")]
    AlreadyInitialized,

    #[error("Logging initialization failed: {0}")]
    Logging(String),

    // Budget and capacity failures. Callers may spill and retry.
    #[error("Host budget exhausted: requested {requested} bytes with {reserved} already reserved")]
    BudgetExhausted { requested: u64, reserved: u64 },

    #[error("Memory pool {pool} capacity exceeded: requested {requested} bytes, capacity {capacity}")]
    CapacityExceeded { pool: String, requested: u64, capacity: u64 },

    #[error("Native {allocator} allocator failed to allocate {bytes} bytes")]
    AllocationFailed { allocator: String, bytes: u64 },

    #[error("Host allocator could not allocate {size} bytes aligned to {alignment}")]
    HostAllocationFailed { size: u64, alignment: u16 },

    // Invariant violations: programming errors in the caller.
    #[error("Memory pool {operation} operation is only allowed on aggregation memory pool: {pool}")]
    PoolManagementNotAllowed { operation: String, pool: String },

    #[error("Memory pool {pool} is not allowed to allocate memory")]
    NotAllocationCapable { pool: String },

    #[error("Child memory pool {name} already exists")]
    PoolExists { name: String },

    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("Iterator protocol violation: {0}")]
    IteratorProtocol(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::Io(_) => -1,
            Error::Config(_) => -13,
            Error::InvalidAlignment { .. } => -14,
            Error::AlreadyInitialized => -15,
            Error::Logging(_) => -16,
            Error::BudgetExhausted { .. } => -30,
            Error::CapacityExceeded { .. } => -31,
            Error::AllocationFailed { .. } => -32,
            Error::HostAllocationFailed { .. } => -33,
            Error::PoolManagementNotAllowed { .. } => -40,
            Error::NotAllocationCapable { .. } => -41,
            Error::PoolExists { .. } => -42,
            Error::InvalidOperation { .. } => -43,
            Error::IteratorProtocol(_) => -44,
        }
    }

    /// Whether an operator can react to this failure (spill, retry, fail the
    /// query) instead of treating it as an internal inconsistency.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BudgetExhausted { .. }
                | Error::CapacityExceeded { .. }
                | Error::AllocationFailed { .. }
        )
    }
}

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PinError>;

/// Errors surfaced by the storage contracts and the query engine.
#[derive(Debug, Error)]
pub enum PinError {
    /// Row-level: the PIN does not exist or is not visible.
    #[error("not found")]
    NotFound,
    /// Row-level: the lock manager or ACL check rejected the PIN.
    #[error("no access")]
    NoAccess,
    /// Row-level: the PIN carries a tombstone.
    #[error("pin deleted")]
    Deleted,
    /// Generic resource exhaustion.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(&'static str),
    /// The plan builder exceeded its operator budget.
    #[error("plan exceeds {limit} operators")]
    TooManyOperators {
        /// Configured operator budget.
        limit: usize,
    },
    /// A hash join build side outgrew the dedup store.
    #[error("dedup store exceeds {limit} identities")]
    DedupOverflow {
        /// Configured dedup store capacity.
        limit: usize,
    },
    /// A merge join duplicate-key group outgrew the spill buffer.
    #[error("spill buffer exceeds {limit} records")]
    SpillOverflow {
        /// Configured spill capacity.
        limit: usize,
    },
    /// Values of incompatible types were compared.
    #[error("type mismatch: {0}")]
    TypeMismatch(&'static str),
    /// Storage returned a structurally invalid record.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument or plan shape.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Internal invariant violated.
    #[error("internal error: {0}")]
    Internal(&'static str),
    /// A scan budget was exhausted.
    #[error("timeout")]
    Timeout,
    /// The session requested cancellation.
    #[error("aborted")]
    Aborted,
    /// IO failure while loading configuration or datasets.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration could not be parsed.
    #[error("config: {0}")]
    Config(String),
    /// JSON payload could not be parsed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error taxonomy used by the propagation policy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Absorbed by the operator that detects it; the row is skipped.
    RowLevel,
    /// Out of memory, spill capacity, or plan budget.
    Resource,
    /// Type mismatch, corruption, invariant violation.
    Fatal,
    /// Timeout or abort; reported as "aborted" rather than "corrupted".
    Cancelled,
}

impl PinError {
    /// Classifies the error for propagation decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            PinError::NotFound | PinError::NoAccess | PinError::Deleted => ErrorClass::RowLevel,
            PinError::ResourceLimit(_)
            | PinError::TooManyOperators { .. }
            | PinError::DedupOverflow { .. }
            | PinError::SpillOverflow { .. } => ErrorClass::Resource,
            PinError::Timeout | PinError::Aborted => ErrorClass::Cancelled,
            PinError::TypeMismatch(_)
            | PinError::Corruption(_)
            | PinError::Invalid(_)
            | PinError::Internal(_)
            | PinError::Io(_)
            | PinError::Config(_)
            | PinError::Json(_) => ErrorClass::Fatal,
        }
    }

    /// Returns true for lock/ACL rejections and tombstones.
    pub fn is_row_level(&self) -> bool {
        self.class() == ErrorClass::RowLevel
    }
}

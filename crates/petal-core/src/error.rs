//! Error types for the Petal transaction pool.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("serialization: {0}")] Serialization(String),
    #[error("fee overflow")] FeeOverflow,
    #[error("bvm charge overflow")] ChargeOverflow,
    #[error("empty kernel list")] NoKernels,
    #[error("kernel height ranges do not intersect")] EmptyHeightRange,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("active transaction with conflict key {0} already in pool")] DuplicateConflict(String),
    #[error("stale context: {reason}")] StaleContext { reason: String },
    #[error("merge incompatible: {0}")] MergeIncompatible(String),
    #[error("parent element {0} is not in the pool")] DanglingParent(u64),
    #[error("unknown element: {0}")] UnknownElement(u64),
    #[error("{what} limit exceeded: {value} > {max}")] LimitExceeded { what: &'static str, value: u64, max: u64 },
    #[error("tx error: {0}")] Transaction(#[from] TransactionError),
}

impl PoolError {
    /// Convenience constructor for a failed relay-time re-validation.
    pub fn stale(reason: impl Into<String>) -> Self {
        Self::StaleContext { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_error_display() {
        let errors = vec![
            PoolError::DuplicateConflict("ab".into()),
            PoolError::stale("height advanced"),
            PoolError::MergeIncompatible("shared input".into()),
            PoolError::DanglingParent(7),
            PoolError::UnknownElement(3),
            PoolError::LimitExceeded { what: "depth", value: 33, max: 32 },
            PoolError::Transaction(TransactionError::NoKernels),
        ];
        for e in &errors {
            assert!(!format!("{e}").is_empty());
        }
    }

    #[test]
    fn limit_exceeded_display() {
        let e = PoolError::LimitExceeded { what: "depth", value: 33, max: 32 };
        assert_eq!(e.to_string(), "depth limit exceeded: 33 > 32");
    }

    #[test]
    fn transaction_error_converts() {
        let e: PoolError = TransactionError::FeeOverflow.into();
        assert!(matches!(e, PoolError::Transaction(TransactionError::FeeOverflow)));
    }
}

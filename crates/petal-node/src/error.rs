//! Node-level error types.
use petal_core::error::{PoolError, TransactionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config source: {0}")] Load(#[from] config::ConfigError),
    #[error("invalid {field}: {reason}")] Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// Everything a node operation can fail with.
#[derive(Error, Debug)]
pub enum PetalError {
    #[error(transparent)] Pool(#[from] PoolError),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Config(#[from] ConfigError),
    #[error("pool service stopped")] ServiceStopped,
    #[error("no tokio runtime")] NoRuntime,
}

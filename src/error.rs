//! Error types for the quickstart orchestrator

use thiserror::Error;

use crate::distribute::DistributeError;
use crate::materialize::MaterializeError;
use crate::odb::OdbError;
use crate::pki::PkiError;

/// Main error type for quickstart operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Operational database error (connection, liveness, persistence)
    #[error("ODB error: {0}")]
    Odb(#[from] OdbError),

    /// Certificate authority error
    #[error("PKI error: {0}")]
    Pki(#[from] PkiError),

    /// Component directory or configuration error
    #[error("materialization error: {0}")]
    Materialize(#[from] MaterializeError),

    /// Identity file distribution error
    #[error("distribution error: {0}")]
    Distribute(#[from] DistributeError),

    /// Invalid settings or target directory
    #[error("configuration error: {0}")]
    Config(String),

    /// A step ran without the inputs its requirements should have produced
    #[error("plan error: {0}")]
    Plan(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a plan error with the given message
    pub fn plan(msg: impl Into<String>) -> Self {
        Self::Plan(msg.into())
    }

    /// Whether the failure happened before anything was written anywhere
    pub fn is_liveness(&self) -> bool {
        matches!(self, Error::Odb(OdbError::Liveness { .. }))
    }
}

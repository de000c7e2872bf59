//! Engine error types. Stage failures carry the logs harvested from the
//! failed workload's pods as data, so the orchestrator can attach them to the
//! build status without downcasting.

use std::time::Duration;

use thiserror::Error;

use imagebuilder_core::{CatalogError, GatewayError};
use imagebuilder_storage::StorageError;

/// Terminal failure of one pipeline stage, with the pod logs collected before
/// teardown.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StageError {
    message: String,
    logs: Vec<String>,
}

impl StageError {
    pub fn new(message: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            message: message.into(),
            logs,
        }
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("certificate request failed: {0}")]
    Certificate(String),
    #[error("containerfile generation failed: {0}")]
    Containerfile(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("build deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl EngineError {
    /// Logs carried by the error, when the failing stage harvested any.
    pub fn logs(&self) -> Option<&[String]> {
        match self {
            EngineError::Stage(stage) => Some(stage.logs()),
            _ => None,
        }
    }
}

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::config::{Backend, ConfigError};
use crate::point::{ConversionError, FlatOperation, FlattenedPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    OpenTsdb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::OpenTsdb => write!(f, "opentsdb"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend rejected batch: {status}")]
    Rejected { status: reqwest::StatusCode },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport has no backend configured")]
    NotConfigured,

    #[error("batch holds an item the backend cannot encode: {0}")]
    InvalidItem(#[from] ConversionError),
}

/// A backend-specific sender plugged into a [`Batcher`](crate::Batcher).
///
/// The batcher never calls `transfer` concurrently on the same transport, so
/// implementations may assume one batch at a time.
pub trait Transport: Send + Sync + 'static {
    /// What producers enqueue for this backend.
    type Item: Send + 'static;

    /// Bind backend settings. Called once, before the batcher starts.
    fn configure(&mut self, backend: &Backend) -> Result<(), ConfigError>;

    /// Serialize and deliver one batch. A partial failure is reported as a
    /// single error for the whole batch.
    fn transfer(
        &self,
        batch: Vec<Self::Item>,
    ) -> impl Future<Output = Result<(), TransferError>> + Send + '_;

    fn to_flattened_point(
        &self,
        operation: FlatOperation,
        item: &Self::Item,
    ) -> Result<FlattenedPoint, ConversionError>;

    fn from_flattened_point(&self, point: &FlattenedPoint) -> Result<Self::Item, ConversionError>;

    fn matches(&self, kind: TransportKind) -> bool;
}

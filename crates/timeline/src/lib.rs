//! Outbound point batching.
//!
//! Producers hand single items to a [`Batcher`], which drains its queue on a
//! fixed interval and passes each non-empty batch to a [`Transport`].

pub mod batcher;
pub mod config;
pub mod http;
pub mod opentsdb;
pub mod point;
pub mod transport;

#[cfg(test)]
mod testing;

pub use batcher::{Batcher, BatcherError, EnqueueError};
pub use config::{Backend, ConfigError, TransportConfig};
pub use point::{ConversionError, FlatOperation, FlattenedPoint};
pub use transport::{TransferError, Transport, TransportKind};

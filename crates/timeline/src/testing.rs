use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{Backend, ConfigError, TransportConfig};
use crate::point::{ConversionError, FlatOperation, FlattenedPoint};
use crate::transport::{TransferError, Transport, TransportKind};

#[derive(Default)]
pub struct MockState {
    pub batches: Mutex<Vec<(Instant, Vec<String>)>>,
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub failures_remaining: AtomicUsize,
    pub panic_next: AtomicBool,
}

impl MockState {
    pub fn batches(&self) -> Vec<(Instant, Vec<String>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn items(&self) -> Vec<String> {
        self.batches().into_iter().flat_map(|(_, b)| b).collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Records every batch it receives. Can be made slow, failing, or panicking.
pub struct MockTransport {
    pub delay: Duration,
    pub state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> (Self, Arc<MockState>) {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            Self {
                delay,
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl Transport for MockTransport {
    type Item = String;

    fn configure(&mut self, backend: &Backend) -> Result<(), ConfigError> {
        backend.validate()
    }

    async fn transfer(&self, batch: Vec<String>) -> Result<(), TransferError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);

        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.state.active.fetch_sub(1, Ordering::SeqCst);

        if self.state.panic_next.swap(false, Ordering::SeqCst) {
            panic!("mock transport panicked");
        }

        let failed = self
            .state
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransferError::Timeout(self.delay));
        }

        self.state.batches.lock().unwrap().push((started, batch));
        Ok(())
    }

    fn to_flattened_point(
        &self,
        operation: FlatOperation,
        item: &String,
    ) -> Result<FlattenedPoint, ConversionError> {
        Ok(FlattenedPoint {
            operation,
            metric: item.clone(),
            tags: BTreeMap::new(),
            timestamp: 0,
            value: 0.0,
        })
    }

    fn from_flattened_point(&self, point: &FlattenedPoint) -> Result<String, ConversionError> {
        Ok(point.metric.clone())
    }

    fn matches(&self, _kind: TransportKind) -> bool {
        false
    }
}

pub fn config(interval_ms: u64, buffer_size: Option<usize>) -> TransportConfig {
    TransportConfig {
        transport_buffer_size: buffer_size,
        batch_send_interval: Duration::from_millis(interval_ms),
        ..TransportConfig::default()
    }
}

/// reqwest is built without a default crypto provider.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

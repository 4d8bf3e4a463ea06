use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::{ConfigError, TransportConfig};
use crate::transport::Transport;

const CLOSED_MSG: &str = "enqueue called on a closed batcher";

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("batcher has already been started")]
    AlreadyStarted,
}

#[derive(Debug, Error)]
pub enum EnqueueError<T> {
    /// The bounded queue has no room; the item is handed back.
    #[error("transport buffer is full")]
    Full(T),
}

enum QueueTx<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for QueueTx<T> {
    fn clone(&self) -> Self {
        match self {
            QueueTx::Bounded(tx) => QueueTx::Bounded(tx.clone()),
            QueueTx::Unbounded(tx) => QueueTx::Unbounded(tx.clone()),
        }
    }
}

enum QueueRx<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> QueueRx<T> {
    fn try_recv(&mut self) -> Result<T, TryRecvError> {
        match self {
            QueueRx::Bounded(rx) => rx.try_recv(),
            QueueRx::Unbounded(rx) => rx.try_recv(),
        }
    }
}

fn queue<T>(capacity: Option<usize>) -> (QueueTx<T>, QueueRx<T>) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity);
            (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
        }
    }
}

/// Buffers producer items and periodically hands them to a [`Transport`].
///
/// Producers call [`enqueue`](Self::enqueue) or
/// [`try_enqueue`](Self::try_enqueue); a single background task started by
/// [`start`](Self::start) drains the queue every `batch_send_interval` and
/// transfers whatever it found. While a transfer is running, timer ticks are
/// skipped rather than queued, so the transport never sees two batches at once.
///
/// The in-flight flag is set by the drain loop and cleared by the transfer
/// task it spawns, when that task ends (normally or by panic). A cycle that
/// drains nothing clears the flag itself.
///
/// [`close`](Self::close) stops intake. The drain loop delivers what is left
/// on its next tick and exits. Enqueuing after `close` panics.
///
/// The std mutexes are never held across `.await`.
pub struct Batcher<T: Transport> {
    transport: Arc<T>,
    batch_send_interval: Duration,
    tx: Mutex<Option<QueueTx<T::Item>>>,
    rx: Mutex<Option<QueueRx<T::Item>>>,
    in_flight: Arc<AtomicBool>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Batcher<T> {
    /// Validate `config` and build a stopped batcher around `transport`.
    pub fn new(transport: T, config: &TransportConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (tx, rx) = queue(config.transport_buffer_size);
        Ok(Self {
            transport: Arc::new(transport),
            batch_send_interval: config.batch_send_interval,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            in_flight: Arc::new(AtomicBool::new(false)),
            drain_task: Mutex::new(None),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Queue one item, waiting for room if the queue is bounded and full.
    ///
    /// # Panics
    /// If the batcher has been closed.
    pub async fn enqueue(&self, item: T::Item) {
        let sent = match self.sender() {
            QueueTx::Bounded(tx) => tx.send(item).await.is_ok(),
            QueueTx::Unbounded(tx) => tx.send(item).is_ok(),
        };
        if !sent {
            panic!("{CLOSED_MSG}");
        }
    }

    /// Queue one item without waiting. A full bounded queue hands the item
    /// back in [`EnqueueError::Full`] so the caller can drop or retry it.
    ///
    /// # Panics
    /// If the batcher has been closed.
    pub fn try_enqueue(&self, item: T::Item) -> Result<(), EnqueueError<T::Item>> {
        match self.sender() {
            QueueTx::Bounded(tx) => match tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(item)) => Err(EnqueueError::Full(item)),
                Err(TrySendError::Closed(_)) => panic!("{CLOSED_MSG}"),
            },
            QueueTx::Unbounded(tx) => {
                if tx.send(item).is_err() {
                    panic!("{CLOSED_MSG}");
                }
                Ok(())
            }
        }
    }

    fn sender(&self) -> QueueTx<T::Item> {
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.clone(),
            None => panic!("{CLOSED_MSG}"),
        }
    }

    /// Spawn the drain loop and return immediately. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), BatcherError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or(BatcherError::AlreadyStarted)?;

        info!(interval = ?self.batch_send_interval, "starting batcher...");

        let drain_loop = DrainLoop {
            transport: Arc::clone(&self.transport),
            rx,
            in_flight: Arc::clone(&self.in_flight),
            transfer_task: None,
        };
        let first_tick = Instant::now() + self.batch_send_interval;
        let handle = tokio::spawn(drain_loop.run(first_tick, self.batch_send_interval));
        *self.drain_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop accepting items. Items already queued are delivered by the next
    /// drain cycle, after which the loop exits.
    pub fn close(&self) {
        info!("closing batcher...");
        self.tx.lock().unwrap().take();
    }

    /// Wait for the drain loop, including its final transfer, to finish.
    ///
    /// Returns immediately if the loop was never started. Never returns if
    /// the batcher is still open.
    pub async fn wait_closed(&self) {
        let handle = self.drain_task.lock().unwrap().take();
        if let Some(h) = handle
            && let Err(e) = h.await
        {
            error!(error = %e, "drain loop task panicked");
        }
    }
}

/// Clears the in-flight flag when the transfer task ends, including by panic.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct DrainLoop<T: Transport> {
    transport: Arc<T>,
    rx: QueueRx<T::Item>,
    in_flight: Arc<AtomicBool>,
    transfer_task: Option<JoinHandle<()>>,
}

impl<T: Transport> DrainLoop<T> {
    async fn run(mut self, first_tick: Instant, period: Duration) {
        debug!("initializing transfer data loop...");

        let mut ticker = time::interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.cycle().is_break() {
                break;
            }
        }

        // The final cycle spawned its transfer after winning the flag, so this
        // is the only transfer that can still be running.
        if let Some(handle) = self.transfer_task.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "transfer task panicked");
        }

        info!("transfer data loop finished");
    }

    /// One timer tick. Breaks once the queue is closed and fully drained.
    fn cycle(&mut self) -> ControlFlow<()> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("another data transfer is in progress, skipping...");
            return ControlFlow::Continue(());
        }

        let (batch, closed) = self.drain();

        if batch.is_empty() {
            debug!("buffer is empty, no data will be sent");
            self.in_flight.store(false, Ordering::Release);
        } else {
            self.spawn_transfer(batch);
        }

        if closed {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Take everything currently queued. The flag is `true` when the queue
    /// was closed and nothing more will ever arrive.
    fn drain(&mut self) -> (Vec<T::Item>, bool) {
        let mut batch = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(TryRecvError::Empty) => return (batch, false),
                Err(TryRecvError::Disconnected) => {
                    info!(count = batch.len(), "buffer closed, draining remaining points");
                    return (batch, true);
                }
            }
        }
    }

    fn spawn_transfer(&mut self, batch: Vec<T::Item>) {
        // Surface a panic from the previous transfer before dropping its handle.
        if let Some(mut handle) = self.transfer_task.take() {
            let waker = Waker::noop();
            let mut cx = Context::from_waker(waker);
            if let Poll::Ready(Err(e)) = Pin::new(&mut handle).poll(&mut cx) {
                error!(error = %e, "transfer task panicked");
            }
        }

        let transport = Arc::clone(&self.transport);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        self.transfer_task = Some(tokio::spawn(async move {
            let _guard = guard;
            let count = batch.len();
            info!(count, "sending a batch of points...");
            match transport.transfer(batch).await {
                Ok(()) => info!(count, "batch of points sent"),
                Err(e) => error!(error = %e, count, "batch transfer failed, points discarded"),
            }
        }));
    }
}

#[cfg(test)]
mod tests;

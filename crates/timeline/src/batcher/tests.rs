use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::{self, Instant};

use super::*;
use crate::testing::{MockTransport, config};

fn items(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn ms_since(start: Instant, at: Instant) -> u128 {
    (at - start).as_millis()
}

#[tokio::test(start_paused = true)]
async fn delivers_queued_items_one_interval_after_start() {
    let (transport, state) = MockTransport::new();
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    let start = Instant::now();
    batcher.start().unwrap();

    for item in ["A", "B", "C"] {
        batcher.enqueue(item.to_owned()).await;
    }

    time::sleep(Duration::from_millis(55)).await;

    let batches = state.batches();
    assert_eq!(batches.len(), 1, "expected exactly one transfer");
    assert_eq!(batches[0].1, items(&["A", "B", "C"]));
    assert_eq!(ms_since(start, batches[0].0), 10);

    batcher.close();
    batcher.wait_closed().await;
    assert_eq!(state.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_transfer_skips_overlapping_cycle() {
    let (transport, state) = MockTransport::with_delay(Duration::from_millis(15));
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    let start = Instant::now();
    batcher.start().unwrap();

    batcher.enqueue("A".into()).await;

    // The t=10ms transfer runs until t=25ms, so D arrives mid-transfer.
    time::sleep_until(start + Duration::from_millis(15)).await;
    batcher.enqueue("D".into()).await;

    time::sleep_until(start + Duration::from_millis(60)).await;

    let batches = state.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].1, items(&["A"]));
    assert_eq!(ms_since(start, batches[0].0), 10);
    assert_eq!(batches[1].1, items(&["D"]));
    assert_eq!(
        ms_since(start, batches[1].0),
        30,
        "the t=20ms cycle must be skipped while the first transfer is in flight"
    );
    assert_eq!(state.max_active(), 1);

    batcher.close();
    batcher.wait_closed().await;
}

#[tokio::test(start_paused = true)]
async fn close_drains_remaining_items_once_then_terminates() {
    let (transport, state) = MockTransport::new();
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    batcher.start().unwrap();

    batcher.enqueue("X".into()).await;
    batcher.enqueue("Y".into()).await;
    batcher.close();

    batcher.wait_closed().await;

    let batches = state.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].1, items(&["X", "Y"]));

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.calls(), 1, "no cycles may run after termination");
}

#[tokio::test(start_paused = true)]
async fn close_waits_for_in_flight_transfer_before_final_drain() {
    let (transport, state) = MockTransport::with_delay(Duration::from_millis(25));
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    batcher.start().unwrap();

    batcher.enqueue("first".into()).await;
    time::sleep(Duration::from_millis(12)).await;

    batcher.enqueue("last".into()).await;
    batcher.close();
    batcher.wait_closed().await;

    assert_eq!(state.items(), items(&["first", "last"]));
    assert_eq!(state.calls(), 2);
    assert_eq!(state.max_active(), 1);
}

#[tokio::test]
#[should_panic(expected = "closed batcher")]
async fn try_enqueue_after_close_panics() {
    let (transport, _state) = MockTransport::new();
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    batcher.close();
    let _ = batcher.try_enqueue("late".into());
}

#[tokio::test]
#[should_panic(expected = "closed batcher")]
async fn enqueue_after_close_panics() {
    let (transport, _state) = MockTransport::new();
    let batcher = Batcher::new(transport, &config(10, Some(4))).unwrap();
    batcher.start().unwrap();
    batcher.close();
    batcher.enqueue("late".into()).await;
}

#[tokio::test(start_paused = true)]
async fn empty_cycles_never_call_transfer() {
    let (transport, state) = MockTransport::new();
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    batcher.start().unwrap();

    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state.calls(), 0);

    batcher.close();
    batcher.wait_closed().await;
    assert_eq!(state.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_transfer_discards_batch_and_keeps_running() {
    let (transport, state) = MockTransport::new();
    state.failures_remaining.store(1, Ordering::SeqCst);
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    batcher.start().unwrap();

    batcher.enqueue("lost".into()).await;
    time::sleep(Duration::from_millis(15)).await;

    batcher.enqueue("kept".into()).await;
    time::sleep(Duration::from_millis(10)).await;

    batcher.close();
    batcher.wait_closed().await;

    assert_eq!(state.calls(), 2);
    assert_eq!(state.items(), items(&["kept"]), "failed batch must not be retried");
}

#[tokio::test(start_paused = true)]
async fn panicking_transfer_releases_in_flight_flag() {
    let (transport, state) = MockTransport::new();
    state.panic_next.store(true, Ordering::SeqCst);
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    batcher.start().unwrap();

    batcher.enqueue("boom".into()).await;
    time::sleep(Duration::from_millis(15)).await;

    batcher.enqueue("after".into()).await;
    time::sleep(Duration::from_millis(10)).await;

    batcher.close();
    batcher.wait_closed().await;

    assert_eq!(state.items(), items(&["after"]));
}

#[tokio::test(start_paused = true)]
async fn start_twice_is_rejected() {
    let (transport, _state) = MockTransport::new();
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    batcher.start().unwrap();
    assert!(matches!(
        batcher.start().unwrap_err(),
        BatcherError::AlreadyStarted
    ));
    batcher.close();
    batcher.wait_closed().await;
}

#[tokio::test(start_paused = true)]
async fn sub_millisecond_interval_still_drains() {
    let (transport, state) = MockTransport::new();
    let config = TransportConfig {
        batch_send_interval: Duration::from_micros(500),
        ..config(10, None)
    };
    let batcher = Batcher::new(transport, &config).unwrap();
    let start = Instant::now();
    batcher.start().unwrap();

    batcher.enqueue("fast".into()).await;
    time::sleep(Duration::from_millis(2)).await;

    let batches = state.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0 - start, Duration::from_micros(500));

    batcher.close();
    batcher.wait_closed().await;
}

#[tokio::test(start_paused = true)]
async fn in_flight_flag_clear_belongs_to_transfer_task() {
    let (transport, state) = MockTransport::with_delay(Duration::from_millis(50));
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    batcher.start().unwrap();

    batcher.enqueue("slow".into()).await;
    time::sleep(Duration::from_millis(25)).await;
    assert_eq!(state.calls(), 1);
    assert!(batcher.in_flight.load(Ordering::Acquire));

    batcher.close();
    batcher.wait_closed().await;
    assert!(!batcher.in_flight.load(Ordering::Acquire));
}

#[tokio::test]
async fn wait_closed_without_start_returns() {
    let (transport, _state) = MockTransport::new();
    let batcher = Batcher::new(transport, &config(10, None)).unwrap();
    batcher.close();
    batcher.wait_closed().await;
}

#[test]
fn new_rejects_invalid_config() {
    let (transport, _state) = MockTransport::new();
    let result = Batcher::new(transport, &config(0, None));
    assert!(matches!(
        result.err(),
        Some(ConfigError::InvalidBatchSendInterval(_))
    ));
}

#[tokio::test]
async fn bounded_queue_hands_item_back_when_full() {
    let (transport, _state) = MockTransport::new();
    let batcher = Batcher::new(transport, &config(10, Some(2))).unwrap();

    batcher.try_enqueue("a".into()).unwrap();
    batcher.try_enqueue("b".into()).unwrap();
    match batcher.try_enqueue("c".into()) {
        Err(EnqueueError::Full(item)) => assert_eq!(item, "c"),
        other => panic!("expected Full, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn bounded_enqueue_waits_for_drain() {
    let (transport, state) = MockTransport::new();
    let batcher = Batcher::new(transport, &config(10, Some(1))).unwrap();
    batcher.start().unwrap();

    // Each enqueue past the first blocks until a drain cycle frees the slot.
    for item in ["a", "b", "c"] {
        batcher.enqueue(item.to_owned()).await;
    }

    batcher.close();
    batcher.wait_closed().await;

    assert_eq!(state.items(), items(&["a", "b", "c"]));
    assert_eq!(state.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_producers_deliver_every_item_exactly_once() {
    let (transport, state) = MockTransport::with_delay(Duration::from_millis(7));
    let batcher = Arc::new(Batcher::new(transport, &config(5, None)).unwrap());
    batcher.start().unwrap();

    let producers: Vec<_> = (0..8)
        .map(|p| {
            let batcher = Arc::clone(&batcher);
            tokio::spawn(async move {
                for i in 0..50 {
                    batcher.enqueue(format!("{p}-{i:02}")).await;
                    time::sleep(Duration::from_millis(1 + (i % 3))).await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    batcher.close();
    batcher.wait_closed().await;

    let mut delivered = state.items();
    delivered.sort();
    let mut expected: Vec<String> = (0..8)
        .flat_map(|p| (0..50).map(move |i| format!("{p}-{i:02}")))
        .collect();
    expected.sort();
    assert_eq!(delivered, expected);
    assert_eq!(state.max_active(), 1, "transfers must never overlap");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transfers_never_overlap_under_parallel_load() {
    let (transport, state) = MockTransport::with_delay(Duration::from_millis(3));
    let batcher = Arc::new(Batcher::new(transport, &config(1, None)).unwrap());
    batcher.start().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let batcher = Arc::clone(&batcher);
            tokio::spawn(async move {
                for i in 0..500 {
                    batcher.enqueue(format!("{p}-{i}")).await;
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    batcher.close();
    batcher.wait_closed().await;

    assert_eq!(state.items().len(), 2000);
    assert_eq!(state.max_active(), 1);
}

#[test]
fn in_flight_guard_clears_flag_on_drop() {
    let flag = Arc::new(AtomicBool::new(true));
    drop(InFlightGuard(Arc::clone(&flag)));
    assert!(!flag.load(Ordering::SeqCst));
}

//! End-to-end scheduling scenarios on tokio's paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use coalesce_core::ports::TokioClock;
use coalesce_core::{
    Batch, BatchHandler, HandlerError, InMemoryStore, JsonFileStore, QueueRecord, RecordStore,
    ReportStatus, Scheduler, SchedulerConfig, SchedulerState,
};
use serde_json::{Value, json};
use tokio::time::Instant;

const T0: i64 = 1_700_000_000_000;
const TOKEN: &str = "scenario";

/// One observed handler call.
#[derive(Debug, Clone)]
struct Call {
    at_ms: u128,
    batch: Vec<Value>,
}

/// Records every call; fails the first `failures` of them, sleeping `delay`
/// before answering.
struct Recorder {
    started: Instant,
    failures: AtomicUsize,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    fn new(failures: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            failures: AtomicUsize::new(failures),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, batch: Batch) -> Result<(), HandlerError> {
        self.calls.lock().unwrap().push(Call {
            at_ms: self.started.elapsed().as_millis(),
            batch: batch.to_vec(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(HandlerError::new("upstream unavailable"))
        } else {
            Ok(())
        }
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_token(TOKEN)
        .with_interval_ms(1_000)
        .with_timeout_ms(500)
        .with_retry_time_ms(300)
}

fn clock() -> Arc<TokioClock> {
    Arc::new(TokioClock::anchored_at(Utc.timestamp_millis_opt(T0).unwrap()))
}

fn scheduler(store: Arc<InMemoryStore>, recorder: Arc<Recorder>) -> Scheduler {
    let scheduler = Scheduler::builder()
        .config(config())
        .store(store)
        .clock(clock())
        .build()
        .unwrap();
    scheduler.on_executed_arc(recorder).unwrap();
    scheduler
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn failed_report_is_retried_after_retry_time() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(1, Duration::ZERO);
    let scheduler = scheduler(store.clone(), recorder.clone());

    scheduler.push(json!("A")).unwrap();
    scheduler.start();
    advance(1_100).await;

    let calls = recorder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].at_ms, 0);
    assert_eq!(calls[1].at_ms, 300);
    assert!(calls.iter().all(|c| c.batch == vec![json!("A")]));

    let record = store.get(TOKEN).unwrap().unwrap();
    assert!(record.is_empty());
    assert!(!record.locked);
    assert_eq!(record.next_fire_at, T0 + 1_300);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn quick_pushes_are_reported_as_one_batch() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(0, Duration::ZERO);
    let scheduler = scheduler(store, recorder.clone());

    for payload in ["A", "B", "C"] {
        scheduler.push(json!(payload)).unwrap();
    }
    scheduler.start();
    advance(50).await;

    let calls = recorder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].batch, vec![json!("A"), json!("B"), json!("C")]);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pushes_between_drains_wait_for_the_next_interval() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(0, Duration::ZERO);
    let scheduler = scheduler(store, recorder.clone());

    scheduler.push(json!("first")).unwrap();
    scheduler.start();
    advance(100).await;
    scheduler.push(json!("second")).unwrap();
    scheduler.push(json!("third")).unwrap();
    advance(1_000).await;

    let calls = recorder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].batch, vec![json!("first")]);
    assert_eq!(calls[1].at_ms, 1_000);
    assert_eq!(calls[1].batch, vec![json!("second"), json!("third")]);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_tasks_are_kept_until_delivered() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(3, Duration::ZERO);
    let scheduler = scheduler(store.clone(), recorder.clone());

    scheduler.push(json!({ "formId": "a" })).unwrap();
    scheduler.push(json!({ "formId": "b" })).unwrap();
    scheduler.start();

    advance(650).await;
    // three failures so far, nothing removed
    assert_eq!(recorder.calls().len(), 3);
    assert_eq!(scheduler.pending().unwrap().len(), 2);

    advance(400).await;
    let calls = recorder.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[3].batch.len(), 2);
    assert!(store.get(TOKEN).unwrap().unwrap().is_empty());

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn locked_record_is_left_alone_until_the_lock_goes_stale() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(0, Duration::ZERO);
    let scheduler = scheduler(store.clone(), recorder.clone());

    scheduler.push(json!("A")).unwrap();
    let mut record = store.get(TOKEN).unwrap().unwrap();
    record.locked = true;
    store.set(TOKEN, &record).unwrap();

    scheduler.start();
    advance(1_500).await;
    assert!(recorder.calls().is_empty());
    assert!(store.get(TOKEN).unwrap().unwrap().locked);

    // polled at t=2000: older than max(interval, timeout, retry) past the fire time
    advance(600).await;
    let calls = recorder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].at_ms, 2_000);
    assert!(store.get(TOKEN).unwrap().unwrap().is_empty());

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn far_future_fire_time_is_clamped_to_interval() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(0, Duration::ZERO);
    let scheduler = scheduler(store.clone(), recorder.clone());

    scheduler.push(json!("A")).unwrap();
    let mut record = store.get(TOKEN).unwrap().unwrap();
    record.next_fire_at = T0 + 1_000_000_000_000;
    store.set(TOKEN, &record).unwrap();

    scheduler.start();
    advance(1_100).await;

    let calls = recorder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].at_ms, 1_000);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_handler_times_out_and_keeps_tasks() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(0, Duration::from_secs(10));
    let scheduler = scheduler(store.clone(), recorder.clone());

    scheduler.push(json!("A")).unwrap();
    scheduler.start();
    advance(600).await;

    let record = store.get(TOKEN).unwrap().unwrap();
    assert_eq!(recorder.calls().len(), 1);
    assert!(!record.locked);
    assert_eq!(record.len(), 1);
    assert_eq!(record.next_fire_at, T0 + 500 + 300);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn push_during_report_stays_queued() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(0, Duration::from_millis(200));
    let scheduler = scheduler(store.clone(), recorder.clone());

    scheduler.push(json!("A")).unwrap();
    scheduler.start();
    advance(100).await;
    assert_eq!(scheduler.state(), SchedulerState::Executing);

    scheduler.push(json!("B")).unwrap();
    let status = scheduler.report(vec![json!("C")]).await.unwrap();
    assert!(matches!(status, ReportStatus::Queued { ref ids } if ids.len() == 1));

    advance(200).await;
    let pending: Vec<Value> = scheduler
        .pending()
        .unwrap()
        .into_iter()
        .map(|t| t.into_payload())
        .collect();
    assert_eq!(pending, vec![json!("B"), json!("C")]);
    assert_eq!(recorder.calls()[0].batch, vec![json!("A")]);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_report_unlocks_and_plans_retry() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(0, Duration::from_secs(10));
    let scheduler = scheduler(store.clone(), recorder.clone());

    scheduler.push(json!("A")).unwrap();
    scheduler.start();
    advance(100).await;
    assert!(store.get(TOKEN).unwrap().unwrap().locked);

    assert!(scheduler.stop());
    advance(1).await;

    let record = store.get(TOKEN).unwrap().unwrap();
    assert!(!record.locked);
    assert_eq!(record.len(), 1);
    assert_eq!(record.next_fire_at, T0 + 100 + 300);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn loop_without_handlers_keeps_polling() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = Scheduler::builder()
        .config(config())
        .store(store.clone())
        .clock(clock())
        .build()
        .unwrap();

    scheduler.push(json!("A")).unwrap();
    scheduler.start();
    advance(2_500).await;
    assert_eq!(scheduler.pending().unwrap().len(), 1);

    let recorder = Recorder::new(0, Duration::ZERO);
    scheduler.on_executed_arc(recorder.clone()).unwrap();
    advance(1_000).await;
    assert_eq!(recorder.calls().len(), 1);
    assert!(scheduler.pending().unwrap().is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn file_store_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
        let producer = Scheduler::builder()
            .config(config())
            .store(store)
            .build()
            .unwrap();
        producer.push(json!({ "formId": "kept" })).unwrap();
        producer.push(json!({ "formId": "also-kept" })).unwrap();
    }

    let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
    let on_disk: QueueRecord = store.get(TOKEN).unwrap().unwrap();
    assert_eq!(on_disk.len(), 2);

    let recorder = Recorder::new(0, Duration::ZERO);
    let consumer = Scheduler::builder()
        .config(config())
        .store(store.clone())
        .build()
        .unwrap();
    consumer.on_executed_arc(recorder.clone()).unwrap();

    let outcome = consumer.drain_once().await.unwrap();
    assert!(matches!(
        outcome,
        coalesce_core::DrainOutcome::Reported { count: 2, .. }
    ));
    assert_eq!(
        recorder.calls()[0].batch,
        vec![json!({ "formId": "kept" }), json!({ "formId": "also-kept" })]
    );
    assert!(store.get(TOKEN).unwrap().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_are_delivered_exactly_once() {
    const PER_THREAD: usize = 1_500;
    const THREADS: usize = 2;
    const REPORTS: usize = 200;

    let store = Arc::new(InMemoryStore::new());
    let recorder = Recorder::new(0, Duration::ZERO);
    let scheduler = Scheduler::builder()
        .config(
            SchedulerConfig::default()
                .with_token(TOKEN)
                .with_interval_ms(1)
                .with_timeout_ms(5_000)
                .with_retry_time_ms(1),
        )
        .store(store.clone())
        .build()
        .unwrap();
    scheduler.on_executed_arc(recorder.clone()).unwrap();
    scheduler.start();

    let pushers: Vec<_> = (0..THREADS)
        .map(|t| {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    scheduler.push(json!(format!("p{t}-{i}"))).unwrap();
                }
            })
        })
        .collect();
    let reporter = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            for i in 0..REPORTS {
                scheduler.report(vec![json!(format!("r{i}"))]).await.unwrap();
            }
        })
    };
    for pusher in pushers {
        pusher.join().unwrap();
    }
    reporter.await.unwrap();

    let total = THREADS * PER_THREAD + REPORTS;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let delivered: usize = recorder.calls().iter().map(|c| c.batch.len()).sum();
        let pending = scheduler.pending().unwrap().len();
        if (pending == 0 && delivered >= total) || Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    scheduler.shutdown().await;

    let delivered: Vec<Value> = recorder
        .calls()
        .into_iter()
        .flat_map(|c| c.batch)
        .collect();
    let distinct: std::collections::HashSet<String> = delivered
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(distinct.len(), total, "every payload is delivered");
    assert_eq!(delivered.len(), total, "no payload is delivered twice");
    assert!(store.get(TOKEN).unwrap().unwrap().is_empty());
}

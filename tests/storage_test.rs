//! Store journaling, restore after restart, and retention.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use jobq::config::{EngineConfig, QueueConfig};
use jobq::engine::Engine;
use jobq::error::Error;
use jobq::model::*;
use jobq::processor::{ProcessorOptions, processor_fn};
use jobq::storage::{MemoryStore, Store};
use serde_json::json;

fn quick_config() -> EngineConfig {
    EngineConfig {
        sweep_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

/// A job record as a previous process would have left it.
fn stored_job(queue: &str, state: State, seq: u64, attempts: u32) -> Job {
    let now = Utc::now();
    Job {
        id: JobId::new(),
        queue: queue.to_string(),
        name: None,
        payload: json!({"seq": seq}),
        state,
        priority: 0,
        seq,
        attempts,
        max_attempts: 3,
        backoff: Backoff::default(),
        timeout: None,
        retries: 0,
        progress: json!(null),
        result: None,
        failure: None,
        logs: Vec::new(),
        created_at: now,
        updated_at: now,
        delay_until: None,
        processed_at: (attempts > 0).then_some(now),
        finished_at: None,
    }
}

fn echo(engine: &Engine, queue: &str) {
    engine
        .register_handler(
            queue,
            ProcessorOptions::new(),
            processor_fn(|ctx| async move { Ok(ctx.payload().clone()) }),
        )
        .unwrap();
}

#[tokio::test]
async fn store_journals_every_transition() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::with_store(quick_config(), store.clone());
    engine.declare_queue("work").unwrap();

    let id = engine.submit("work", json!("p"), JobOptions::new()).unwrap();
    let loaded = store.load("work").unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].state, State::Waiting);

    echo(&engine, "work");
    engine.start();
    within(engine.finished(id)).await.unwrap();

    let loaded = store.load("work").unwrap();
    assert_eq!(loaded[0].id, id);
    assert_eq!(loaded[0].state, State::Completed);
    assert_eq!(loaded[0].result, Some(json!("p")));
    engine.shutdown().await;
}

#[tokio::test]
async fn restore_requeues_interrupted_jobs() {
    let store = Arc::new(MemoryStore::new());
    let interrupted = stored_job("work", State::Active, 4, 1);
    let waiting = stored_job("work", State::Waiting, 5, 0);
    let done = stored_job("work", State::Completed, 2, 1);
    let exhausted = stored_job("work", State::Active, 3, 3);
    for job in [&interrupted, &waiting, &done, &exhausted] {
        store.enqueue(job).unwrap();
    }

    let engine = Engine::with_store(quick_config(), store.clone());
    engine.declare_queue("work").unwrap();

    let restored = engine.get_job(interrupted.id).unwrap();
    assert_eq!(restored.state, State::Waiting);
    assert_eq!(restored.attempts, 1);
    assert_eq!(engine.get_job(done.id).unwrap().state, State::Completed);

    // Its last attempt was the one cut short, so it is not run again.
    let stalled = engine.get_job(exhausted.id).unwrap();
    assert_eq!(stalled.state, State::Failed);
    assert_eq!(stalled.attempts, 3);
    assert_eq!(stalled.failure.unwrap().reason, FailureReason::Stalled);
    assert!(matches!(
        within(engine.finished(exhausted.id)).await,
        Err(Error::MaxAttemptsExceeded { attempts: 3, .. })
    ));
    let stored = store.load("work").unwrap();
    let record = stored.iter().find(|j| j.id == exhausted.id).unwrap();
    assert_eq!(record.state, State::Failed);

    let counts = engine.counts("work").unwrap();
    assert_eq!(counts.waiting, 2);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 1);

    // New submissions continue the insertion sequence.
    let fresh = engine.submit("work", json!(null), JobOptions::new()).unwrap();
    assert_eq!(engine.get_job(fresh).unwrap().seq, 6);

    echo(&engine, "work");
    engine.start();
    within(engine.finished(interrupted.id)).await.unwrap();
    assert_eq!(engine.get_job(interrupted.id).unwrap().attempts, 2);
    within(engine.finished(waiting.id)).await.unwrap();
    assert_eq!(engine.get_job(exhausted.id).unwrap().attempts, 3);
    engine.shutdown().await;
}

#[tokio::test]
async fn redeclaring_a_queue_leaves_its_stored_jobs_alone() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::with_store(quick_config(), store.clone());
    engine.declare_queue("work").unwrap();
    engine
        .register_handler(
            "work",
            ProcessorOptions::new(),
            processor_fn(|_ctx| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!(null))
            }),
        )
        .unwrap();
    engine.start();

    let id = engine.submit("work", json!(null), JobOptions::new()).unwrap();
    wait_until(|| engine.get_job(id).unwrap().state == State::Active).await;

    let again = engine.declare_queue("work");
    assert!(matches!(again, Err(Error::InvalidOptions(_))));
    let stored = store.load("work").unwrap();
    assert_eq!(stored[0].state, State::Active);
    assert_eq!(engine.get_job(id).unwrap().state, State::Active);

    within(engine.finished(id)).await.unwrap();
    engine.shutdown().await;
}

#[tokio::test]
async fn restored_queues_are_independent() {
    let store = Arc::new(MemoryStore::new());
    store.enqueue(&stored_job("a", State::Waiting, 0, 0)).unwrap();

    let engine = Engine::with_store(quick_config(), store);
    engine.declare_queue("a").unwrap();
    engine.declare_queue("b").unwrap();
    assert_eq!(engine.counts("a").unwrap().waiting, 1);
    assert_eq!(engine.counts("b").unwrap(), JobCounts::default());
}

#[tokio::test]
async fn retention_count_keeps_newest_finished_jobs() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::with_store(quick_config(), store.clone());
    engine
        .declare_queue_with(
            "work",
            QueueConfig {
                remove_on_complete: Retention::count(2),
                ..QueueConfig::default()
            },
        )
        .unwrap();
    engine
        .register_handler(
            "work",
            ProcessorOptions::new().concurrency(1),
            processor_fn(|_ctx| async move { Ok(json!(null)) }),
        )
        .unwrap();

    let ids: Vec<JobId> = (0..5)
        .map(|i| engine.submit("work", json!(i), JobOptions::new()).unwrap())
        .collect();
    engine.start();
    wait_until(|| {
        let counts = engine.counts("work").unwrap();
        counts.waiting == 0 && counts.active == 0
    })
    .await;

    assert_eq!(engine.counts("work").unwrap().completed, 2);
    for evicted in &ids[..3] {
        assert!(matches!(engine.get_job(*evicted), Err(Error::JobNotFound(_))));
    }
    for kept in &ids[3..] {
        assert_eq!(engine.get_job(*kept).unwrap().state, State::Completed);
    }
    assert_eq!(store.len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn finished_returns_results_of_jobs_evicted_on_completion() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::with_store(quick_config(), store.clone());
    engine
        .declare_queue_with(
            "work",
            QueueConfig {
                remove_on_complete: Retention::remove_all(),
                remove_on_fail: Retention::remove_all(),
                ..QueueConfig::default()
            },
        )
        .unwrap();
    engine
        .register_handler(
            "work",
            ProcessorOptions::new(),
            processor_fn(|_ctx| async move { Ok(json!("done")) }),
        )
        .unwrap();

    let ok = engine.submit("work", json!(null), JobOptions::new()).unwrap();
    let unroutable = engine
        .submit("work", json!(null), JobOptions::new().name("unknown"))
        .unwrap();
    let waiters: Vec<_> = [ok, unroutable]
        .into_iter()
        .map(|id| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.finished(id).await })
        })
        .collect();
    // Let both callers start waiting before anything runs.
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.start();

    let mut results = Vec::new();
    for waiter in waiters {
        results.push(within(waiter).await.unwrap());
    }
    assert_eq!(results[0].as_ref().unwrap(), &json!("done"));
    assert!(matches!(&results[1], Err(Error::MissingProcessor(name)) if name == "unknown"));

    for id in [ok, unroutable] {
        assert!(matches!(engine.get_job(id), Err(Error::JobNotFound(_))));
    }
    assert!(store.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn remove_completed_on_demand() {
    let engine = test_engine();
    engine.declare_queue("work").unwrap();
    echo(&engine, "work");
    engine.start();

    for i in 0..3 {
        let id = engine.submit("work", json!(i), JobOptions::new()).unwrap();
        within(engine.finished(id)).await.unwrap();
    }
    let failed = engine
        .submit("work", json!(null), JobOptions::new().name("unknown"))
        .unwrap();
    assert!(within(engine.finished(failed)).await.is_err());

    assert_eq!(engine.remove_completed("work", Retention::count(1)).unwrap(), 2);
    let counts = engine.counts("work").unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 1);

    assert_eq!(engine.remove_completed("work", Retention::remove_all()).unwrap(), 2);
    assert_eq!(engine.counts("work").unwrap(), JobCounts::default());
    engine.shutdown().await;
}

#[tokio::test]
async fn retention_age_evicts_on_sweep() {
    let engine = test_engine();
    engine
        .declare_queue_with(
            "work",
            QueueConfig {
                remove_on_fail: Retention::age(Duration::from_millis(30)),
                ..QueueConfig::default()
            },
        )
        .unwrap();
    echo(&engine, "work");
    engine.start();

    let ok = engine.submit("work", json!(null), JobOptions::new()).unwrap();
    within(engine.finished(ok)).await.unwrap();
    let id = engine
        .submit("work", json!(null), JobOptions::new().name("unknown"))
        .unwrap();
    assert!(within(engine.finished(id)).await.is_err());

    wait_until(|| engine.get_job(id).is_err()).await;
    assert_eq!(engine.get_job(ok).unwrap().state, State::Completed);
    engine.shutdown().await;
}

#[test]
fn memory_store_remove_and_load() {
    let store = MemoryStore::new();
    assert!(store.is_empty());

    let first = stored_job("q", State::Waiting, 1, 0);
    let second = stored_job("q", State::Waiting, 0, 0);
    store.enqueue(&first).unwrap();
    store.enqueue(&second).unwrap();
    store.enqueue(&stored_job("other", State::Waiting, 0, 0)).unwrap();
    assert_eq!(store.len(), 3);

    let ids: Vec<JobId> = store.load("q").unwrap().iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);

    store.remove("q", first.id).unwrap();
    store.remove("q", JobId::new()).unwrap();
    store.remove("missing", first.id).unwrap();
    assert_eq!(store.load("q").unwrap().len(), 1);
    assert!(store.load("missing").unwrap().is_empty());
}

//! Dispatch order, concurrency bounds, delays and routing.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use jobq::error::Error;
use jobq::model::*;
use jobq::processor::{ProcessorOptions, processor_fn};
use serde_json::json;

#[tokio::test]
async fn higher_priority_runs_first_then_submission_order() {
    let engine = test_engine();
    engine.declare_queue("work").unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    engine
        .register_handler(
            "work",
            ProcessorOptions::new().concurrency(1),
            processor_fn(move |ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    let tag = ctx.payload()["tag"].as_str().unwrap_or_default().to_string();
                    seen.lock().unwrap().push(tag);
                    Ok(json!(null))
                }
            }),
        )
        .unwrap();

    let a = engine
        .submit("work", json!({"tag": "A"}), JobOptions::new().priority(1))
        .unwrap();
    let b = engine
        .submit("work", json!({"tag": "B"}), JobOptions::new().priority(5))
        .unwrap();
    let c = engine
        .submit("work", json!({"tag": "C"}), JobOptions::new().priority(1))
        .unwrap();
    engine.start();

    for id in [a, b, c] {
        within(engine.finished(id)).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["B", "A", "C"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn list_by_state_uses_dispatch_order() {
    let engine = test_engine();
    engine.declare_queue("work").unwrap();

    let low = engine
        .submit("work", json!(null), JobOptions::new().priority(-1))
        .unwrap();
    let first = engine.submit("work", json!(null), JobOptions::new()).unwrap();
    let high = engine
        .submit("work", json!(null), JobOptions::new().priority(10))
        .unwrap();
    let second = engine.submit("work", json!(null), JobOptions::new()).unwrap();

    let ids: Vec<JobId> = engine
        .list_by_state("work", State::Waiting)
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ids, vec![high, first, second, low]);
}

#[tokio::test]
async fn active_jobs_never_exceed_concurrency() {
    let engine = test_engine();
    engine.declare_queue("work").unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    engine
        .register_handler(
            "work",
            ProcessorOptions::new().concurrency(2),
            processor_fn(move |_ctx| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        )
        .unwrap();
    engine.start();

    let ids: Vec<JobId> = (0..6)
        .map(|i| engine.submit("work", json!(i), JobOptions::new()).unwrap())
        .collect();
    for id in ids {
        within(engine.finished(id)).await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(engine.counts("work").unwrap().completed, 6);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_attempt_keeps_its_slot_until_the_handler_stops() {
    let engine = test_engine();
    engine.declare_queue("work").unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    engine
        .register_handler(
            "work",
            ProcessorOptions::new().concurrency(1),
            processor_fn(move |_ctx| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    // Never yields, so aborting the task cannot stop it early.
                    std::thread::sleep(Duration::from_millis(300));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        )
        .unwrap();
    engine.start();

    let options = JobOptions::new().timeout(Duration::from_millis(50));
    let ids: Vec<JobId> = (0..2)
        .map(|i| engine.submit("work", json!(i), options.clone()).unwrap())
        .collect();
    for id in ids {
        assert!(matches!(
            within(engine.finished(id)).await,
            Err(Error::Timeout { attempt: 1 })
        ));
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn named_jobs_route_to_their_processor() {
    let engine = test_engine();
    engine.declare_queue("images").unwrap();
    for name in ["resize", "crop"] {
        engine
            .register_handler(
                "images",
                ProcessorOptions::named(name),
                processor_fn(move |_ctx| async move { Ok(json!(name)) }),
            )
            .unwrap();
    }
    engine.start();

    let resize = engine
        .submit("images", json!(null), JobOptions::new().name("resize"))
        .unwrap();
    let crop = engine
        .submit("images", json!(null), JobOptions::new().name("crop"))
        .unwrap();

    assert_eq!(within(engine.finished(resize)).await.unwrap(), json!("resize"));
    assert_eq!(within(engine.finished(crop)).await.unwrap(), json!("crop"));
    engine.shutdown().await;
}

#[tokio::test]
async fn job_without_matching_processor_fails_without_retry() {
    let engine = test_engine();
    engine.declare_queue("images").unwrap();
    engine
        .register_handler(
            "images",
            ProcessorOptions::new(),
            processor_fn(|_ctx| async move { Ok(json!(null)) }),
        )
        .unwrap();
    engine.start();

    let id = engine
        .submit(
            "images",
            json!(null),
            JobOptions::new().name("rotate").max_attempts(3),
        )
        .unwrap();
    let result = within(engine.finished(id)).await;
    assert!(matches!(result, Err(Error::MissingProcessor(name)) if name == "rotate"));

    let job = engine.get_job(id).unwrap();
    assert_eq!(job.state, State::Failed);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.failure.unwrap().reason, FailureReason::MissingProcessor);
    engine.shutdown().await;
}

#[tokio::test]
async fn jobs_wait_while_no_processor_is_registered() {
    let engine = test_engine();
    engine.declare_queue("work").unwrap();
    engine.start();

    let id = engine.submit("work", json!(null), JobOptions::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(engine.get_job(id).unwrap().state, State::Waiting);

    engine
        .register_handler(
            "work",
            ProcessorOptions::new(),
            processor_fn(|_ctx| async move { Ok(json!("late")) }),
        )
        .unwrap();
    assert_eq!(within(engine.finished(id)).await.unwrap(), json!("late"));
    engine.shutdown().await;
}

#[tokio::test]
async fn delayed_job_is_not_dispatched_before_its_delay() {
    let engine = test_engine();
    engine.declare_queue("work").unwrap();
    engine
        .register_handler(
            "work",
            ProcessorOptions::new(),
            processor_fn(|_ctx| async move { Ok(json!(null)) }),
        )
        .unwrap();
    engine.start();

    let id = engine
        .submit(
            "work",
            json!(null),
            JobOptions::new().delay(Duration::from_millis(150)),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.get_job(id).unwrap().state, State::Delayed);

    within(engine.finished(id)).await.unwrap();
    let job = engine.get_job(id).unwrap();
    let waited = job.processed_at.unwrap() - job.created_at;
    assert!(waited >= chrono::Duration::milliseconds(150));
    engine.shutdown().await;
}

#[tokio::test]
async fn processors_add_up_to_queue_concurrency() {
    let engine = test_engine();
    engine.declare_queue("work").unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for name in ["a", "b"] {
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        engine
            .register_handler(
                "work",
                ProcessorOptions::named(name).concurrency(1),
                processor_fn(move |_ctx| {
                    let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(null))
                    }
                }),
            )
            .unwrap();
    }
    engine.start();

    let ids: Vec<JobId> = ["a", "b", "a", "b", "a", "b"]
        .into_iter()
        .map(|name| {
            engine
                .submit("work", json!(null), JobOptions::new().name(name))
                .unwrap()
        })
        .collect();
    for id in ids {
        within(engine.finished(id)).await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    engine.shutdown().await;
}

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use jobq::config::EngineConfig;
use jobq::engine::Engine;
use jobq::event::{EventKind, QueueEvent, listener_fn};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Engine with a short sweep interval so delays resolve quickly in tests.
pub fn test_engine() -> Engine {
    Engine::new(EngineConfig {
        sweep_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(2),
        ..EngineConfig::default()
    })
}

/// Forward every event of the given kinds on `queue` into a channel.
pub fn record(engine: &Engine, queue: &str, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<QueueEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for &kind in kinds {
        let tx = tx.clone();
        engine
            .on_event(
                queue,
                kind,
                listener_fn(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }
    rx
}

/// Next recorded event, failing the test if none arrives in time.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> QueueEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Everything recorded so far. Call after `Engine::shutdown` to see the
/// full flushed stream.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Await `fut`, failing the test if it takes longer than [`WAIT`].
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("timed out")
}

/// Poll `cond` until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

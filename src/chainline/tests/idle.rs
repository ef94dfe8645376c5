//! Idle grace: a drained dispatcher tells its parent it is ready to close.

use std::time::Duration;

use chainline::{ChainId, DispatcherBuilder, ParentEvent, Query};
use chainline_test::{channel_sink, mock_transport, Dispatched};
use futures::channel::mpsc;
use futures::StreamExt as _;
use serde_json::json;

fn chain(id: u64) -> ChainId {
    ChainId::new(id).unwrap()
}

async fn run_to_completion(
    wire: &mut mpsc::UnboundedReceiver<Dispatched>,
    results: &mut mpsc::UnboundedReceiver<(Query, chainline::ResendResolver)>,
) {
    let Dispatched {
        mut query,
        completion,
    } = wire.next().await.unwrap();
    query.set_ok(json!(true));
    completion.complete(query);
    let (_query, resolver) = results.next().await.unwrap();
    resolver.finish();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn idle_grace_notifies_parent_then_rearms() {
    chainline_test::init_test_logging();
    let (parent_tx, mut parent) = mpsc::unbounded();
    let (transport, mut wire) = mock_transport();
    let (cx, dispatcher) = DispatcherBuilder::new().parent(parent_tx).connect(transport);
    tokio::spawn(dispatcher.run());
    let (sink, mut results) = channel_sink();

    let started = tokio::time::Instant::now();
    cx.submit(Query::new("q", json!(null)), sink.clone(), vec![chain(1)])
        .unwrap();
    run_to_completion(&mut wire, &mut results).await;
    assert_eq!(parent.next().await.unwrap(), ParentEvent::TaskFinished);

    // First notification after the 5 second grace.
    assert_eq!(parent.next().await.unwrap(), ParentEvent::ReadyToClose);
    assert!(started.elapsed() >= Duration::from_secs(5));

    // Re-armed at 1 second intervals afterwards.
    let rearmed = tokio::time::Instant::now();
    assert_eq!(parent.next().await.unwrap(), ParentEvent::ReadyToClose);
    assert!(rearmed.elapsed() >= Duration::from_secs(1));

    // New work revokes the pending close.
    cx.submit(Query::new("more", json!(null)), sink.clone(), vec![chain(1)])
        .unwrap();
    run_to_completion(&mut wire, &mut results).await;
    assert_eq!(parent.next().await.unwrap(), ParentEvent::TaskFinished);
    assert_eq!(parent.next().await.unwrap(), ParentEvent::ReadyToClose);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn no_idle_notification_without_a_parent() {
    let (transport, mut wire) = mock_transport();
    let (cx, dispatcher) = DispatcherBuilder::new().connect(transport);
    tokio::spawn(dispatcher.run());
    let (sink, mut results) = channel_sink();

    cx.submit(Query::new("q", json!(null)), sink, vec![chain(1)])
        .unwrap();
    run_to_completion(&mut wire, &mut results).await;

    // Nothing to observe; just make sure the actor stays healthy long past
    // the grace period.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let (sink, mut results) = channel_sink();
    cx.submit(Query::new("again", json!(null)), sink, vec![chain(1)])
        .unwrap();
    run_to_completion(&mut wire, &mut results).await;
}

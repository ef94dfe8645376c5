//! Caller-driven resend: the resolver either retries in place or finalizes.

use chainline::{ChainId, DispatcherBuilder, Error, ParentEvent, Query};
use chainline_test::{channel_sink, mock_transport, Dispatched};
use futures::channel::mpsc;
use futures::StreamExt as _;
use serde_json::json;

fn chain(id: u64) -> ChainId {
    ChainId::new(id).unwrap()
}

#[tokio::test(flavor = "current_thread")]
async fn caller_resend_replaces_the_query_in_place() {
    chainline_test::init_test_logging();
    let (parent_tx, mut parent) = mpsc::unbounded();
    let (transport, mut wire) = mock_transport();
    let (cx, dispatcher) = DispatcherBuilder::new().parent(parent_tx).connect(transport);
    tokio::spawn(dispatcher.run());
    let (sink, mut results) = channel_sink();

    cx.submit(Query::new("fetch", json!({"page": 1})), sink, vec![chain(2)])
        .unwrap();

    // The transport fails the query with a server error: delegated.
    let Dispatched {
        mut query,
        completion,
    } = wire.next().await.unwrap();
    query.set_error(Error::new(500, "Internal Server Error"));
    completion.complete(query);

    let (failed, resolver) = results.next().await.unwrap();
    assert_eq!(failed.error_code(), Some(500));

    // The caller retries with a fresh handle; it is transmitted for the
    // same task.
    let retry = Query::new("fetch", json!({"page": 1, "retry": true}));
    let retry_id = retry.id();
    resolver.resend(retry);

    let Dispatched {
        mut query,
        completion,
    } = wire.next().await.unwrap();
    assert_eq!(query.id(), retry_id);
    assert!(query.invoke_after().is_empty());
    query.set_ok(json!("page-1"));
    completion.complete(query);

    let (done, resolver) = results.next().await.unwrap();
    assert_eq!(done.id(), retry_id);
    assert!(done.result().is_some());
    resolver.finish();

    // One task, one finalization.
    assert_eq!(parent.next().await.unwrap(), ParentEvent::TaskFinished);
}

#[tokio::test(flavor = "current_thread")]
async fn successors_chain_onto_the_retried_query() {
    let (transport, mut wire) = mock_transport();
    let (cx, dispatcher) = DispatcherBuilder::new().connect(transport);
    tokio::spawn(dispatcher.run());
    let (sink, mut results) = channel_sink();

    let q1 = Query::new("first", json!(null));
    let q2 = Query::new("second", json!(null));
    let id2 = q2.id();
    cx.submit(q1, sink.clone(), vec![chain(3)]).unwrap();
    cx.submit(q2, sink.clone(), vec![chain(3)]).unwrap();

    let d1 = wire.next().await.unwrap();
    let d2 = wire.next().await.unwrap();

    // first fails; the caller substitutes a replacement.
    let Dispatched {
        mut query,
        completion,
    } = d1;
    query.set_error(Error::new(500, "boom"));
    completion.complete(query);
    let (_failed, resolver) = results.next().await.unwrap();
    let replacement = Query::new("first-retry", json!(null));
    let replacement_id = replacement.id();
    resolver.resend(replacement);

    // The replacement goes out on the rewound chain.
    let d1_again = wire.next().await.unwrap();
    assert_eq!(d1_again.query.id(), replacement_id);
    assert!(d1_again.query.invoke_after().is_empty());

    // second's own wait failure re-chains it onto the replacement.
    let Dispatched {
        mut query,
        completion,
    } = d2;
    query.set_error(Error::new(400, "MSG_WAIT_FAILED"));
    completion.complete(query);
    let d2_again = wire.next().await.unwrap();
    assert_eq!(d2_again.query.id(), id2);
    let hints: Vec<_> = d2_again
        .query
        .invoke_after()
        .iter()
        .filter_map(|r| r.query_id())
        .collect();
    assert_eq!(hints, vec![replacement_id]);
}

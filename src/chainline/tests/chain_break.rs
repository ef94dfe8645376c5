//! Chain-break completions: transparent resend and suffix re-chaining.

use chainline::{ChainId, DispatcherBuilder, Error, Query, RESEND_INVOKE_AFTER};
use chainline_test::{channel_sink, mock_transport, Dispatched};
use futures::StreamExt as _;
use serde_json::json;

fn chain(id: u64) -> ChainId {
    ChainId::new(id).unwrap()
}

#[tokio::test(flavor = "current_thread")]
async fn wait_failed_resends_and_recreates_the_chain() {
    chainline_test::init_test_logging();
    let (transport, mut wire) = mock_transport();
    let (cx, dispatcher) = DispatcherBuilder::new().connect(transport);
    tokio::spawn(dispatcher.run());
    let (sink, mut results) = channel_sink();

    let queries: Vec<Query> = ["q1", "q2", "q3"]
        .iter()
        .map(|method| Query::new(*method, json!(null)))
        .collect();
    let ids: Vec<_> = queries.iter().map(Query::id).collect();
    for query in queries {
        cx.submit(query, sink.clone(), vec![chain(1)]).unwrap();
    }
    let d1 = wire.next().await.unwrap();
    let d2 = wire.next().await.unwrap();
    let d3 = wire.next().await.unwrap();

    // q1 succeeds and finalizes.
    let Dispatched {
        mut query,
        completion,
    } = d1;
    query.set_ok(json!(1));
    completion.complete(query);
    let (_query, resolver) = results.next().await.unwrap();
    resolver.finish();

    // q2 comes back with a wait failure: resent transparently, on a fresh
    // fabric with no predecessor.
    let Dispatched {
        mut query,
        completion,
    } = d2;
    query.set_error(Error::new(400, "MSG_WAIT_FAILED"));
    completion.complete(query);
    let d2_again = wire.next().await.unwrap();
    assert_eq!(d2_again.query.id(), ids[1]);
    assert!(!d2_again.query.is_error());
    assert!(d2_again.query.invoke_after().is_empty());

    // The cascade reaches q3, which re-chains onto the resent q2 exactly
    // once.
    let Dispatched {
        mut query,
        completion,
    } = d3;
    query.set_error(Error::new(400, "MSG_WAIT_TIMEOUT"));
    completion.complete(query);
    let d3_again = wire.next().await.unwrap();
    assert_eq!(d3_again.query.id(), ids[2]);
    let hints: Vec<_> = d3_again
        .query
        .invoke_after()
        .iter()
        .filter_map(|r| r.query_id())
        .collect();
    assert_eq!(hints, vec![ids[1]]);
    // The hint names q2's second transmission, not its first.
    assert_eq!(
        d3_again.query.invoke_after()[0].message_id(),
        d2_again.query.message_id()
    );

    // Settle the resent pair.
    for d in [d2_again, d3_again] {
        let Dispatched {
            mut query,
            completion,
        } = d;
        query.set_ok(json!("ok"));
        completion.complete(query);
        let (_query, resolver) = results.next().await.unwrap();
        resolver.finish();
    }
}

#[tokio::test(flavor = "current_thread")]
async fn resend_invoke_after_sentinel_is_a_chain_break() {
    let (transport, mut wire) = mock_transport();
    let (cx, dispatcher) = DispatcherBuilder::new().connect(transport);
    tokio::spawn(dispatcher.run());
    let (sink, mut results) = channel_sink();

    let query = Query::new("q", json!(null));
    let id = query.id();
    cx.submit(query, sink, vec![chain(2)]).unwrap();

    let Dispatched {
        mut query,
        completion,
    } = wire.next().await.unwrap();
    query.set_error(Error::new(RESEND_INVOKE_AFTER, "invoke-after target lost"));
    completion.complete(query);

    // Resent without consulting the caller.
    let Dispatched {
        mut query,
        completion,
    } = wire.next().await.unwrap();
    assert_eq!(query.id(), id);
    assert!(!query.is_error());
    query.set_ok(json!("ok"));
    completion.complete(query);
    let (query, resolver) = results.next().await.unwrap();
    assert!(query.result().is_some());
    resolver.finish();
}

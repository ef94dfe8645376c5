//! The in-flight window: at most `max_in_flight` tasks out at once,
//! counting those awaiting a resend decision.

use chainline::{ChainId, DispatcherBuilder, Query, MAX_SIMULTANEOUS_WAIT};
use chainline_test::{channel_sink, mock_transport, Dispatched};
use futures::StreamExt as _;
use serde_json::json;

fn chain(id: u64) -> ChainId {
    ChainId::new(id).unwrap()
}

async fn drain_actor() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "current_thread")]
async fn independent_tasks_respect_the_cap() {
    chainline_test::init_test_logging();
    let (transport, mut wire) = mock_transport();
    let (cx, dispatcher) = DispatcherBuilder::new().connect(transport);
    tokio::spawn(dispatcher.run());
    let (sink, mut results) = channel_sink();

    let total = MAX_SIMULTANEOUS_WAIT + 5;
    for i in 0..total {
        let query = Query::new(format!("q{i}"), json!(null));
        cx.submit(query, sink.clone(), vec![chain(100 + i as u64)])
            .unwrap();
    }

    let mut out = Vec::new();
    for _ in 0..MAX_SIMULTANEOUS_WAIT {
        out.push(wire.next().await.unwrap());
    }
    drain_actor().await;
    assert!(wire.try_next().is_err(), "cap exceeded");

    // A completion that is merely awaiting its resend decision still holds
    // its slot.
    let Dispatched {
        mut query,
        completion,
    } = out.pop().unwrap();
    query.set_ok(json!(true));
    completion.complete(query);
    let (_query, resolver) = results.next().await.unwrap();
    drain_actor().await;
    assert!(wire.try_next().is_err(), "awaiting task freed its slot early");

    // Finalizing releases the slot and admits the next task.
    resolver.finish();
    let next = wire.next().await.unwrap();
    assert!(next.query.invoke_after().is_empty());

    // Drain the rest: as each task finalizes, another is admitted.
    out.push(next);
    let mut admitted = MAX_SIMULTANEOUS_WAIT + 1;
    while let Some(d) = out.pop() {
        let Dispatched {
            mut query,
            completion,
        } = d;
        query.set_ok(json!(true));
        completion.complete(query);
        let (_query, resolver) = results.next().await.unwrap();
        resolver.finish();
        if admitted < total {
            out.push(wire.next().await.unwrap());
            admitted += 1;
        } else {
            drain_actor().await;
            assert!(wire.try_next().is_err());
        }
    }
}

//! Test support for chainline: a mock transport that surfaces dispatched
//! queries as a stream, and ready-made result sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc;

use chainline::{Completion, Query, ResendResolver, ResultSink, Transport};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// A query handed to the mock transport, paired with its completion token.
///
/// Tests inspect the query (invoke-after hints, payload, bookkeeping), then
/// mark it completed and send it back through the token.
#[derive(Debug)]
pub struct Dispatched {
    /// The dispatched query.
    pub query: Query,
    /// Token delivering the completed query back to the dispatcher.
    pub completion: Completion,
}

/// Transport that assigns message ids and forwards every dispatched query to
/// a channel for the test to drive.
pub struct MockTransport {
    tx: mpsc::UnboundedSender<Dispatched>,
}

impl MockTransport {
    /// A transport feeding an existing channel — lets several transports
    /// (e.g. pool children) share one wire stream.
    pub fn with_sender(tx: mpsc::UnboundedSender<Dispatched>) -> Self {
        MockTransport { tx }
    }
}

/// A fresh mock transport and the receiving end of its wire stream.
pub fn mock_transport() -> (MockTransport, mpsc::UnboundedReceiver<Dispatched>) {
    let (tx, rx) = mpsc::unbounded();
    (MockTransport::with_sender(tx), rx)
}

impl Transport for MockTransport {
    fn dispatch_with_callback(&mut self, query: Query, completion: Completion) {
        query.assign_message_id(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.unbounded_send(Dispatched { query, completion });
    }
}

/// Sink that forwards every delegated completion to a channel, leaving the
/// resend decision to the test.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(Query, ResendResolver)>,
}

/// A [`ChannelSink`] and the receiving end of its results stream.
pub fn channel_sink() -> (
    ChannelSink,
    mpsc::UnboundedReceiver<(Query, ResendResolver)>,
) {
    let (tx, rx) = mpsc::unbounded();
    (ChannelSink { tx }, rx)
}

impl ResultSink for ChannelSink {
    fn on_result_resendable(&mut self, query: Query, resolver: ResendResolver) {
        let _ = self.tx.unbounded_send((query, resolver));
    }
}

/// Sink that records every delegated query and immediately finalizes it.
#[derive(Clone)]
pub struct FinishingSink {
    results: Arc<Mutex<Vec<Query>>>,
}

/// A [`FinishingSink`] and the shared vector it records into.
pub fn finishing_sink() -> (FinishingSink, Arc<Mutex<Vec<Query>>>) {
    let results = Arc::new(Mutex::new(Vec::new()));
    (
        FinishingSink {
            results: results.clone(),
        },
        results,
    )
}

impl ResultSink for FinishingSink {
    fn on_result_resendable(&mut self, query: Query, resolver: ResendResolver) {
        self.results.lock().unwrap().push(query);
        resolver.finish();
    }
}

/// Install a fmt subscriber honoring `RUST_LOG`, once per process. Safe to
/// call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

//! Per-chain dispatcher pool.
//!
//! One child [`Dispatcher`] per chain id, spawned lazily on first submission
//! and reclaimed once it reports ready-to-close with no live tasks. This is
//! the consumer of the [`ParentEvent`] contract.

use futures::StreamExt as _;
use futures::channel::mpsc;
use fxhash::FxHashMap;

use crate::dispatcher::{Dispatcher, DispatcherBuilder, DispatcherCx, ParentEvent, ResultSink};
use crate::query::Query;
use crate::scheduler::ChainId;
use crate::transport::Transport;
use crate::Error;

enum PoolMsg {
    Submit {
        chain: ChainId,
        query: Query,
        sink: Box<dyn ResultSink>,
    },
}

/// Handle for submitting work to a running [`DispatcherPool`].
#[derive(Clone, Debug)]
pub struct PoolCx {
    tx: mpsc::UnboundedSender<PoolMsg>,
}

impl PoolCx {
    /// Enqueue `query` on `chain`, spawning the chain's dispatcher if it
    /// does not exist yet.
    pub fn submit(&self, query: Query, sink: impl ResultSink, chain: ChainId) -> Result<(), Error> {
        self.tx
            .unbounded_send(PoolMsg::Submit {
                chain,
                query,
                sink: Box::new(sink),
            })
            .map_err(|_| Error::internal("dispatcher pool is gone"))
    }
}

impl std::fmt::Debug for PoolMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolMsg::Submit { chain, .. } => {
                f.debug_struct("Submit").field("chain", chain).finish_non_exhaustive()
            }
        }
    }
}

struct Child {
    cx: DispatcherCx,
    /// Submitted-but-not-finished tasks, tracked from parent events.
    live: usize,
}

/// A pool of per-chain dispatchers.
///
/// Runs as its own actor; submissions arrive through [`PoolCx`] and child
/// liveness through the parent-event channel each child is spawned with.
pub struct DispatcherPool<T, F>
where
    T: Transport,
    F: FnMut() -> T,
{
    children: FxHashMap<ChainId, Child>,
    make_transport: F,
    max_in_flight: usize,
    rx: mpsc::UnboundedReceiver<PoolMsg>,
    events_tx: mpsc::UnboundedSender<(ChainId, ParentEvent)>,
    events_rx: mpsc::UnboundedReceiver<(ChainId, ParentEvent)>,
}

impl<T, F> DispatcherPool<T, F>
where
    T: Transport,
    F: FnMut() -> T,
{
    /// Create a pool whose children are connected to transports produced by
    /// `make_transport` and capped at `max_in_flight` each.
    pub fn new(make_transport: F, max_in_flight: usize) -> (PoolCx, Self) {
        let (tx, rx) = mpsc::unbounded();
        let (events_tx, events_rx) = mpsc::unbounded();
        let pool = DispatcherPool {
            children: FxHashMap::default(),
            make_transport,
            max_in_flight,
            rx,
            events_tx,
            events_rx,
        };
        (PoolCx { tx }, pool)
    }

    /// Drive the pool until every [`PoolCx`] clone is dropped, then hang up
    /// the remaining children.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.rx.next() => match msg {
                    Some(PoolMsg::Submit { chain, query, sink }) => {
                        self.submit(chain, query, sink);
                    }
                    None => break,
                },
                event = self.events_rx.next() => {
                    if let Some((chain, event)) = event {
                        self.on_child_event(chain, event);
                    }
                }
            }
        }
        for (chain, child) in self.children.drain() {
            tracing::debug!(chain = chain.get(), "pool closing, hanging up child");
            child.cx.hangup();
        }
    }

    fn submit(&mut self, chain: ChainId, query: Query, sink: Box<dyn ResultSink>) {
        let child = self.children.entry(chain).or_insert_with(|| {
            tracing::debug!(chain = chain.get(), "spawning chain dispatcher");
            spawn_child(chain, (self.make_transport)(), self.max_in_flight, &self.events_tx)
        });
        child.live += 1;
        if let Err(error) = child.cx.submit(query, sink, vec![chain]) {
            tracing::warn!(chain = chain.get(), %error, "child dispatcher rejected submission");
        }
    }

    fn on_child_event(&mut self, chain: ChainId, event: ParentEvent) {
        match event {
            ParentEvent::TaskFinished => {
                if let Some(child) = self.children.get_mut(&chain) {
                    child.live = child.live.saturating_sub(1);
                }
            }
            ParentEvent::ReadyToClose => {
                let idle = self
                    .children
                    .get(&chain)
                    .is_some_and(|child| child.live == 0);
                if idle {
                    tracing::debug!(chain = chain.get(), "closing idle chain dispatcher");
                    if let Some(child) = self.children.remove(&chain) {
                        child.cx.hangup();
                    }
                }
            }
        }
    }
}

fn spawn_child<T: Transport>(
    chain: ChainId,
    transport: T,
    max_in_flight: usize,
    events_tx: &mpsc::UnboundedSender<(ChainId, ParentEvent)>,
) -> Child {
    let (parent_tx, mut parent_rx) = mpsc::unbounded();
    let (cx, dispatcher): (DispatcherCx, Dispatcher<T>) = DispatcherBuilder::new()
        .name(format!("chain-{}", chain.get()))
        .max_in_flight(max_in_flight)
        .parent(parent_tx)
        .connect(transport);
    tokio::spawn(dispatcher.run());

    // Tag the child's events with its chain id for the pool loop.
    let events_tx = events_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = parent_rx.next().await {
            if events_tx.unbounded_send((chain, event)).is_err() {
                break;
            }
        }
    });

    Child { cx, live: 0 }
}

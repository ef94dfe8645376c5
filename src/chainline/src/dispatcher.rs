//! The dispatcher actor: owns a [`ChainScheduler`], drives transmissions,
//! and routes transport completions and caller resend decisions.
//!
//! # The dispatch loop
//!
//! The dispatcher runs as a single async task consuming a message stream.
//! Every entry point — submission, transport completion, resend decision,
//! idle-timer expiry, teardown — is serialized through that stream and runs
//! to completion before the next one is looked at, so the state machine
//! never observes its own methods in parallel and takes no locks.
//!
//! # Ordering guarantees
//!
//! Within a chain, transmission order matches submission order, and each
//! transmitted query carries its per-chain predecessors as invoke-after
//! hints. A chain-break completion rewinds the chain and re-chains the
//! suffix transparently; every other completion is delegated to the caller's
//! [`ResultSink`] with a one-shot [`ResendResolver`].

use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use futures::channel::mpsc;
use tracing::Instrument as _;

use crate::query::{Query, QueryRef};
use crate::scheduler::{ChainId, ChainScheduler, TaskId};
use crate::transport::{Completion, Transport};
use crate::Error;

/// Default upper bound on tasks simultaneously in flight or awaiting a
/// resend decision.
pub const MAX_SIMULTANEOUS_WAIT: usize = 10;

/// Idle grace before the parent is first told the dispatcher may be closed.
const IDLE_GRACE: Duration = Duration::from_secs(5);
/// Re-arm interval for subsequent ready-to-close notifications.
const IDLE_REARM: Duration = Duration::from_secs(1);

/// Caller-supplied result sink, invoked once per transmission attempt whose
/// completion is not recovered internally.
///
/// The sink must eventually use the resolver exactly once: with a fresh
/// query to retry in place, or finishing to finalize the task. An unresolved
/// resolver holds the task's concurrency slot.
pub trait ResultSink: Send + 'static {
    /// Receive a completed (or synthetically failed) query together with the
    /// resolver deciding its disposition.
    fn on_result_resendable(&mut self, query: Query, resolver: ResendResolver);
}

impl<F> ResultSink for F
where
    F: FnMut(Query, ResendResolver) + Send + 'static,
{
    fn on_result_resendable(&mut self, query: Query, resolver: ResendResolver) {
        self(query, resolver)
    }
}

impl ResultSink for Box<dyn ResultSink> {
    fn on_result_resendable(&mut self, query: Query, resolver: ResendResolver) {
        (**self).on_result_resendable(query, resolver)
    }
}

/// One-shot resolver for a delegated completion.
pub struct ResendResolver {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    task_id: TaskId,
}

impl ResendResolver {
    fn new(tx: mpsc::UnboundedSender<DispatcherMsg>, task_id: TaskId) -> Self {
        ResendResolver { tx, task_id }
    }

    /// Retry in place: the task keeps its id and queue positions, its chains
    /// are rewound, and `query` is transmitted on the next loop.
    pub fn resend(self, query: Query) {
        self.resolve(Some(query));
    }

    /// Finalize the task; no further transmission happens for it.
    pub fn finish(self) {
        self.resolve(None);
    }

    fn resolve(self, query: Option<Query>) {
        let _ = self.tx.unbounded_send(DispatcherMsg::ResendDecision {
            task_id: self.task_id,
            query,
        });
    }
}

impl std::fmt::Debug for ResendResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResendResolver")
            .field("task_id", &self.task_id)
            .finish()
    }
}

/// Liveness events reported to an optional upstream owner.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParentEvent {
    /// A task reached its terminal state.
    TaskFinished,
    /// The idle grace elapsed with no live tasks; the parent may drop this
    /// dispatcher. Re-sent every second until work arrives or it does.
    ReadyToClose,
}

pub(crate) enum DispatcherMsg {
    Submit {
        query: Query,
        sink: Box<dyn ResultSink>,
        chains: Vec<ChainId>,
    },
    Completed {
        task_id: TaskId,
        query: Query,
    },
    ResendDecision {
        task_id: TaskId,
        query: Option<Query>,
    },
    TearDown,
    CloseSilent,
    Hangup,
}

/// Per-task state kept alongside the scheduler node.
struct Node {
    /// Weak handle successors attach as their invoke-after hint. Valid while
    /// the query object exists, wherever it currently is.
    query_ref: QueryRef,
    /// The query itself, held only while the task is pending.
    query: Option<Query>,
    sink: Box<dyn ResultSink>,
    /// Flood-wait seconds accrued from predecessors while the query was out.
    total_timeout: f64,
    /// Most recent flood-wait observed on a predecessor.
    last_timeout: f64,
}

/// Configures and connects a [`Dispatcher`].
#[must_use]
pub struct DispatcherBuilder {
    name: Option<String>,
    max_in_flight: usize,
    parent: Option<mpsc::UnboundedSender<ParentEvent>>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    /// Start configuring a dispatcher.
    pub fn new() -> Self {
        DispatcherBuilder {
            name: None,
            max_in_flight: MAX_SIMULTANEOUS_WAIT,
            parent: None,
        }
    }

    /// Set the dispatcher's name — used only for log spans.
    pub fn name(mut self, name: impl ToString) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Override the concurrency cap (default [`MAX_SIMULTANEOUS_WAIT`]).
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Register an upstream owner to receive [`ParentEvent`]s.
    pub fn parent(mut self, tx: mpsc::UnboundedSender<ParentEvent>) -> Self {
        self.parent = Some(tx);
        self
    }

    /// Bind to a transport. Returns the submission handle and the actor,
    /// which must be driven via [`Dispatcher::run`].
    pub fn connect<T: Transport>(self, transport: T) -> (DispatcherCx, Dispatcher<T>) {
        let (tx, rx) = mpsc::unbounded();
        let cx = DispatcherCx { tx: tx.clone() };
        let dispatcher = Dispatcher {
            name: self.name,
            scheduler: ChainScheduler::new(self.max_in_flight),
            transport,
            tx,
            rx,
            parent: self.parent,
            idle: None,
        };
        (cx, dispatcher)
    }
}

/// Handle for submitting work to a running [`Dispatcher`].
///
/// Cheaply cloneable; all clones feed the same actor.
#[derive(Clone, Debug)]
pub struct DispatcherCx {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
}

impl DispatcherCx {
    /// Enqueue `query` on `chains`.
    ///
    /// `chains` must be non-empty (chain ids are non-zero by construction of
    /// [`ChainId`]). The query's session salt is stamped from the first
    /// chain id. `sink` receives every delegated completion for this task.
    pub fn submit(
        &self,
        query: Query,
        sink: impl ResultSink,
        chains: Vec<ChainId>,
    ) -> Result<(), Error> {
        assert!(!chains.is_empty(), "a query must be submitted on at least one chain");
        self.send(DispatcherMsg::Submit {
            query,
            sink: Box::new(sink),
            chains,
        })
    }

    /// Fail every query the dispatcher still holds with a "Request aborted"
    /// error, finalize all tasks, then stop.
    pub fn tear_down(&self) -> Result<(), Error> {
        self.send(DispatcherMsg::TearDown)
    }

    /// Cancel every held query silently (no callbacks), then stop.
    pub fn close_silent(&self) -> Result<(), Error> {
        self.send(DispatcherMsg::CloseSilent)
    }

    /// Stop the actor immediately; no further callbacks are observed.
    pub fn hangup(&self) {
        let _ = self.tx.unbounded_send(DispatcherMsg::Hangup);
    }

    fn send(&self, msg: DispatcherMsg) -> Result<(), Error> {
        self.tx
            .unbounded_send(msg)
            .map_err(|_| Error::internal("dispatcher is gone"))
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

/// The sequenced-dispatch actor. Construct via [`DispatcherBuilder`].
pub struct Dispatcher<T: Transport> {
    name: Option<String>,
    scheduler: ChainScheduler<Node>,
    transport: T,
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    rx: mpsc::UnboundedReceiver<DispatcherMsg>,
    parent: Option<mpsc::UnboundedSender<ParentEvent>>,
    idle: Option<Pin<Box<tokio::time::Sleep>>>,
}

enum Tick {
    Msg(Option<DispatcherMsg>),
    IdleExpired,
}

impl<T: Transport> Dispatcher<T> {
    /// Drive the actor until it is hung up, torn down, or closed. The actor
    /// keeps a sender for routing completions to itself, so dropping
    /// [`DispatcherCx`] handles alone does not stop it.
    pub async fn run(mut self) {
        let span = match &self.name {
            Some(name) => tracing::debug_span!("dispatcher", name = %name),
            None => tracing::debug_span!("dispatcher"),
        };
        async move {
            loop {
                let tick = if let Some(sleep) = self.idle.as_mut() {
                    tokio::select! {
                        msg = self.rx.next() => Tick::Msg(msg),
                        () = sleep.as_mut() => Tick::IdleExpired,
                    }
                } else {
                    Tick::Msg(self.rx.next().await)
                };
                match tick {
                    Tick::Msg(None) => break,
                    Tick::Msg(Some(msg)) => {
                        if self.handle(msg) == Flow::Stop {
                            break;
                        }
                    }
                    Tick::IdleExpired => self.idle_expired(),
                }
            }
        }
        .instrument(span)
        .await
    }

    fn handle(&mut self, msg: DispatcherMsg) -> Flow {
        match msg {
            DispatcherMsg::Submit {
                mut query,
                sink,
                chains,
            } => {
                self.idle = None;
                query.set_session_rand(chains[0].get() >> 10);
                let node = Node {
                    query_ref: query.weak(),
                    query: Some(query),
                    sink,
                    total_timeout: 0.0,
                    last_timeout: 0.0,
                };
                let task_id = self.scheduler.create_task(&chains, node);
                tracing::trace!(?task_id, "queued");
                self.drive();
                Flow::Continue
            }
            DispatcherMsg::Completed { task_id, query } => {
                self.on_completed(task_id, query);
                self.drive();
                Flow::Continue
            }
            DispatcherMsg::ResendDecision { task_id, query } => {
                self.on_resend(task_id, query);
                self.drive();
                Flow::Continue
            }
            DispatcherMsg::TearDown => {
                self.tear_down();
                Flow::Stop
            }
            DispatcherMsg::CloseSilent => {
                self.close_silent();
                Flow::Stop
            }
            DispatcherMsg::Hangup => Flow::Stop,
        }
    }

    /// Transport completion for `task_id`.
    fn on_completed(&mut self, task_id: TaskId, query: Query) {
        // A flood-wait on this completion implies the same wait for every
        // later task on this task's chains.
        let wait = query.last_timeout();
        if wait > 0.0 {
            for successor in self.scheduler.successors_of(task_id) {
                if let Some(node) = self.scheduler.get_task_extra_mut(successor) {
                    node.total_timeout += wait;
                    node.last_timeout = wait;
                }
                self.check_timeout(successor);
            }
        }

        if query.error().is_some_and(Error::is_chain_break) {
            tracing::debug!(?task_id, query_id = query.id().value(), "chain break, resending");
            let mut query = query;
            query.resend();
            let node = self
                .scheduler
                .get_task_extra_mut(task_id)
                .expect("completed task must be live");
            node.query = Some(query);
            self.scheduler.reset_task(task_id);
            self.check_timeout(task_id);
        } else {
            // The task keeps its slot while the caller decides.
            let resolver = ResendResolver::new(self.tx.clone(), task_id);
            let node = self
                .scheduler
                .get_task_extra_mut(task_id)
                .expect("completed task must be live");
            node.sink.on_result_resendable(query, resolver);
        }
    }

    /// Caller's resend decision for `task_id`.
    fn on_resend(&mut self, task_id: TaskId, query: Option<Query>) {
        if !self.scheduler.is_live(task_id) {
            tracing::trace!(?task_id, "resend decision for finished task, ignoring");
            return;
        }
        match query {
            None => self.finish_task(task_id),
            Some(query) => {
                tracing::trace!(?task_id, query_id = query.id().value(), "caller retries");
                let node = self
                    .scheduler
                    .get_task_extra_mut(task_id)
                    .expect("live task has a node");
                node.query_ref = query.weak();
                node.query = Some(query);
                self.scheduler.reset_task(task_id);
                self.check_timeout(task_id);
            }
        }
    }

    /// Fold accrued flood-wait into a pending task's query and fail it if
    /// the budget is exhausted.
    fn check_timeout(&mut self, task_id: TaskId) {
        let Some(node) = self.scheduler.get_task_extra_mut(task_id) else {
            return;
        };
        // In-flight and delegated tasks only accrue bookkeeping; the check
        // re-runs when their query comes back.
        let Some(query) = node.query.as_mut() else {
            return;
        };
        query.add_total_timeout(node.total_timeout);
        node.total_timeout = 0.0;
        if query.total_timeout() <= query.total_timeout_limit() {
            return;
        }

        let retry_after = node.last_timeout.ceil() as i64;
        tracing::warn!(
            ?task_id,
            query_id = query.id().value(),
            total_timeout = query.total_timeout(),
            limit = query.total_timeout_limit(),
            "query failed: total timeout budget exhausted"
        );
        query.set_error(Error::too_many_requests(retry_after));
        let query = node.query.take().expect("query borrowed above");
        self.scheduler.defer_task(task_id);
        let resolver = ResendResolver::new(self.tx.clone(), task_id);
        let node = self
            .scheduler
            .get_task_extra_mut(task_id)
            .expect("deferred task is live");
        node.sink.on_result_resendable(query, resolver);
    }

    fn finish_task(&mut self, task_id: TaskId) {
        tracing::trace!(?task_id, "task finished");
        self.scheduler.finish_task(task_id);
        self.notify_parent(ParentEvent::TaskFinished);
    }

    /// Transmit every runnable task, then arm the idle timer if drained.
    fn drive(&mut self) {
        while let Some(task) = self.scheduler.start_next_task() {
            let mut parents: Vec<QueryRef> = Vec::with_capacity(task.parents.len());
            for parent_id in &task.parents {
                let Some(parent) = self.scheduler.get_task_extra(*parent_id) else {
                    continue;
                };
                let parent_ref = parent.query_ref.clone();
                // A reclaimed predecessor means no hint.
                if parent_ref.is_empty() {
                    continue;
                }
                if parents
                    .iter()
                    .any(|r| r.query_id() == parent_ref.query_id())
                {
                    continue;
                }
                parents.push(parent_ref);
            }

            let node = self
                .scheduler
                .get_task_extra_mut(task.task_id)
                .expect("started task is live");
            let mut query = node.query.take().expect("started task holds its query");
            query.set_invoke_after(parents);
            query.set_last_timeout(0.0);
            tracing::trace!(
                task_id = ?task.task_id,
                query_id = query.id().value(),
                method = query.method(),
                "dispatching"
            );
            let completion = Completion::new(self.tx.clone(), task.task_id);
            self.transport.dispatch_with_callback(query, completion);
        }

        if self.parent.is_some() && self.scheduler.live_tasks() == 0 && self.idle.is_none() {
            self.idle = Some(Box::pin(tokio::time::sleep(IDLE_GRACE)));
        }
    }

    fn idle_expired(&mut self) {
        self.idle = None;
        if self.scheduler.live_tasks() != 0 {
            return;
        }
        tracing::debug!("ready to close");
        self.notify_parent(ParentEvent::ReadyToClose);
        self.idle = Some(Box::pin(tokio::time::sleep(IDLE_REARM)));
    }

    fn tear_down(&mut self) {
        for task_id in self.scheduler.live_task_ids() {
            let held = self
                .scheduler
                .get_task_extra_mut(task_id)
                .and_then(|node| node.query.take());
            if let Some(mut query) = held {
                query.set_error(Error::request_aborted());
                // The resolver is short-circuited: the task is finished
                // below, so any decision sent through it is ignored.
                let resolver = ResendResolver::new(self.tx.clone(), task_id);
                let node = self
                    .scheduler
                    .get_task_extra_mut(task_id)
                    .expect("live task has a node");
                node.sink.on_result_resendable(query, resolver);
            }
            self.finish_task(task_id);
        }
    }

    fn close_silent(&mut self) {
        self.scheduler.for_each(|_task_id, node| {
            if let Some(mut query) = node.query.take() {
                query.clear();
            }
        });
    }

    fn notify_parent(&self, event: ParentEvent) {
        if let Some(parent) = &self.parent {
            let _ = parent.unbounded_send(event);
        }
    }
}

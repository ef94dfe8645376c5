#![deny(missing_docs)]

//! # chainline — sequenced RPC dispatch over invoke-after chains
//!
//! Some transports guarantee ordered execution of requests only along
//! explicit chains: each request may carry an *invoke-after* hint naming its
//! predecessor, and the server defers it until that predecessor has run.
//! **chainline** sits between application callers and such a transport. It
//! queues requests tagged with one or more chain ids, attaches the right
//! invoke-after hints at transmission time, bounds the number of requests in
//! flight, and runs the retry machinery when chains break or the server
//! pushes back with flood-waits.
//!
//! ## The pieces
//!
//! - [`Query`] — the request handle. Owned by exactly one place at a time
//!   (dispatcher → transport → caller) and referenced weakly by its
//!   successors via [`QueryRef`].
//! - [`ChainScheduler`] — decides which queued task may be transmitted next,
//!   given its predecessors' states on every chain it belongs to.
//! - [`Dispatcher`] — the actor that owns a scheduler, talks to the
//!   [`Transport`], and delegates non-recoverable completions to the
//!   caller's [`ResultSink`] with a one-shot [`ResendResolver`].
//! - [`DispatcherPool`] — an optional per-chain pool of dispatchers,
//!   reclaiming each one after its idle grace.
//!
//! ## What is recovered, what is delegated
//!
//! Chain-break completions (the transport's resend sentinel, or `400`
//! `MSG_WAIT_FAILED` / `MSG_WAIT_TIMEOUT`) are recovered internally: the
//! query is resent and the chain's suffix re-chained, transparently to the
//! caller. Every other completion — success, transport error, or a
//! synthesized `429` when the flood-wait budget runs out — is handed to the
//! caller, who decides between retrying in place and finalizing.
//!
//! ## Quick start
//!
//! ```ignore
//! use chainline::{ChainId, DispatcherBuilder, Query};
//!
//! let (cx, dispatcher) = DispatcherBuilder::new()
//!     .name("main")
//!     .connect(transport);
//! tokio::spawn(dispatcher.run());
//!
//! let chain = ChainId::new(7).unwrap();
//! cx.submit(
//!     Query::new("messages.send", serde_json::json!({ "text": "hi" })),
//!     |query: Query, resolver: chainline::ResendResolver| {
//!         // Retry with `resolver.resend(fresh)` or settle with
//!         // `resolver.finish()`.
//!         resolver.finish();
//!     },
//!     vec![chain],
//! )?;
//! ```

mod dispatcher;
mod error;
mod pool;
mod query;
pub mod scheduler;
mod transport;

pub use dispatcher::{
    Dispatcher, DispatcherBuilder, DispatcherCx, ParentEvent, ResendResolver, ResultSink,
    MAX_SIMULTANEOUS_WAIT,
};
pub use error::{Error, RESEND_INVOKE_AFTER};
pub use pool::{DispatcherPool, PoolCx};
pub use query::{Query, QueryId, QueryRef};
pub use scheduler::{ChainId, ChainScheduler, StartedTask, TaskId};
pub use transport::{Completion, Transport};

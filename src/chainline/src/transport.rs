//! Binding to the lower-level network dispatcher.

use std::fmt;

use futures::channel::mpsc;

use crate::dispatcher::DispatcherMsg;
use crate::query::Query;
use crate::scheduler::TaskId;

/// The lower network dispatcher the sequenced dispatcher hands queries to.
///
/// Implementations own delivery: for every dispatched query exactly one
/// completion must eventually come back through the [`Completion`] token.
pub trait Transport: Send + 'static {
    /// Hand `query` to the network. The transport assigns the wire message
    /// id (see [`Query::assign_message_id`]) and later delivers the
    /// completed query through `completion`.
    fn dispatch_with_callback(&mut self, query: Query, completion: Completion);
}

/// One-shot token routing a completed query back to the owning task.
pub struct Completion {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    task_id: TaskId,
}

impl Completion {
    pub(crate) fn new(tx: mpsc::UnboundedSender<DispatcherMsg>, task_id: TaskId) -> Self {
        Completion { tx, task_id }
    }

    /// Deliver the completed query back to the dispatcher. The query should
    /// carry its result or error and, if the server advertised one, the
    /// flood-wait via [`Query::set_last_timeout`].
    pub fn complete(self, query: Query) {
        // The dispatcher may already be gone (hangup); completions for a
        // stopped dispatcher are dropped.
        let _ = self.tx.unbounded_send(DispatcherMsg::Completed {
            task_id: self.task_id,
            query,
        });
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("task_id", &self.task_id)
            .finish()
    }
}

//! The request handle owned by exactly one place at a time.
//!
//! A [`Query`] travels by value: the dispatcher holds it while the task is
//! queued, the transport holds it while it is on the wire, and the caller
//! holds it while deciding whether to resend. [`QueryRef`] is a weak handle
//! to the query's identity cell; it stays resolvable for as long as the
//! query object exists anywhere and goes empty once the query is dropped,
//! which is exactly the lifetime an invoke-after hint needs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::Error;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a query, assigned at construction and unchanged across
/// resends.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(u64);

impl QueryId {
    /// The raw id value.
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Identity cell shared between a [`Query`] and its [`QueryRef`]s.
///
/// Carries the transport-assigned message id so a successor's invoke-after
/// hint can name the predecessor even after the predecessor moved to the
/// transport.
#[derive(Debug)]
struct QueryCell {
    id: QueryId,
    /// 0 while unassigned; set by the transport at dispatch and cleared
    /// again by [`Query::resend`].
    message_id: AtomicU64,
}

#[derive(Debug)]
enum QueryStatus {
    Pending,
    Ok(Value),
    Err(Error),
    Cancelled,
}

/// An RPC request handle.
///
/// The payload is opaque to the dispatcher; only the bookkeeping fields
/// (invoke-after hints, flood-wait budget, session salt) are interpreted.
pub struct Query {
    cell: Arc<QueryCell>,
    method: String,
    payload: Value,
    status: QueryStatus,
    invoke_after: Vec<QueryRef>,
    session_rand: u64,
    last_timeout: f64,
    total_timeout: f64,
    total_timeout_limit: f64,
}

impl Query {
    /// Create a query for `method` with an opaque JSON payload.
    ///
    /// The total-timeout limit defaults to 7 seconds; override it with
    /// [`Query::with_total_timeout_limit`].
    pub fn new(method: impl Into<String>, payload: Value) -> Self {
        let id = QueryId(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed));
        Query {
            cell: Arc::new(QueryCell {
                id,
                message_id: AtomicU64::new(0),
            }),
            method: method.into(),
            payload,
            status: QueryStatus::Pending,
            invoke_after: Vec::new(),
            session_rand: 0,
            last_timeout: 0.0,
            total_timeout: 0.0,
            total_timeout_limit: 7.0,
        }
    }

    /// Set the ceiling on accumulated flood-wait seconds; exceeding it fails
    /// the query with a synthesized 429.
    pub fn with_total_timeout_limit(mut self, limit: f64) -> Self {
        self.total_timeout_limit = limit;
        self
    }

    /// Stable identity of this query.
    pub fn id(&self) -> QueryId {
        self.cell.id
    }

    /// The RPC method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The opaque payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Whether the query carries an error.
    pub fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Err(_))
    }

    /// The error, if any.
    pub fn error(&self) -> Option<&Error> {
        match &self.status {
            QueryStatus::Err(error) => Some(error),
            _ => None,
        }
    }

    /// The error code, if the query carries an error.
    pub fn error_code(&self) -> Option<i32> {
        self.error().map(|error| error.code)
    }

    /// The error message, if the query carries an error.
    pub fn error_message(&self) -> Option<&str> {
        self.error().map(|error| error.message.as_str())
    }

    /// The successful result, if any.
    pub fn result(&self) -> Option<&Value> {
        match &self.status {
            QueryStatus::Ok(value) => Some(value),
            _ => None,
        }
    }

    /// Mark the query completed successfully.
    pub fn set_ok(&mut self, value: Value) {
        self.status = QueryStatus::Ok(value);
    }

    /// Mark the query failed. Subsequent inspection yields this error.
    pub fn set_error(&mut self, error: Error) {
        self.status = QueryStatus::Err(error);
    }

    /// Cancel the query silently: no callback will observe it.
    pub fn clear(&mut self) {
        self.status = QueryStatus::Cancelled;
    }

    /// Whether the query was cancelled via [`Query::clear`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self.status, QueryStatus::Cancelled)
    }

    /// Replace the predecessor hint list. An empty list means no predecessor.
    pub fn set_invoke_after(&mut self, refs: Vec<QueryRef>) {
        self.invoke_after = refs;
    }

    /// The predecessor hints attached at the latest transmission.
    pub fn invoke_after(&self) -> &[QueryRef] {
        &self.invoke_after
    }

    /// Prepare the same logical request for retransmission: clears the
    /// completion state, the transport-assigned message id, and the
    /// predecessor hints. Identity and the accumulated wait budget survive.
    pub fn resend(&mut self) {
        self.status = QueryStatus::Pending;
        self.invoke_after.clear();
        self.cell.message_id.store(0, Ordering::Relaxed);
    }

    /// A weak handle usable as an invoke-after target by successors.
    pub fn weak(&self) -> QueryRef {
        QueryRef(Arc::downgrade(&self.cell))
    }

    /// Transport-session salt, stamped by the dispatcher from the first
    /// chain id.
    pub fn session_rand(&self) -> u64 {
        self.session_rand
    }

    /// Stamp the transport-session salt.
    pub fn set_session_rand(&mut self, salt: u64) {
        self.session_rand = salt;
    }

    /// Server-advertised flood-wait in seconds for the latest completion
    /// (0 if none).
    pub fn last_timeout(&self) -> f64 {
        self.last_timeout
    }

    /// Record the server-advertised flood-wait for a completion. Set by the
    /// transport; cleared by the dispatcher just before transmission.
    pub fn set_last_timeout(&mut self, seconds: f64) {
        self.last_timeout = seconds;
    }

    /// Accumulated flood-wait budget consumed so far.
    pub fn total_timeout(&self) -> f64 {
        self.total_timeout
    }

    /// The ceiling on the accumulated budget.
    pub fn total_timeout_limit(&self) -> f64 {
        self.total_timeout_limit
    }

    pub(crate) fn add_total_timeout(&mut self, seconds: f64) {
        self.total_timeout += seconds;
    }

    /// The transport-assigned message id, once dispatched.
    pub fn message_id(&self) -> Option<u64> {
        match self.cell.message_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    /// Record the message id chosen by the transport for this transmission.
    pub fn assign_message_id(&self, message_id: u64) {
        self.cell.message_id.store(message_id, Ordering::Relaxed);
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.cell.id)
            .field("method", &self.method)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Weak reference to a query, used as an invoke-after target.
///
/// Resolvable while the referent query object exists anywhere; empty after
/// it is dropped. An empty reference is treated as "no predecessor".
#[derive(Clone, Debug, Default)]
pub struct QueryRef(Weak<QueryCell>);

impl QueryRef {
    /// A reference that never resolves.
    pub fn empty() -> Self {
        QueryRef(Weak::new())
    }

    /// Whether the referent no longer exists.
    pub fn is_empty(&self) -> bool {
        self.0.strong_count() == 0
    }

    /// The referent's stable query id, if it still exists.
    pub fn query_id(&self) -> Option<QueryId> {
        self.0.upgrade().map(|cell| cell.id)
    }

    /// The referent's transport-assigned message id, if it still exists and
    /// has been dispatched.
    pub fn message_id(&self) -> Option<u64> {
        let cell = self.0.upgrade()?;
        match cell.message_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }
}

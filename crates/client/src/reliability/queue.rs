//! Request queue
//!
//! A priority queue of pending requests: higher priority dispatches
//! first, FIFO among equals (enforced by a monotonic sequence number in
//! the heap ordering). The queue itself is passive storage; admission
//! rules, timeouts and rejection live in the orchestrator.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use meridian_error::Result;
use tokio::sync::oneshot;
use url::Url;

use crate::transport::ApiResponse;

/// The deferred execution closure: given the resolved zone base URL,
/// performs one HTTP attempt. Cloned per attempt, so retries and
/// failover re-invoke it freely.
pub type RequestFn = Arc<dyn Fn(Url) -> BoxFuture<'static, Result<ApiResponse>> + Send + Sync>;

/// Caller-supplied options for a queued request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Dispatch priority, 0–10; higher first.
    pub priority: u8,
    /// Overall budget for queue wait plus execution; `None` uses the
    /// queue default.
    pub timeout: Option<Duration>,
    /// Whether exhausted transient failures may fail over to another
    /// zone; non-retryable errors always surface immediately.
    pub retryable: bool,
    /// Free-form metadata carried into error context.
    pub metadata: HashMap<String, String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            timeout: None,
            retryable: true,
            metadata: HashMap::new(),
        }
    }
}

impl RequestOptions {
    /// Set the dispatch priority (0–10).
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(10);
        self
    }

    /// Set the overall timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark the request non-retryable.
    #[must_use]
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One logical request travelling through the pipeline.
pub(crate) struct RequestEnvelope {
    pub id: String,
    /// Endpoint root used for circuit keying and observability.
    pub endpoint: String,
    pub method: String,
    /// Pinned zone, when the caller routed explicitly.
    pub zone: Option<String>,
    pub priority: u8,
    pub timeout: Duration,
    pub retryable: bool,
    pub metadata: HashMap<String, String>,
    pub enqueued_at: Instant,
    pub operation: RequestFn,
}

/// A queued request: envelope plus its place in line and reply channel.
pub(crate) struct QueuedRequest {
    pub envelope: RequestEnvelope,
    pub seq: u64,
    pub reply: oneshot::Sender<Result<ApiResponse>>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.envelope.priority == other.envelope.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.envelope
            .priority
            .cmp(&other.envelope.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Passive priority queue storage.
#[derive(Default)]
pub(crate) struct RequestQueue {
    heap: BinaryHeap<QueuedRequest>,
    next_seq: u64,
}

impl RequestQueue {
    pub fn push(
        &mut self,
        envelope: RequestEnvelope,
        reply: oneshot::Sender<Result<ApiResponse>>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedRequest {
            envelope,
            seq,
            reply,
        });
    }

    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.heap.pop()
    }

    /// Put an entry back without assigning a fresh sequence number, so
    /// its FIFO position within its priority is preserved.
    pub fn requeue(&mut self, entry: QueuedRequest) {
        self.heap.push(entry);
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove and return everything pending.
    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        self.heap.drain().collect()
    }
}

/// Snapshot of queue activity.
#[derive(Debug, Clone)]
pub struct QueueStatistics {
    /// Requests waiting for dispatch.
    pub depth: usize,
    /// Requests currently executing.
    pub in_flight: usize,
    /// Requests admitted since construction.
    pub total_enqueued: u64,
    /// Requests handed to the pipeline.
    pub total_dispatched: u64,
    /// Requests refused at admission (full queue, load shedding).
    pub total_rejected: u64,
    /// Requests that timed out before completing.
    pub total_expired: u64,
    /// Mean time from enqueue to dispatch.
    pub average_wait: Duration,
    /// Whether degraded mode is engaged.
    pub degraded_mode: bool,
}

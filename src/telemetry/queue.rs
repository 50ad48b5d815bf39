//! Off-request-path delivery of security events.

use super::events::SecurityEvent;
use super::sinks::{emit_best_effort, SecuritySink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Events held for the sink before new ones are dropped.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

enum Message {
    Event(SecurityEvent),
    Flush(oneshot::Sender<()>),
}

/// Bounded queue in front of a sink, drained by a worker task.
///
/// [`push`](Self::push) never waits: when the queue is full the event is
/// dropped and counted. Each delivery is bounded by the sink timeout so one
/// stuck call cannot stall the queue. The worker is spawned on the first push,
/// which lets a queue be built outside a runtime.
pub struct EventQueue<S> {
    sink: S,
    tx: OnceLock<mpsc::Sender<Message>>,
    capacity: usize,
    timeout: Duration,
    dropped: AtomicU64,
}

impl<S> std::fmt::Debug for EventQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("capacity", &self.capacity)
            .field("timeout", &self.timeout)
            .field("started", &self.tx.get().is_some())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl<S> EventQueue<S> {
    pub fn new(sink: S, capacity: usize, timeout: Duration) -> Self {
        Self {
            sink,
            tx: OnceLock::new(),
            capacity: capacity.max(1),
            timeout,
            dropped: AtomicU64::new(0),
        }
    }

    /// Events dropped because the queue was full or the worker was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bound on a single sink delivery.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S> EventQueue<S>
where
    S: SecuritySink,
    S::Future: Send + 'static,
{
    fn sender(&self) -> &mpsc::Sender<Message> {
        self.tx.get_or_init(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            tokio::spawn(drain(self.sink.clone(), rx, self.timeout));
            tx
        })
    }

    /// Enqueue `event` for delivery. Must be called inside a tokio runtime.
    pub fn push(&self, event: SecurityEvent) {
        let kind = event.kind;
        if self.sender().try_send(Message::Event(event)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(target: "abuseguard::sink", kind = %kind, "security event queue full; dropping");
        }
    }

    /// Wait until every event pushed so far has been delivered or timed out.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender().send(Message::Flush(ack)).await.is_ok() {
            done.await.ok();
        }
    }
}

async fn drain<S>(sink: S, mut rx: mpsc::Receiver<Message>, timeout: Duration)
where
    S: SecuritySink,
    S::Future: Send + 'static,
{
    while let Some(message) = rx.recv().await {
        match message {
            Message::Event(event) => {
                let kind = event.kind;
                if tokio::time::timeout(timeout, emit_best_effort(sink.clone(), event))
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        target: "abuseguard::sink",
                        kind = %kind,
                        timeout_ms = timeout.as_millis() as u64,
                        "security sink timed out; event dropped"
                    );
                }
            }
            Message::Flush(ack) => {
                ack.send(()).ok();
            }
        }
    }
}

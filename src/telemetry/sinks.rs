use super::events::SecurityEvent;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower::Service;

type SinkFuture<E> = BoxFuture<'static, Result<(), E>>;

/// A sink that receives security events.
pub trait SecuritySink:
    tower::Service<SecurityEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` without letting the sink affect the caller.
///
/// Waits for readiness, then calls the sink; any error is logged and dropped.
pub async fn emit_best_effort<S>(sink: S, event: SecurityEvent)
where
    S: tower::Service<SecurityEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    let kind = event.kind;
    let result = match sink.ready_oneshot().await {
        Ok(mut ready_sink) => ready_sink.call(event).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!(target: "abuseguard::sink", kind = %kind, error = %e, "security event dropped");
    }
}

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<SecurityEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: SecurityEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl SecuritySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<SecurityEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        tracing::info!(
            target: "abuseguard::security",
            kind = %event.kind,
            actor = %event.actor_id,
            action = %event.action,
            score = event.score,
            recent = event.violation_count_recent,
            "security_event"
        );
        Box::pin(async { Ok(()) })
    }
}

impl SecuritySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory, evicting the oldest past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SecurityEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<SecurityEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.guard().clone()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<SecurityEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        let mut guard = self.guard();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl SecuritySink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to any number of subscribers (operator dashboards, alerting).
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: Arc<tokio::sync::broadcast::Sender<SecurityEvent>>,
    dropped: Arc<AtomicU64>,
    last_drop_ns: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
            dropped: Arc::new(AtomicU64::new(0)),
            last_drop_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SecurityEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events sent while nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn last_drop(&self) -> Option<SystemTime> {
        match self.last_drop_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => UNIX_EPOCH.checked_add(Duration::from_nanos(ns)),
        }
    }
}

impl Service<SecurityEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
            self.last_drop_ns.store(u64::try_from(ns).unwrap_or(u64::MAX), Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl SecuritySink for StreamingSink {
    type SinkError = Infallible;
}

/// Error from a composed sink.
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "security sink error: {}", self.0)
    }
}

impl ComposedSinkError {
    fn from_inner<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self(Box::new(err))
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Wait for `sink` to be ready, then hand it `event`.
async fn deliver<S>(sink: S, event: SecurityEvent) -> Result<(), ComposedSinkError>
where
    S: tower::Service<SecurityEvent, Response = ()>,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    use tower::ServiceExt;

    let mut ready = sink.ready_oneshot().await.map_err(ComposedSinkError::from_inner)?;
    ready.call(event).await.map_err(ComposedSinkError::from_inner)
}

/// Sends every event to both sinks, e.g. an audit log and an alerting stream.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<SecurityEvent> for MulticastSink<A, B>
where
    A: tower::Service<SecurityEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<SecurityEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        let sink_a = self.sink_a.clone();
        let sink_b = self.sink_b.clone();
        let copy = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(deliver(sink_a, event), deliver(sink_b, copy));
            res_a.and(res_b)
        })
    }
}

impl<A, B> SecuritySink for MulticastSink<A, B>
where
    A: tower::Service<SecurityEvent, Response = ()> + Clone + Send + Sync + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<SecurityEvent, Response = ()> + Clone + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}

/// Tries `primary`; on error delivers to `fallback` instead.
#[derive(Clone, Debug)]
pub struct FallbackSink<A, B> {
    primary: A,
    fallback: B,
}

impl<A, B> FallbackSink<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

impl<A, B> Service<SecurityEvent> for FallbackSink<A, B>
where
    A: tower::Service<SecurityEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<SecurityEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        let primary = self.primary.clone();
        let fallback = self.fallback.clone();
        let copy = event.clone();

        Box::pin(async move {
            match deliver(primary, event).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::debug!(target: "abuseguard::sink", error = %e, "primary sink failed; using fallback");
                    deliver(fallback, copy).await
                }
            }
        })
    }
}

impl<A, B> SecuritySink for FallbackSink<A, B>
where
    A: tower::Service<SecurityEvent, Response = ()> + Clone + Send + Sync + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<SecurityEvent, Response = ()> + Clone + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ActorId;
    use crate::telemetry::events::SecurityEventKind;

    fn event(kind: SecurityEventKind, actor: &str) -> SecurityEvent {
        SecurityEvent::new(kind, 0.0, ActorId::from(actor), "login", 10.0, 1)
    }

    #[derive(Clone, Debug)]
    struct Fails;

    impl Service<SecurityEvent> for Fails {
        type Response = ();
        type Error = std::io::Error;
        type Future = SinkFuture<Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, _req: SecurityEvent) -> Self::Future {
            Box::pin(async { Err(std::io::Error::new(std::io::ErrorKind::Other, "audit down")) })
        }
    }

    impl SecuritySink for Fails {
        type SinkError = std::io::Error;
    }

    /// Rejects calls that were not preceded by a successful `poll_ready`,
    /// like a buffered or concurrency-limited service would.
    #[derive(Clone, Debug, Default)]
    struct NeedsReady {
        polled: bool,
        delivered: Arc<AtomicU64>,
    }

    impl Service<SecurityEvent> for NeedsReady {
        type Response = ();
        type Error = std::io::Error;
        type Future = SinkFuture<Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.polled = true;
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, _req: SecurityEvent) -> Self::Future {
            let polled = std::mem::take(&mut self.polled);
            let delivered = self.delivered.clone();
            Box::pin(async move {
                if !polled {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "called before ready"));
                }
                delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_events() {
        NullSink.call(event(SecurityEventKind::RateLimitViolation, "a")).await.unwrap();
        LogSink.call(event(SecurityEventKind::ActorAutoBlocked, "a")).await.unwrap();
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        let e1 = event(SecurityEventKind::RateLimitViolation, "a");
        let e2 = event(SecurityEventKind::AbuseScoreEscalated, "b");
        let e3 = event(SecurityEventKind::ActorAutoBlocked, "c");
        sink.call(e1).await.unwrap();
        sink.call(e2.clone()).await.unwrap();
        sink.call(e3.clone()).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events(), vec![e2, e3]);
        assert_eq!(sink.capacity(), 2);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn streaming_sink_counts_drops_without_subscribers() {
        let sink = StreamingSink::new(1);
        let mut tx = sink.clone();
        tx.call(event(SecurityEventKind::RateLimitViolation, "a")).await.unwrap();
        assert_eq!(sink.dropped_count(), 1);
        assert!(sink.last_drop().is_some());
    }

    #[tokio::test]
    async fn streaming_sink_delivers_to_subscriber() {
        let sink = StreamingSink::new(8);
        let mut rx = sink.subscribe();
        assert_eq!(sink.receiver_count(), 1);
        let mut tx = sink.clone();
        tx.call(event(SecurityEventKind::ActorAutoBlocked, "a")).await.unwrap();
        let got = rx.recv().await.expect("message");
        assert_eq!(got.kind, SecurityEventKind::ActorAutoBlocked);
    }

    #[tokio::test]
    async fn emit_best_effort_swallows_errors() {
        emit_best_effort(Fails, event(SecurityEventKind::RateLimitViolation, "a")).await;
    }

    #[tokio::test]
    async fn multicast_reaches_both() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let mut sink = MulticastSink::new(a.clone(), b.clone());
        sink.call(event(SecurityEventKind::RateLimitViolation, "a")).await.unwrap();
        assert_eq!((a.len(), b.len()), (1, 1));
    }

    #[tokio::test]
    async fn fallback_used_when_primary_fails() {
        let backup = MemorySink::new();
        let mut sink = FallbackSink::new(Fails, backup.clone());
        sink.call(event(SecurityEventKind::ActorAutoBlocked, "a")).await.unwrap();
        assert_eq!(backup.len(), 1);

        let mut failing = MulticastSink::new(Fails, NullSink);
        let err = failing.call(event(SecurityEventKind::ActorAutoBlocked, "a")).await.unwrap_err();
        assert!(err.to_string().contains("audit down"));
    }

    #[tokio::test]
    async fn composed_sinks_wait_for_readiness() {
        let inner = NeedsReady::default();
        let mut multicast = MulticastSink::new(inner.clone(), NullSink);
        multicast.call(event(SecurityEventKind::RateLimitViolation, "a")).await.unwrap();
        assert_eq!(inner.delivered.load(Ordering::Relaxed), 1);

        let backup = MemorySink::new();
        let mut fallback = FallbackSink::new(inner.clone(), backup.clone());
        fallback.call(event(SecurityEventKind::RateLimitViolation, "a")).await.unwrap();
        assert_eq!(inner.delivered.load(Ordering::Relaxed), 2);
        assert!(backup.is_empty());
    }
}

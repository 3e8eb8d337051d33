//! # Event Stream
//!
//! The resilient ingestion loop. Two nested loops:
//!
//! 1. **Connection loop** (`run`): dial the server. If the link fails, the error
//!    is classified. Retriable failures (network drop, refused connection) are
//!    retried after a fixed delay when the stream runs in daemon mode; fatal
//!    failures (bad key, rejected credentials, unresolvable host) end ingestion.
//! 2. **Session loop** (`run_connection`): open a session over the link, decode its
//!    output onto the event queue, and when the session ends or its output fails
//!    to decode, tear it down and open the next one over the same link.
//!
//! Pushing onto the event queue waits while the queue is full, which stalls the
//! session read loop: ingestion slows down rather than dropping events. Partial
//! documents are discarded with their session and there is no resume cursor;
//! events published while disconnected are lost.
//!
//! The loop has no read timeout of its own: a session that goes quiet is
//! waited on until the transport ends it. Dead-peer detection belongs to the
//! transport (SSH keepalives for `gerrit_ssh`), since a healthy event stream
//! can be idle for hours.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use super::decoder::{DecodeError, EventDecoder, LineBuffer, DEFAULT_MAX_EVENT_BYTES};
use super::transport::{EventLink, EventSession, EventTransport, SessionOutput};
use crate::document::{event_type, Document};

/// Default capacity of the inbound event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Default pause before redialing after a retriable failure.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Connection-level ingestion failures.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The private key could not be read or parsed.
    #[error("failed to load private key {path}: {reason}")]
    KeyLoad {
        /// Key file path.
        path: String,
        /// Loader error.
        reason: String,
    },

    /// The server host name does not resolve.
    #[error("cannot resolve {host}: {reason}")]
    UnresolvableHost {
        /// Host as configured.
        host: String,
        /// Resolver error.
        reason: String,
    },

    /// The server refused our key.
    #[error("public key authentication rejected for user '{0}'")]
    AuthenticationRejected(String),

    /// Dialing or the protocol handshake failed.
    #[error("failed to connect to {addr}: {reason}")]
    Connect {
        /// Address dialed.
        addr: String,
        /// Transport error.
        reason: String,
    },

    /// An established connection went away.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// A session could not be opened or started over a live connection.
    #[error("session failed: {0}")]
    Channel(String),
}

impl IngestError {
    /// True for failures a later redial may cure.
    pub fn is_retriable(&self) -> bool {
        match self {
            IngestError::KeyLoad { .. }
            | IngestError::UnresolvableHost { .. }
            | IngestError::AuthenticationRejected(_) => false,
            IngestError::Connect { .. } | IngestError::Disconnected(_) | IngestError::Channel(_) => true,
        }
    }
}

/// Tuning for the ingestion loop.
#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// Keep reconnecting after retriable failures instead of giving up.
    pub daemon: bool,
    /// Fixed pause before each redial.
    pub reconnect_delay: Duration,
    /// Largest single event accepted; a bigger one restarts the session.
    pub max_event_bytes: usize,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            daemon: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_event_bytes: DEFAULT_MAX_EVENT_BYTES,
        }
    }
}

/// Counters describing ingestion so far.
#[derive(Debug, Default)]
pub struct IngestStats {
    connections: AtomicU64,
    sessions: AtomicU64,
    documents: AtomicU64,
    decode_failures: AtomicU64,
}

impl IngestStats {
    /// Outer connections established.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Sessions opened across all connections.
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Documents pushed onto the event queue.
    pub fn documents(&self) -> u64 {
        self.documents.load(Ordering::Relaxed)
    }

    /// Sessions torn down because their output did not decode.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

enum SessionEnd {
    Ended,
    DecodeFailed(DecodeError),
    QueueClosed,
}

/// The ingestion client: owns a transport and the sending half of the event queue.
pub struct EventStream<T: EventTransport> {
    transport: T,
    output: mpsc::Sender<Document>,
    config: EventStreamConfig,
    stats: Arc<IngestStats>,
}

impl<T: EventTransport> EventStream<T> {
    /// Creates the bounded inbound event queue.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Document>, mpsc::Receiver<Document>) {
        mpsc::channel(capacity.max(1))
    }

    /// Creates a stream that pushes decoded documents onto `output`.
    pub fn new(transport: T, output: mpsc::Sender<Document>, config: EventStreamConfig) -> Self {
        Self {
            transport,
            output,
            config,
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Shared handle on the ingestion counters.
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until a fatal failure, or until the event queue's receiver is gone.
    ///
    /// Returns `Ok(())` only in the latter case.
    pub async fn run(&self) -> Result<(), IngestError> {
        let endpoint = self.transport.endpoint();
        loop {
            let err = match self.run_connection().await {
                Ok(()) => {
                    tracing::info!(target: "ingest", "event queue closed, ingestion from {} stopped", endpoint);
                    return Ok(());
                }
                Err(e) => e,
            };

            if err.is_retriable() && self.config.daemon {
                tracing::warn!(
                    target: "ingest",
                    "ingestion from {} interrupted: {}. Reconnecting in {}ms",
                    endpoint,
                    err,
                    self.config.reconnect_delay.as_millis()
                );
                tokio::time::sleep(self.config.reconnect_delay).await;
                continue;
            }

            tracing::error!(target: "ingest", "ingestion from {} failed: {}", endpoint, err);
            return Err(err);
        }
    }

    async fn run_connection(&self) -> Result<(), IngestError> {
        let mut link = self.transport.connect().await?;
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        tracing::info!(target: "ingest", "connected to {}", self.transport.endpoint());

        loop {
            let mut session = link.open_session().await?;
            self.stats.sessions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target: "ingest", "event session opened");

            match self.pump_session(&mut session).await {
                SessionEnd::QueueClosed => {
                    session.close().await;
                    return Ok(());
                }
                SessionEnd::Ended => {
                    tracing::info!(target: "ingest", "event session ended, opening a new one");
                }
                SessionEnd::DecodeFailed(e) => {
                    self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(target: "ingest", "{}; restarting event session", e);
                    session.close().await;
                }
            }
        }
    }

    async fn pump_session(&self, session: &mut <T::Link as EventLink>::Session) -> SessionEnd {
        let mut decoder = EventDecoder::with_limit(self.config.max_event_bytes);
        let mut diagnostics = LineBuffer::new();
        let mut batch = Vec::new();

        while let Some(output) = session.next_output().await {
            match output {
                SessionOutput::Events(bytes) => {
                    let decoded = decoder.feed(&bytes, &mut batch);
                    for doc in batch.drain(..) {
                        tracing::trace!(
                            target: "ingest",
                            "decoded event type={}",
                            event_type(&doc).unwrap_or("<none>")
                        );
                        if self.output.send(doc).await.is_err() {
                            return SessionEnd::QueueClosed;
                        }
                        self.stats.documents.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Err(e) = decoded {
                        return SessionEnd::DecodeFailed(e);
                    }
                }
                SessionOutput::Diagnostics(bytes) => {
                    for line in diagnostics.push(&bytes) {
                        tracing::warn!(target: "ingest", "stderr: {}", line);
                    }
                }
                SessionOutput::Exited(status) => {
                    tracing::info!(target: "ingest", "event command exited with status {}", status);
                }
            }
        }

        if let Some(line) = diagnostics.finish() {
            tracing::warn!(target: "ingest", "stderr: {}", line);
        }
        if decoder.pending() > 0 {
            tracing::debug!(target: "ingest", "discarding {} bytes of a partial event", decoder.pending());
        }
        SessionEnd::Ended
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// What a scripted link does when asked for a session.
    pub(crate) enum ScriptedSession {
        Output(Vec<SessionOutput>),
        /// Produces nothing until the sender is dropped, then ends.
        Stall(oneshot::Receiver<()>),
        Fail(IngestError),
    }

    /// A transport that replays scripted connections, one per `connect` call.
    pub(crate) struct ScriptedTransport {
        links: Mutex<VecDeque<Result<Vec<ScriptedSession>, IngestError>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(links: Vec<Result<Vec<ScriptedSession>, IngestError>>) -> Self {
            Self {
                links: Mutex::new(links.into()),
            }
        }
    }

    pub(crate) struct ScriptedLink {
        sessions: VecDeque<ScriptedSession>,
    }

    pub(crate) struct ScriptedOutput {
        chunks: VecDeque<SessionOutput>,
        stall: Option<oneshot::Receiver<()>>,
    }

    #[async_trait]
    impl EventTransport for ScriptedTransport {
        type Link = ScriptedLink;

        async fn connect(&self) -> Result<ScriptedLink, IngestError> {
            let next = self.links.lock().unwrap().pop_front();
            match next {
                Some(Ok(sessions)) => Ok(ScriptedLink {
                    sessions: sessions.into(),
                }),
                Some(Err(e)) => Err(e),
                None => Err(IngestError::AuthenticationRejected("script exhausted".to_string())),
            }
        }

        fn endpoint(&self) -> String {
            "scripted".to_string()
        }
    }

    #[async_trait]
    impl EventLink for ScriptedLink {
        type Session = ScriptedOutput;

        async fn open_session(&mut self) -> Result<ScriptedOutput, IngestError> {
            match self.sessions.pop_front() {
                Some(ScriptedSession::Output(chunks)) => Ok(ScriptedOutput {
                    chunks: chunks.into(),
                    stall: None,
                }),
                Some(ScriptedSession::Stall(gate)) => Ok(ScriptedOutput {
                    chunks: VecDeque::new(),
                    stall: Some(gate),
                }),
                Some(ScriptedSession::Fail(e)) => Err(e),
                None => Err(IngestError::Disconnected("link closed".to_string())),
            }
        }
    }

    #[async_trait]
    impl EventSession for ScriptedOutput {
        async fn next_output(&mut self) -> Option<SessionOutput> {
            if let Some(gate) = self.stall.take() {
                let _ = gate.await;
                return None;
            }
            self.chunks.pop_front()
        }
    }

    pub(crate) fn events(text: &str) -> SessionOutput {
        SessionOutput::Events(text.as_bytes().to_vec())
    }

    fn fast(daemon: bool) -> EventStreamConfig {
        EventStreamConfig {
            daemon,
            reconnect_delay: Duration::from_millis(5),
            ..EventStreamConfig::default()
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Document>) -> Vec<Document> {
        let mut out = Vec::new();
        while let Some(doc) = rx.recv().await {
            out.push(doc);
        }
        out
    }

    #[test]
    fn test_error_classification() {
        assert!(IngestError::Connect { addr: "h:1".into(), reason: "refused".into() }.is_retriable());
        assert!(IngestError::Disconnected("reset".into()).is_retriable());
        assert!(IngestError::Channel("eof".into()).is_retriable());
        assert!(!IngestError::AuthenticationRejected("u".into()).is_retriable());
        assert!(!IngestError::UnresolvableHost { host: "h".into(), reason: "nx".into() }.is_retriable());
        assert!(!IngestError::KeyLoad { path: "k".into(), reason: "bad".into() }.is_retriable());
    }

    #[tokio::test]
    async fn test_session_restart_over_same_link() {
        let transport = ScriptedTransport::new(vec![Ok(vec![
            // Ends mid-document: the partial object is dropped.
            ScriptedSession::Output(vec![events("{\"type\":\"a\"}\n{\"type\":\"b")]),
            ScriptedSession::Output(vec![
                SessionOutput::Diagnostics(b"warning\n".to_vec()),
                events("{\"type\":\"c\"}"),
            ]),
        ])]);
        let (tx, rx) = EventStream::<ScriptedTransport>::channel(DEFAULT_QUEUE_CAPACITY);
        let stream = EventStream::new(transport, tx, fast(false));

        // Link exhausts -> retriable, but not daemon -> the run ends with the error.
        let err = stream.run().await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(stream.stats().connections(), 1);
        assert_eq!(stream.stats().sessions(), 2);
        drop(stream);

        assert_eq!(drain(rx).await, vec![json!({"type": "a"}), json!({"type": "c"})]);
    }

    #[tokio::test]
    async fn test_decode_failure_restarts_session() {
        let transport = ScriptedTransport::new(vec![Ok(vec![
            ScriptedSession::Output(vec![events("{\"type\":\"a\"} garbage {\"type\":\"lost\"}")]),
            ScriptedSession::Output(vec![events("{\"type\":\"b\"}")]),
        ])]);
        let (tx, rx) = EventStream::<ScriptedTransport>::channel(DEFAULT_QUEUE_CAPACITY);
        let stream = EventStream::new(transport, tx, fast(false));

        assert!(stream.run().await.is_err());
        assert_eq!(stream.stats().decode_failures(), 1);
        assert_eq!(stream.stats().sessions(), 2);
        drop(stream);

        assert_eq!(drain(rx).await, vec![json!({"type": "a"}), json!({"type": "b"})]);
    }

    #[tokio::test]
    async fn test_daemon_reconnects_after_retriable_failure() {
        let transport = ScriptedTransport::new(vec![
            Err(IngestError::Connect { addr: "h:29418".into(), reason: "refused".into() }),
            Ok(vec![ScriptedSession::Output(vec![events("{\"type\":\"a\"}")])]),
            Ok(vec![ScriptedSession::Output(vec![events("{\"type\":\"b\"}")])]),
            Err(IngestError::AuthenticationRejected("autodeploy".into())),
        ]);
        let (tx, rx) = EventStream::<ScriptedTransport>::channel(DEFAULT_QUEUE_CAPACITY);
        let stream = EventStream::new(transport, tx, fast(true));

        let err = stream.run().await.unwrap_err();
        assert!(matches!(err, IngestError::AuthenticationRejected(_)));
        assert_eq!(stream.stats().connections(), 2);
        drop(stream);

        assert_eq!(drain(rx).await, vec![json!({"type": "a"}), json!({"type": "b"})]);
    }

    #[tokio::test]
    async fn test_without_daemon_retriable_failure_is_final() {
        let transport = ScriptedTransport::new(vec![
            Err(IngestError::Connect { addr: "h:29418".into(), reason: "refused".into() }),
            Ok(vec![ScriptedSession::Output(vec![events("{\"type\":\"a\"}")])]),
        ]);
        let (tx, _rx) = EventStream::<ScriptedTransport>::channel(DEFAULT_QUEUE_CAPACITY);
        let stream = EventStream::new(transport, tx, fast(false));

        assert!(matches!(stream.run().await, Err(IngestError::Connect { .. })));
        assert_eq!(stream.stats().connections(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_stops_ingestion() {
        let transport = ScriptedTransport::new(vec![Ok(vec![ScriptedSession::Output(vec![events(
            "{\"type\":\"a\"}",
        )])])]);
        let (tx, rx) = EventStream::<ScriptedTransport>::channel(1);
        drop(rx);
        let stream = EventStream::new(transport, tx, fast(true));

        assert!(stream.run().await.is_ok());
        assert_eq!(stream.stats().documents(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let transport = ScriptedTransport::new(vec![Ok(vec![ScriptedSession::Output(vec![events(
            "{\"n\":1}{\"n\":2}{\"n\":3}",
        )])])]);
        let (tx, mut rx) = EventStream::<ScriptedTransport>::channel(1);
        let stream = Arc::new(EventStream::new(transport, tx, fast(false)));

        let runner = Arc::clone(&stream);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Only one slot: the loop is parked on the second push.
        assert_eq!(stream.stats().documents(), 1);
        assert!(!handle.is_finished());

        for n in 1..=3 {
            assert_eq!(rx.recv().await.unwrap(), json!({"n": n}));
        }
        assert!(handle.await.unwrap().is_err());
        assert_eq!(stream.stats().documents(), 3);
    }

    #[tokio::test]
    async fn test_session_failure_on_live_link_reconnects() {
        let transport = ScriptedTransport::new(vec![
            Ok(vec![
                ScriptedSession::Output(vec![events("{\"type\":\"a\"}")]),
                ScriptedSession::Fail(IngestError::Channel("exec request refused".into())),
            ]),
            Ok(vec![ScriptedSession::Output(vec![events("{\"type\":\"b\"}")])]),
        ]);
        let (tx, rx) = EventStream::<ScriptedTransport>::channel(DEFAULT_QUEUE_CAPACITY);
        let stream = EventStream::new(transport, tx, fast(true));

        // Script exhausted after the second link: rejected dial ends the run.
        assert!(matches!(stream.run().await, Err(IngestError::AuthenticationRejected(_))));
        assert_eq!(stream.stats().connections(), 2);
        assert_eq!(stream.stats().sessions(), 2);
        drop(stream);

        assert_eq!(drain(rx).await, vec![json!({"type": "a"}), json!({"type": "b"})]);
    }

    #[tokio::test]
    async fn test_quiet_session_waits_for_transport_to_end_it() {
        let (gate_tx, gate_rx) = oneshot::channel();
        let transport = ScriptedTransport::new(vec![
            Ok(vec![ScriptedSession::Stall(gate_rx)]),
            Ok(vec![ScriptedSession::Output(vec![events("{\"type\":\"after\"}")])]),
        ]);
        let (tx, mut rx) = EventStream::<ScriptedTransport>::channel(DEFAULT_QUEUE_CAPACITY);
        let stream = Arc::new(EventStream::new(transport, tx, fast(true)));

        let runner = Arc::clone(&stream);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // No read timeout in the loop: still parked on the first session.
        assert!(!handle.is_finished());
        assert_eq!(stream.stats().connections(), 1);
        assert_eq!(stream.stats().sessions(), 1);

        // The transport gives up on the peer (keepalive expiry).
        drop(gate_tx);
        assert_eq!(rx.recv().await, Some(json!({"type": "after"})));
        assert!(handle.await.unwrap().is_err());
        assert_eq!(stream.stats().connections(), 2);
    }

    #[tokio::test]
    async fn test_oversized_event_restarts_session() {
        let transport = ScriptedTransport::new(vec![Ok(vec![
            ScriptedSession::Output(vec![events("{\"type\":\"a\"}{\"blob\":\""), events(&"z".repeat(256))]),
            ScriptedSession::Output(vec![events("{\"type\":\"b\"}")]),
        ])]);
        let (tx, rx) = EventStream::<ScriptedTransport>::channel(DEFAULT_QUEUE_CAPACITY);
        let config = EventStreamConfig {
            max_event_bytes: 128,
            ..fast(false)
        };
        let stream = EventStream::new(transport, tx, config);

        assert!(stream.run().await.is_err());
        assert_eq!(stream.stats().decode_failures(), 1);
        drop(stream);

        assert_eq!(drain(rx).await, vec![json!({"type": "a"}), json!({"type": "b"})]);
    }
}

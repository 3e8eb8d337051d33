//! # Event Ingestion
//!
//! Everything between the remote review server and the inbound event queue.
//! The ingestion client keeps one long-lived connection to the server, runs
//! `gerrit stream-events` in a session over it and decodes the output into
//! documents, reopening the session whenever it ends and reconnecting after a
//! fixed delay when the connection itself drops.
//!
//! ## Contained Modules:
//! - **`transport`**: the connection/session seam the stream loop is written
//!   against, so it can run over SSH in production and over scripted sessions
//!   in tests.
//! - **`decoder`**: incremental JSON object decoder and diagnostic line splitter.
//! - **`event_stream`**: the session/reconnect loop and its failure taxonomy.
//! - **`gerrit_ssh`**: the SSH transport (feature `ingestors`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Incremental decoding of the event and diagnostic streams.
pub mod decoder;
/// The session loop, reconnect policy and ingestion errors.
pub mod event_stream;
/// SSH transport running `gerrit stream-events`.
#[cfg(feature = "ingestors")]
pub mod gerrit_ssh;
/// Transport traits implemented by the SSH client and test doubles.
pub mod transport;

// --- Public API Re-exports ---
pub use decoder::{DecodeError, EventDecoder, LineBuffer, DEFAULT_MAX_EVENT_BYTES};
pub use event_stream::{EventStream, EventStreamConfig, IngestError, IngestStats};
#[cfg(feature = "ingestors")]
pub use gerrit_ssh::{GerritSshConfig, GerritSshTransport, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_MAX};
pub use transport::{EventLink, EventSession, EventTransport, SessionOutput};

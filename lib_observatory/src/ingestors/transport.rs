//! Connection and session abstractions for the event source.
//!
//! A transport dials the server and yields a link (the outer connection). A link
//! opens sessions (the command channel). A session produces interleaved chunks
//! of the structured-event stream and the diagnostic stream until it ends.

use async_trait::async_trait;

use super::event_stream::IngestError;

/// One chunk of output from a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    /// Bytes of the structured-event stream (stdout).
    Events(Vec<u8>),
    /// Bytes of the diagnostic stream (stderr).
    Diagnostics(Vec<u8>),
    /// The remote command exited with this status.
    Exited(u32),
}

/// Dials the event source and authenticates.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// The established outer connection.
    type Link: EventLink;

    /// Establishes a new outer connection from scratch.
    async fn connect(&self) -> Result<Self::Link, IngestError>;

    /// Human-readable endpoint for log lines.
    fn endpoint(&self) -> String;
}

/// An established outer connection.
#[async_trait]
pub trait EventLink: Send {
    /// A command session running over this link.
    type Session: EventSession;

    /// Opens a new session and starts the event command in it.
    async fn open_session(&mut self) -> Result<Self::Session, IngestError>;
}

/// A running command session.
#[async_trait]
pub trait EventSession: Send {
    /// Next chunk of output; `None` once the session has ended.
    async fn next_output(&mut self) -> Option<SessionOutput>;

    /// Tears the session down early. The default does nothing.
    async fn close(&mut self) {}
}

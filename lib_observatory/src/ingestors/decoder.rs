//! Incremental decoders for the two session streams.
//!
//! The event stream is a back-to-back sequence of JSON objects with no
//! enclosing array and no framing beyond optional whitespace. Chunks arrive at
//! arbitrary boundaries, so an object may be split across several reads; the
//! incomplete tail stays buffered until the rest of it arrives.
//!
//! A light bracket scanner follows the bytes as they come in, so the JSON
//! parser only runs once a top-level value can be complete. Each byte is
//! scanned a bounded number of times however the document is split.

use serde_json::{Deserializer, Value};
use thiserror::Error;

use crate::document::Document;

/// Default cap on the buffered size of a single event.
pub const DEFAULT_MAX_EVENT_BYTES: usize = 8 * 1024 * 1024;

/// Failure to decode the structured-event stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The stream is not valid JSON.
    #[error("malformed event stream: {0}")]
    Syntax(#[from] serde_json::Error),

    /// A complete top-level value that is not an object.
    #[error("expected an event object, got {0}")]
    NotAnObject(String),

    /// An unfinished event outgrew the buffer cap.
    #[error("event exceeds {limit} bytes ({pending} buffered)")]
    TooLarge {
        /// Bytes buffered when the cap was hit.
        pending: usize,
        /// Configured cap.
        limit: usize,
    },
}

/// Nesting state of the scanned prefix.
#[derive(Debug, Default)]
struct Framing {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Framing {
    /// Advances over `b`; true when a top-level value may have just ended.
    fn step(&mut self, b: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.in_string = false;
                return self.depth == 0;
            }
            return false;
        }
        match b {
            b'"' => {
                self.in_string = true;
                false
            }
            b'{' | b'[' => {
                self.depth += 1;
                false
            }
            b'}' | b']' => {
                self.depth = self.depth.saturating_sub(1);
                self.depth == 0
            }
            b' ' | b'\t' | b'\n' | b'\r' => false,
            // Scalars and stray bytes at the top level: let the parser judge.
            _ => self.depth == 0,
        }
    }
}

/// Buffers stream bytes and yields each complete top-level object.
#[derive(Debug)]
pub struct EventDecoder {
    buf: Vec<u8>,
    scanned: usize,
    framing: Framing,
    max_event_bytes: usize,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_EVENT_BYTES)
    }
}

impl EventDecoder {
    /// Creates an empty decoder with the default size cap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty decoder that fails once an unfinished event exceeds
    /// `max_event_bytes`.
    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            framing: Framing::default(),
            max_event_bytes: max_event_bytes.max(1),
        }
    }

    /// Appends `chunk` and pushes every object it completes onto `out`, in order.
    ///
    /// Objects decoded before a failure are still pushed. After an error the
    /// decoder should be discarded together with its session.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Document>) -> Result<(), DecodeError> {
        self.buf.extend_from_slice(chunk);
        if self.scan() {
            self.decode_complete(out)?;
        }
        if self.buf.len() > self.max_event_bytes {
            return Err(DecodeError::TooLarge {
                pending: self.buf.len(),
                limit: self.max_event_bytes,
            });
        }
        Ok(())
    }

    /// Bytes of an incomplete document still buffered.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn scan(&mut self) -> bool {
        let framing = &mut self.framing;
        let mut boundary = false;
        for &b in &self.buf[self.scanned..] {
            boundary |= framing.step(b);
        }
        self.scanned = self.buf.len();
        boundary
    }

    fn decode_complete(&mut self, out: &mut Vec<Document>) -> Result<(), DecodeError> {
        let mut consumed = 0;
        let mut failure = None;
        {
            let mut values = Deserializer::from_slice(&self.buf).into_iter::<Value>();
            loop {
                match values.next() {
                    Some(Ok(value)) => {
                        consumed = values.byte_offset();
                        if value.is_object() {
                            out.push(value);
                        } else {
                            failure = Some(DecodeError::NotAnObject(value.to_string()));
                            break;
                        }
                    }
                    // Incomplete tail: wait for more bytes.
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        failure = Some(DecodeError::Syntax(e));
                        break;
                    }
                    None => {
                        consumed = values.byte_offset();
                        break;
                    }
                }
            }
        }

        self.buf.drain(..consumed);
        if let Some(e) = failure {
            return Err(e);
        }
        // The tail holds no complete value; rebuild its framing from scratch.
        self.scanned = 0;
        self.framing = Framing::default();
        self.scan();
        Ok(())
    }
}

/// Splits the diagnostic stream into lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty line buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completes, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(to_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// Returns the unterminated remainder, if any, and empties the buffer.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(to_line(&rest))
    }
}

fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

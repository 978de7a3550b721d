use std::str;

use async_stream::try_stream;
use futures::{Stream, StreamExt};

use mindscribe_types::Citation;

/// In-band boundary between assistant prose and the trailing citation payload.
pub const SOURCES_SENTINEL: &str = "\n\n---SOURCES---\n\n";

/// Point-in-time view of a partially decoded response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSnapshot {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// Push-based decoder for the sentinel stream protocol.
///
/// Bytes go in chunk by chunk; each push returns the current visible state.
/// Multi-byte characters split across chunk boundaries are carried over, and
/// the sentinel is searched for in the whole accumulator, so neither can be
/// missed by unlucky chunking. Once the citation payload parses, the decoder
/// is settled and ignores further input.
#[derive(Debug, Default)]
pub struct SentinelDecoder {
    carry: Vec<u8>,
    full: String,
    prose: Option<String>,
    payload_start: usize,
    citations: Vec<Citation>,
    settled: bool,
}

impl SentinelDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the citation payload has parsed; no further prose or citation
    /// changes can occur.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    pub fn push(&mut self, chunk: &[u8]) -> StreamSnapshot {
        if self.settled {
            return self.snapshot(false);
        }
        self.decode_bytes(chunk);

        if self.prose.is_none() {
            if let Some(idx) = self.full.find(SOURCES_SENTINEL) {
                self.prose = Some(self.full[..idx].trim().to_string());
                self.payload_start = idx + SOURCES_SENTINEL.len();
            }
        }

        if self.prose.is_some() {
            let payload = self.full[self.payload_start..].trim();
            if !payload.is_empty() {
                match serde_json::from_str::<Vec<Citation>>(payload) {
                    Ok(citations) => {
                        self.citations = citations;
                        self.settled = true;
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "citation payload not yet parsable");
                    }
                }
            }
        }

        self.snapshot(false)
    }

    /// Final state once the source is exhausted. An unparsable payload
    /// degrades to prose with no citations; it is never an error.
    pub fn finish(&mut self) -> StreamSnapshot {
        if !self.settled && !self.carry.is_empty() {
            tracing::debug!(
                bytes = self.carry.len(),
                "dropping incomplete utf-8 tail at end of stream"
            );
            self.carry.clear();
        }
        self.snapshot(true)
    }

    fn snapshot(&self, final_trim: bool) -> StreamSnapshot {
        let text = match &self.prose {
            Some(prose) => prose.clone(),
            None if final_trim => self.full.trim().to_string(),
            None => self.full.clone(),
        };
        StreamSnapshot {
            text,
            citations: self.citations.clone(),
        }
    }

    // Incremental UTF-8: append the longest valid prefix, keep an incomplete
    // trailing sequence for the next chunk, and skip over invalid bytes.
    fn decode_bytes(&mut self, chunk: &[u8]) {
        self.carry.extend_from_slice(chunk);
        loop {
            match str::from_utf8(&self.carry) {
                Ok(text) => {
                    self.full.push_str(text);
                    self.carry.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.full
                        .push_str(str::from_utf8(&self.carry[..valid]).unwrap_or_default());
                    match err.error_len() {
                        Some(bad) => {
                            self.carry.drain(..valid + bad);
                        }
                        None => {
                            self.carry.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Drive a byte stream through a [`SentinelDecoder`], yielding a snapshot per
/// chunk and a final snapshot at end of stream. Transport errors propagate;
/// decode and parse problems are absorbed by the decoder.
pub fn snapshots<S, B, E>(source: S) -> impl Stream<Item = Result<StreamSnapshot, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    try_stream! {
        let mut decoder = SentinelDecoder::new();
        futures::pin_mut!(source);
        while let Some(chunk) = source.next().await {
            let chunk = chunk?;
            let snapshot = decoder.push(chunk.as_ref());
            let settled = decoder.is_settled();
            yield snapshot;
            if settled {
                return;
            }
        }
        yield decoder.finish();
    }
}

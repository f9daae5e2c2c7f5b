//! Incremental recognition over streamed model output.
//!
//! [`StreamRecognizer`] is push-based: feed it fragments as they arrive and
//! it hands back whatever segments are already certain. Text before a call
//! block is released immediately; only a trailing partial opening marker is
//! held back. A call is released once its closing marker arrives, and
//! [`StreamRecognizer::finish`] emits an unterminated block verbatim as text.
//!
//! Spans are absolute offsets into the concatenation of every fragment
//! pushed so far.
//!
//! The SSE parser turns an OpenAI-compatible `text/event-stream` body into
//! content fragments for the recognizer.

use std::collections::VecDeque;

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;
use super::tool_call_parser::{build_call, CallMarkup, Segment, TextSpan};
use super::types::ChatCompletionChunk;

// ─── StreamRecognizer ────────────────────────────────────────────────────────

/// Push-based recognizer for streamed output.
pub struct StreamRecognizer {
    markup: CallMarkup,
    /// Bytes received but not yet emitted.
    buffer: String,
    /// Absolute offset of `buffer[0]` in the full stream.
    offset: usize,
    /// While inside an open block, how far into `buffer` the close marker
    /// has already been searched for.
    close_scanned: usize,
    next_sequence: usize,
}

impl StreamRecognizer {
    pub fn new(markup: CallMarkup) -> Self {
        Self {
            markup,
            buffer: String::new(),
            offset: 0,
            close_scanned: 0,
            next_sequence: 1,
        }
    }

    /// Feed one fragment; returns the segments it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        self.buffer.push_str(fragment);
        let mut out = Vec::new();
        if !self.markup.is_valid() {
            self.emit_text(self.buffer.len(), &mut out);
            return out;
        }

        loop {
            let Some(open_at) = self.buffer.find(&self.markup.open) else {
                let hold = partial_marker_len(&self.buffer, &self.markup.open);
                self.emit_text(self.buffer.len() - hold, &mut out);
                break;
            };

            if open_at > 0 {
                self.emit_text(open_at, &mut out);
                continue;
            }

            let body_start = self.markup.open.len();
            let scan_from = floor_char_boundary(&self.buffer, self.close_scanned.max(body_start));
            match self.buffer[scan_from..].find(&self.markup.close) {
                Some(rel) => {
                    let body_end = scan_from + rel;
                    let block_end = body_end + self.markup.close.len();
                    let call = build_call(
                        self.next_sequence,
                        &self.buffer[body_start..body_end],
                        self.offset..self.offset + block_end,
                    );
                    self.next_sequence += 1;
                    self.consume(block_end);
                    out.push(Segment::Call(call));
                }
                None => {
                    // Rescan the tail next time in case the close marker is split.
                    let keep = self.markup.close.len().saturating_sub(1);
                    self.close_scanned = self.buffer.len().saturating_sub(keep).max(body_start);
                    break;
                }
            }
        }
        out
    }

    /// Flush everything still buffered as text. An unterminated block is
    /// returned verbatim.
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        self.emit_text(self.buffer.len(), &mut out);
        out
    }

    /// Number of calls emitted so far.
    pub fn calls_emitted(&self) -> usize {
        self.next_sequence - 1
    }

    fn emit_text(&mut self, len: usize, out: &mut Vec<Segment>) {
        if len == 0 {
            return;
        }
        let text: String = self.buffer[..len].to_string();
        out.push(Segment::Text(TextSpan {
            span: self.offset..self.offset + len,
            text,
        }));
        self.consume(len);
    }

    fn consume(&mut self, len: usize) {
        self.buffer.drain(..len);
        self.offset += len;
        self.close_scanned = 0;
    }
}

/// Length of the longest proper prefix of `marker` that `buffer` ends with.
fn partial_marker_len(buffer: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(buffer.len());
    (1..=max)
        .rev()
        .filter(|&k| marker.is_char_boundary(k))
        .find(|&k| buffer.ends_with(&marker[..k]))
        .unwrap_or(0)
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ─── Stream Adapter ──────────────────────────────────────────────────────────

/// Run a fragment stream through a [`StreamRecognizer`].
///
/// The first upstream error is yielded and ends the stream; no text that
/// was still held back is flushed in that case.
pub fn recognize_stream<S>(
    fragments: S,
    markup: CallMarkup,
) -> impl Stream<Item = Result<Segment, InferenceError>>
where
    S: Stream<Item = Result<String, InferenceError>>,
{
    let fragments = Box::pin(fragments);
    let state = (fragments, StreamRecognizer::new(markup), VecDeque::new(), false);

    stream::unfold(
        state,
        |(mut fragments, mut recognizer, mut ready, mut done)| async move {
            loop {
                if let Some(segment) = ready.pop_front() {
                    return Some((Ok(segment), (fragments, recognizer, ready, done)));
                }
                if done {
                    return None;
                }
                match fragments.next().await {
                    Some(Ok(fragment)) => ready.extend(recognizer.push(&fragment)),
                    Some(Err(e)) => {
                        done = true;
                        return Some((Err(e), (fragments, recognizer, ready, done)));
                    }
                    None => {
                        done = true;
                        ready.extend(recognizer.finish());
                    }
                }
            }
        },
    )
}

// ─── SSE Parsing ─────────────────────────────────────────────────────────────

/// Parse an SSE body into content fragments.
///
/// Events are split on blank lines at the byte level so multi-byte
/// characters spanning network chunks are never mangled. Keep-alives and
/// empty deltas are skipped; `data: [DONE]` ends the stream.
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<String, InferenceError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let byte_stream = Box::pin(byte_stream);

    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, mut done)| async move {
            loop {
                if done {
                    return None;
                }

                if let Some(event_end) = find_event_end(&buffer) {
                    let event: Vec<u8> = buffer.drain(..event_end + 2).collect();
                    match process_event(&String::from_utf8_lossy(&event)) {
                        Ok(SseEvent::Content(text)) => {
                            return Some((Ok(text), (byte_stream, buffer, done)))
                        }
                        Ok(SseEvent::Skip) => continue,
                        Ok(SseEvent::Done) => return None,
                        Err(e) => return Some((Err(e), (byte_stream, buffer, done))),
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer, done),
                        ));
                    }
                    None => {
                        done = true;
                        let tail = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if tail.is_empty() {
                            return None;
                        }
                        match process_event(&tail) {
                            Ok(SseEvent::Content(text)) => {
                                return Some((Ok(text), (byte_stream, buffer, done)))
                            }
                            Ok(_) => return None,
                            Err(e) => return Some((Err(e), (byte_stream, buffer, done))),
                        }
                    }
                }
            }
        },
    )
}

enum SseEvent {
    Content(String),
    Skip,
    Done,
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn process_event(event: &str) -> Result<SseEvent, InferenceError> {
    let mut data = String::new();
    for line in event.lines() {
        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.trim();
            if payload == "[DONE]" {
                return Ok(SseEvent::Done);
            }
            data.push_str(payload);
        }
    }

    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }

    let chunk: ChatCompletionChunk =
        serde_json::from_str(&data).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse SSE chunk: {e} (data: {data})"),
        })?;

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .unwrap_or_default();

    if content.is_empty() {
        Ok(SseEvent::Skip)
    } else {
        Ok(SseEvent::Content(content))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

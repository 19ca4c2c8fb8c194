//! Server-Sent Events decoding
//!
//! Turns the upstream response body (arbitrary byte chunks) into one string
//! per SSE event, joining multi-line `data:` fields. Bytes are buffered until
//! a full line is available so multi-byte characters split across chunks
//! survive.

use std::fmt::Display;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::traits::FrameStream;
use crate::error::RelayError;

/// Frames buffered between the decoder task and the relay
const FRAME_BUFFER: usize = 100;

/// Longest line the decoder buffers before dropping it
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Incremental SSE event decoder
///
/// A line longer than the configured maximum is discarded together with the
/// rest of its event; decoding resumes with the next event.
#[derive(Debug)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline
    scanned: usize,
    data_lines: Vec<String>,
    max_line: usize,
    /// Dropping bytes until the next newline
    skip_line: bool,
    /// Dropping fields until the next blank line
    skip_event: bool,
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseFrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty decoder that drops lines longer than `max_line` bytes
    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            data_lines: Vec::new(),
            max_line: max_line.max(1),
            skip_line: false,
            skip_event: false,
        }
    }

    /// Feed bytes, returning every event completed by them
    pub fn push(&mut self, mut bytes: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();

        if self.skip_line {
            let Some(pos) = bytes.iter().position(|&b| b == b'\n') else {
                return frames;
            };
            self.skip_line = false;
            bytes = &bytes[pos + 1..];
        }

        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(bytes);

        let mut line_start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = buffer[cursor..].iter().position(|&b| b == b'\n') {
            let end = cursor + offset;
            let line = &buffer[line_start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.len() > self.max_line {
                self.drop_event(line.len());
            } else if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
            line_start = end + 1;
            cursor = line_start;
        }

        buffer.drain(..line_start);
        if buffer.len() > self.max_line {
            self.drop_event(buffer.len());
            buffer.clear();
            self.skip_line = true;
        }
        self.scanned = buffer.len();
        self.buffer = buffer;
        frames
    }

    /// Flush a trailing event that was not terminated by a blank line
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        self.skip_line = false;

        let line = rest.strip_suffix(b"\r").unwrap_or(&rest[..]);
        if !line.is_empty() {
            // A completed event cannot come out of a non-empty line
            let _ = self.process_line(line);
        }
        if std::mem::take(&mut self.skip_event) {
            self.data_lines.clear();
            return None;
        }
        self.dispatch()
    }

    fn drop_event(&mut self, line_len: usize) {
        tracing::warn!(
            line_len,
            max_line = self.max_line,
            "Oversized SSE line, dropping event"
        );
        self.data_lines.clear();
        self.skip_event = true;
    }

    fn process_line(&mut self, line: &[u8]) -> Option<String> {
        if line.is_empty() {
            if std::mem::take(&mut self.skip_event) {
                self.data_lines.clear();
                return None;
            }
            return self.dispatch();
        }
        if self.skip_event || line[0] == b':' {
            return None;
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*line, ""),
        };
        if field == "data" {
            self.data_lines.push(value.to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        if data.trim().is_empty() {
            None
        } else {
            Some(data)
        }
    }
}

/// Decode a byte stream into a [`FrameStream`]
///
/// The body is drained on a spawned task; dropping the returned stream stops
/// it. A transport error is forwarded as `UpstreamConnection` and ends the
/// stream.
pub fn decode_sse<S, B, E>(body: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);

    tokio::spawn(async move {
        let mut body = body;
        let mut decoder = SseFrameDecoder::new();

        loop {
            let chunk = tokio::select! {
                () = tx.closed() => return,
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for frame in decoder.push(bytes.as_ref()) {
                        tracing::trace!(frame = %frame, "SSE frame");
                        if tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx
                        .send(Err(RelayError::UpstreamConnection(e.to_string())))
                        .await;
                    return;
                }
                None => break,
            }
        }

        if let Some(frame) = decoder.finish() {
            let _ = tx.send(Ok(frame)).await;
        }
    });

    ReceiverStream::new(rx).boxed()
}

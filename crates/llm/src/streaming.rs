//! Common streaming infrastructure for providers
//!
//! Providers read raw byte chunks from a [`ChunkStream`] and turn them into
//! frames with a [`FrameDecoder`]. Two decoders exist:
//!
//! - [`SseDecoder`] for Server-Sent-Events bodies (`data: <payload>\n\n`)
//! - [`JsonStreamDecoder`] for concatenated JSON objects, either newline
//!   delimited or wrapped in a (possibly never closed) JSON array
//!
//! Neither decoder knows anything about the network or about providers.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Response;
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Trait for streaming chunk sources
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Real HTTP response chunk stream
pub struct HttpChunkStream {
    pub response: Response,
}

impl HttpChunkStream {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(crate::ApiError::Network(e.to_string()).into()),
        }
    }
}

/// Incremental framing of a byte stream.
pub trait FrameDecoder: Send {
    /// Feed the next chunk, returning every frame it completed.
    fn push(&mut self, chunk: &[u8]) -> Vec<String>;

    /// Called once the source is exhausted.
    fn finish(&mut self) -> Vec<String>;
}

/// Decoder for Server-Sent-Events framing.
///
/// Only `data` fields are surfaced. Multiple `data` lines of one event are
/// joined with `\n`. Payloads are passed through verbatim, including the
/// `[DONE]` sentinel.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn process_line(&mut self, line: &str, frames: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                frames.push(self.data_lines.join("\n"));
                self.data_lines.clear();
            }
            return;
        }

        // Comment line
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        if field == "data" {
            self.data_lines.push(value.to_string());
        } else {
            trace!("Ignoring SSE field '{}'", field);
        }
    }
}

impl FrameDecoder for SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.process_line(&line, &mut frames);
        }
        frames
    }

    fn finish(&mut self) -> Vec<String> {
        if !self.buffer.is_empty() || !self.data_lines.is_empty() {
            trace!(
                "Discarding unterminated SSE frame ({} buffered bytes)",
                self.buffer.len()
            );
        }
        self.buffer.clear();
        self.data_lines.clear();
        Vec::new()
    }
}

/// Decoder for streams of JSON objects.
///
/// Handles newline-delimited objects as well as the bracket-wrapped,
/// comma-joined arrays some backends stream without ever closing. Object
/// boundaries are found by counting braces outside of string literals.
/// Every emitted frame parses as a JSON object; anything that does not is
/// logged and dropped.
#[derive(Debug, Default)]
pub struct JsonStreamDecoder {
    buffer: Vec<u8>,
    scan_pos: usize,
    depth: usize,
    object_start: Option<usize>,
    in_string: bool,
    escaped: bool,
}

impl JsonStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(candidate: &[u8]) -> Option<String> {
        let text = match std::str::from_utf8(candidate) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping JSON stream object with invalid UTF-8: {}", e);
                return None;
            }
        };
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) if value.is_object() => Some(text.to_string()),
            Ok(_) => {
                warn!("Dropping non-object JSON stream value '{}'", text);
                None
            }
            Err(e) => {
                warn!("Dropping malformed JSON stream object '{}': {}", text, e);
                None
            }
        }
    }
}

impl FrameDecoder for JsonStreamDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut completed = Vec::new();
        for index in self.scan_pos..self.buffer.len() {
            let byte = self.buffer[index];

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' if self.depth > 0 => self.in_string = true,
                b'{' => {
                    if self.depth == 0 {
                        self.object_start = Some(index);
                    }
                    self.depth += 1;
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        if let Some(start) = self.object_start.take() {
                            completed.push((start, index + 1));
                        }
                    }
                }
                // Array brackets, commas and whitespace between objects
                _ => {}
            }
        }

        let frames = completed
            .into_iter()
            .filter_map(|(start, end)| Self::validate(&self.buffer[start..end]))
            .collect();

        // Keep only the unfinished object, if any
        match self.object_start {
            Some(start) => {
                self.buffer.drain(..start);
                self.object_start = Some(0);
            }
            None => self.buffer.clear(),
        }
        self.scan_pos = self.buffer.len();

        frames
    }

    fn finish(&mut self) -> Vec<String> {
        let remainder = std::mem::take(&mut self.buffer);
        self.scan_pos = 0;
        self.depth = 0;
        self.object_start = None;
        self.in_string = false;
        self.escaped = false;

        let remainder = String::from_utf8_lossy(&remainder);
        let remainder = remainder
            .trim()
            .trim_end_matches(|c: char| c == ']' || c == ',' || c.is_whitespace());
        if remainder.is_empty() {
            return Vec::new();
        }

        Self::validate(remainder.as_bytes()).into_iter().collect()
    }
}

/// Lazily decoded frames of a chunk stream.
///
/// Frames come out in the order they appear in the byte stream. Once the
/// source is exhausted and the decoder flushed, the stream yields `None`
/// forever.
pub struct FrameStream<D> {
    source: Box<dyn ChunkStream>,
    decoder: D,
    pending: VecDeque<String>,
    exhausted: bool,
}

impl FrameStream<SseDecoder> {
    pub fn sse(source: Box<dyn ChunkStream>) -> Self {
        Self::new(source, SseDecoder::new())
    }
}

impl FrameStream<JsonStreamDecoder> {
    pub fn json(source: Box<dyn ChunkStream>) -> Self {
        Self::new(source, JsonStreamDecoder::new())
    }
}

impl<D: FrameDecoder> FrameStream<D> {
    pub fn new(source: Box<dyn ChunkStream>, decoder: D) -> Self {
        Self {
            source,
            decoder,
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if self.exhausted {
                return Ok(None);
            }

            match self.source.next_chunk().await? {
                Some(chunk) => {
                    trace!("Received chunk of {} bytes", chunk.len());
                    self.pending.extend(self.decoder.push(&chunk));
                }
                None => {
                    self.exhausted = true;
                    self.pending.extend(self.decoder.finish());
                }
            }
        }
    }
}

/// Chunk stream over a fixed list of chunks
#[cfg(test)]
pub(crate) struct ScriptedChunkStream {
    chunks: VecDeque<Vec<u8>>,
}

#[cfg(test)]
impl ScriptedChunkStream {
    pub(crate) fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        Self {
            chunks: chunks.into_iter().map(|c| c.as_ref().to_vec()).collect(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ChunkStream for ScriptedChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.chunks.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all<D: FrameDecoder>(decoder: &mut D, chunks: &[&[u8]]) -> Vec<String> {
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(decoder.push(chunk));
        }
        frames.extend(decoder.finish());
        frames
    }

    const SSE_BODY: &str = "event: message\nid: 1\ndata: {\"text\":\"Grüße\"}\n\n: keep-alive\n\ndata: second\r\n\r\ndata: line one\ndata: line two\n\ndata: [DONE]\n\n";

    #[test]
    fn sse_emits_data_payloads_in_order() {
        let frames = decode_all(&mut SseDecoder::new(), &[SSE_BODY.as_bytes()]);
        assert_eq!(
            frames,
            vec![
                "{\"text\":\"Grüße\"}".to_string(),
                "second".to_string(),
                "line one\nline two".to_string(),
                "[DONE]".to_string(),
            ]
        );
    }

    #[test]
    fn sse_is_independent_of_chunk_boundaries() {
        let bytes = SSE_BODY.as_bytes();
        let expected = decode_all(&mut SseDecoder::new(), &[bytes]);

        for first in 0..=bytes.len() {
            for second in first..=bytes.len() {
                let chunks = [&bytes[..first], &bytes[first..second], &bytes[second..]];
                let frames = decode_all(&mut SseDecoder::new(), &chunks);
                assert_eq!(frames, expected, "split at {first}/{second}");
            }
        }
    }

    #[test]
    fn sse_discards_unterminated_trailing_frame() {
        let frames = decode_all(
            &mut SseDecoder::new(),
            &[b"data: complete\n\ndata: partial".as_slice()],
        );
        assert_eq!(frames, vec!["complete".to_string()]);

        let frames = decode_all(
            &mut SseDecoder::new(),
            &[b"data: complete\n\ndata: no blank line\n".as_slice()],
        );
        assert_eq!(frames, vec!["complete".to_string()]);
    }

    #[test]
    fn sse_accepts_data_without_space() {
        let frames = decode_all(&mut SseDecoder::new(), &[b"data:tight\n\n".as_slice()]);
        assert_eq!(frames, vec!["tight".to_string()]);
    }

    #[test]
    fn json_stream_reassembles_objects_split_across_chunks() {
        let frames = decode_all(
            &mut JsonStreamDecoder::new(),
            &[b"{\"a\":1}\n{\"b\":2".as_slice(), b"}\n{\"c\":3}".as_slice()],
        );
        assert_eq!(
            frames,
            vec![
                "{\"a\":1}".to_string(),
                "{\"b\":2}".to_string(),
                "{\"c\":3}".to_string(),
            ]
        );
    }

    #[test]
    fn json_stream_skips_array_framing() {
        let frames = decode_all(
            &mut JsonStreamDecoder::new(),
            &[
                b"[{\"candidates\":[{\"index\":0}]}".as_slice(),
                b"\r\n,\r\n{\"candidates\":".as_slice(),
                b"[{\"index\":1}]}".as_slice(),
            ],
        );
        assert_eq!(
            frames,
            vec![
                "{\"candidates\":[{\"index\":0}]}".to_string(),
                "{\"candidates\":[{\"index\":1}]}".to_string(),
            ]
        );

        let frames = decode_all(
            &mut JsonStreamDecoder::new(),
            &[b"[{\"a\":1},{\"b\":2}]".as_slice()],
        );
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn json_stream_ignores_braces_inside_strings() {
        let body = br#"{"text":"a } brace and a \" quote {"}{"text":"next"}"#;
        let frames = decode_all(&mut JsonStreamDecoder::new(), &[body.as_slice()]);
        assert_eq!(
            frames,
            vec![
                r#"{"text":"a } brace and a \" quote {"}"#.to_string(),
                r#"{"text":"next"}"#.to_string(),
            ]
        );
    }

    #[test]
    fn json_stream_is_independent_of_chunk_boundaries() {
        let bytes = "[{\"t\":\"ä{\"},\n{\"t\":\"ö\\\"}\"}]".as_bytes();
        let expected = decode_all(&mut JsonStreamDecoder::new(), &[bytes]);
        assert_eq!(expected.len(), 2);

        for split in 0..=bytes.len() {
            let frames = decode_all(
                &mut JsonStreamDecoder::new(),
                &[&bytes[..split], &bytes[split..]],
            );
            assert_eq!(frames, expected, "split at {split}");
        }
    }

    #[test]
    fn json_stream_drops_malformed_objects() {
        let frames = decode_all(
            &mut JsonStreamDecoder::new(),
            &[b"{\"a\":}\n{\"b\":2}\n".as_slice()],
        );
        assert_eq!(frames, vec!["{\"b\":2}".to_string()]);
    }

    #[test]
    fn json_stream_drops_incomplete_trailing_object() {
        let frames = decode_all(
            &mut JsonStreamDecoder::new(),
            &[b"{\"a\":1}\n{\"b\":".as_slice()],
        );
        assert_eq!(frames, vec!["{\"a\":1}".to_string()]);
    }

    #[tokio::test]
    async fn frame_stream_yields_frames_lazily_until_exhausted() -> Result<()> {
        let source = ScriptedChunkStream::new(["data: one\n", "\ndata: two\n\n"]);
        let mut frames = FrameStream::sse(Box::new(source));

        assert_eq!(frames.next_frame().await?, Some("one".to_string()));
        assert_eq!(frames.next_frame().await?, Some("two".to_string()));
        assert_eq!(frames.next_frame().await?, None);
        assert_eq!(frames.next_frame().await?, None);
        Ok(())
    }
}

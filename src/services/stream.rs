//! Streaming response normalizer
//!
//! Scans an upstream byte stream into records, maps every record to a
//! canonical chunk and re-emits it to the caller as soon as it is decoded.

use crate::models::meta::Meta;
use crate::models::openai::{Delta, StreamChunk, Usage, FINISH_STOP};
use crate::services::usage::resolve_usage;
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::logging::truncate_content;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use tracing::{debug, warn};

/// Record delimiting of an upstream stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Server-sent events; only `data:` fields are records
    Sse,
    /// Newline-delimited JSON
    Lines,
}

/// Splits a chunked byte stream into records, buffering partial lines
pub struct EventScanner<S> {
    inner: S,
    framing: Framing,
    buffer: Vec<u8>,
    exhausted: bool,
}

impl<S, E> EventScanner<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(inner: S, framing: Framing) -> Self {
        Self {
            inner,
            framing,
            buffer: Vec::new(),
            exhausted: false,
        }
    }

    /// Next record payload, or the transport error that ended the stream
    pub async fn next_record(&mut self) -> Option<Result<String, E>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                if let Some(record) = self.extract(&line) {
                    return Some(Ok(record));
                }
                continue;
            }

            if self.exhausted {
                if self.buffer.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut self.buffer);
                return self.extract(&line).map(Ok);
            }

            match self.inner.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    self.exhausted = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
                None => self.exhausted = true,
            }
        }
    }

    fn extract(&self, line: &[u8]) -> Option<String> {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line.trim_end_matches(['\r', '\n']),
            Err(e) => {
                warn!("Skipping non UTF-8 stream line: {}", e);
                return None;
            }
        };

        match self.framing {
            Framing::Sse => {
                let data = line.strip_prefix("data:")?;
                let data = data.strip_prefix(' ').unwrap_or(data);
                (!data.is_empty()).then(|| data.to_string())
            }
            Framing::Lines => {
                let data = line.trim();
                (!data.is_empty()).then(|| data.to_string())
            }
        }
    }
}

/// Outcome of mapping one upstream record
#[derive(Debug, Default)]
pub struct StreamStep {
    pub chunk: Option<StreamChunk>,
    pub usage: Option<Usage>,
    pub done: bool,
}

impl StreamStep {
    pub fn chunk(chunk: StreamChunk) -> Self {
        Self {
            chunk: Some(chunk),
            ..Default::default()
        }
    }

    /// Record carries nothing for the caller
    pub fn skip() -> Self {
        Self::default()
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_done(mut self) -> Self {
        self.done = true;
        self
    }
}

/// Relay an upstream stream to the caller and return the resulting usage.
///
/// Records that fail to decode are skipped. A transport error ends the stream
/// early with the usage accumulated so far, and so does a caller disconnect,
/// even while the upstream is silent. The caller always receives a
/// terminal `stop` chunk (unless the upstream sent a finish reason) followed
/// by `[DONE]`.
pub async fn normalize_stream<F>(
    meta: &Meta,
    response: reqwest::Response,
    framing: Framing,
    writer: &RelayWriter,
    mapper: F,
) -> AppResult<Usage>
where
    F: FnMut(&str) -> anyhow::Result<StreamStep>,
{
    let scanner = EventScanner::new(Box::pin(response.bytes_stream()), framing);
    relay_records(meta, scanner, writer, mapper).await
}

/// Scan-and-re-emit loop over any record source
pub async fn relay_records<S, E, F>(
    meta: &Meta,
    mut scanner: EventScanner<S>,
    writer: &RelayWriter,
    mut mapper: F,
) -> AppResult<Usage>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
    F: FnMut(&str) -> anyhow::Result<StreamStep>,
{
    let mut reported = Usage::default();
    let mut saw_usage = false;
    let mut text = String::new();
    let mut finished = false;
    let mut chunks = 0usize;

    loop {
        let next = tokio::select! {
            next = scanner.next_record() => next,
            _ = writer.closed() => {
                debug!("Client disconnected while waiting for upstream records");
                return Ok(resolve_usage(saw_usage.then_some(reported), &text, meta));
            }
        };
        let Some(record) = next else {
            break;
        };
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!("Upstream stream interrupted: {}", e);
                break;
            }
        };

        if record.trim() == "[DONE]" {
            debug!("Received streaming response end marker");
            break;
        }

        let step = match mapper(&record) {
            Ok(step) => step,
            Err(e) => {
                warn!(
                    "Failed to parse streaming response chunk: {} - data: {}",
                    e,
                    truncate_content(&record, 200)
                );
                continue;
            }
        };

        if let Some(usage) = &step.usage {
            reported.merge(usage);
            saw_usage = true;
        }

        if let Some(mut chunk) = step.chunk {
            chunk.model = meta.origin_model.clone();
            if chunk.id.is_empty() {
                chunk.id = format!("chatcmpl-{}", meta.request_id);
            }
            text.push_str(&chunk.content_text());
            finished |= chunk.has_finish_reason();

            if let Err(e) = writer.write_chunk(&chunk).await {
                return client_gone(e, reported, saw_usage, &text, meta);
            }
            chunks += 1;
        }

        if step.done {
            break;
        }
    }

    if !finished {
        let stop = StreamChunk::new(
            format!("chatcmpl-{}", meta.request_id),
            meta.origin_model.clone(),
            chrono::Utc::now().timestamp(),
        )
        .with_delta(Delta::default(), Some(FINISH_STOP.to_string()));
        if let Err(e) = writer.write_chunk(&stop).await {
            return client_gone(e, reported, saw_usage, &text, meta);
        }
    }
    if let Err(e) = writer.write_done().await {
        return client_gone(e, reported, saw_usage, &text, meta);
    }

    debug!("Stream relayed {} chunks", chunks);
    Ok(resolve_usage(saw_usage.then_some(reported), &text, meta))
}

fn client_gone(
    error: AppError,
    reported: Usage,
    saw_usage: bool,
    text: &str,
    meta: &Meta,
) -> AppResult<Usage> {
    match error {
        AppError::ClientClosed => {
            debug!("Client disconnected");
            Ok(resolve_usage(saw_usage.then_some(reported), text, meta))
        }
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn scanner(
        parts: Vec<&'static str>,
        framing: Framing,
    ) -> EventScanner<impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin> {
        EventScanner::new(
            stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes())))),
            framing,
        )
    }

    #[tokio::test]
    async fn test_sse_records_across_chunks() {
        let mut scanner = scanner(
            vec![
                "event: message\nda",
                "ta: {\"a\":1}\n\n: keepalive\n",
                "data:{\"b\":2}\r\n\ndata: [DONE]",
            ],
            Framing::Sse,
        );
        assert_eq!(scanner.next_record().await.unwrap().unwrap(), r#"{"a":1}"#);
        assert_eq!(scanner.next_record().await.unwrap().unwrap(), r#"{"b":2}"#);
        assert_eq!(scanner.next_record().await.unwrap().unwrap(), "[DONE]");
        assert!(scanner.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_line_records() {
        let mut scanner = scanner(vec!["{\"x\":1}\n\n{\"x\"", ":2}\n"], Framing::Lines);
        assert_eq!(scanner.next_record().await.unwrap().unwrap(), r#"{"x":1}"#);
        assert_eq!(scanner.next_record().await.unwrap().unwrap(), r#"{"x":2}"#);
        assert!(scanner.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_ends_scan() {
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: 1\n")),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset")),
            Ok(Bytes::from_static(b"data: 2\n")),
        ];
        let mut scanner = EventScanner::new(stream::iter(parts), Framing::Sse);
        assert_eq!(scanner.next_record().await.unwrap().unwrap(), "1");
        assert!(scanner.next_record().await.unwrap().is_err());
        assert!(scanner.next_record().await.is_none());
    }
}

//! Streaming normalization tests

use airelay::channel::{Channel, ChannelType};
use airelay::meta::Meta;
use airelay::mode::Mode;
use airelay::openai::{GeneralOpenAIRequest, Message, RelayRequest, StreamChunk, Usage};
use airelay::services::stream::{relay_records, EventScanner, Framing, StreamStep};
use airelay::{AdaptorRegistry, HttpClients, Relay, RelayFrame, RelayWriter, TokenCache};
use bytes::Bytes;
use futures::StreamExt;
use httpmock::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

fn relay_for(channel: Channel) -> Relay {
    let registry = AdaptorRegistry::new(
        HttpClients::with_timeouts(5, 5).unwrap(),
        Arc::new(TokenCache::with_system_clock()),
    );
    Relay::new(registry, vec![channel]).unwrap()
}

fn stream_request(model: &str) -> RelayRequest {
    RelayRequest::General(GeneralOpenAIRequest {
        model: model.to_string(),
        messages: vec![Message::new("user", "hi")],
        stream: true,
        ..Default::default()
    })
}

/// Drain every frame written so far; the relay has returned by then
fn drain(rx: &mut Receiver<RelayFrame>) -> (Vec<StreamChunk>, bool) {
    let mut chunks = Vec::new();
    let mut done = false;
    while let Ok(frame) = rx.try_recv() {
        match frame {
            RelayFrame::Event(data) => {
                assert!(!done, "chunk written after [DONE]");
                chunks.push(serde_json::from_str(&data).unwrap());
            }
            RelayFrame::Done => done = true,
            RelayFrame::Body { .. } => panic!("unexpected buffered body in a stream"),
        }
    }
    (chunks, done)
}

fn text_of(chunks: &[StreamChunk]) -> String {
    chunks.iter().map(StreamChunk::content_text).collect()
}

fn chunk_record(content: &str, extra: &str) -> String {
    format!(
        "data: {{\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"moonshot-v1-8k\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{}\"}}{}}}]{}}}\n\n",
        content,
        if extra.is_empty() { "" } else { ",\"finish_reason\":\"stop\"" },
        extra
    )
}

#[tokio::test]
async fn test_three_records_three_chunks_with_usage() {
    let server = MockServer::start_async().await;
    let body = format!(
        "{}{}{}data: [DONE]\n\n",
        chunk_record("Hel", ""),
        chunk_record("lo", ""),
        chunk_record(
            "",
            ",\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}"
        ),
    );
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions").body_contains("\"stream\":true");
            then.status(200).header("content-type", "text/event-stream").body(body);
        })
        .await;

    let relay =
        relay_for(Channel::new(1, ChannelType::Moonshot, "sk").with_base_url(server.base_url()));
    let (writer, mut rx) = RelayWriter::channel(16);

    let usage = relay
        .relay(Mode::ChatCompletions, stream_request("moonshot-v1-8k"), &writer)
        .await
        .unwrap();

    let (chunks, done) = drain(&mut rx);
    assert_eq!(chunks.len(), 3);
    assert!(done);
    assert_eq!(text_of(&chunks), "Hello");
    assert_eq!(usage, Usage::new(5, 2));
    assert_eq!(usage.total_tokens, 7);
    assert!(chunks.iter().all(|c| c.model == "moonshot-v1-8k"));
}

#[tokio::test]
async fn test_malformed_interior_record_skipped() {
    let server = MockServer::start_async().await;
    let body = format!(
        "{}data: {{not json at all\n\n{}data: [DONE]\n\n",
        chunk_record("first", ""),
        chunk_record("second", ""),
    );
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).header("content-type", "text/event-stream").body(body);
        })
        .await;

    let relay =
        relay_for(Channel::new(1, ChannelType::Moonshot, "sk").with_base_url(server.base_url()));
    let (writer, mut rx) = RelayWriter::channel(16);

    let result = relay
        .relay(Mode::ChatCompletions, stream_request("moonshot-v1-8k"), &writer)
        .await;
    assert!(result.is_ok());

    let (chunks, done) = drain(&mut rx);
    assert!(done);
    // two valid chunks plus the synthetic stop chunk
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].content_text(), "first");
    assert_eq!(chunks[1].content_text(), "second");
    assert!(chunks[2].has_finish_reason());
}

#[tokio::test]
async fn test_stream_round_trip_text_equality() {
    let pieces = ["The ", "quick ", "brown ", "fox ", "jumps ", "over ", "the ", "lazy ", "dog."];
    let records: String = pieces
        .iter()
        .map(|p| {
            format!(
                "data: {}\n\n",
                serde_json::to_string(&StreamChunk::new("id", "m", 1).with_delta(
                    airelay::openai::Delta::text(*p),
                    None
                ))
                .unwrap()
            )
        })
        .collect();

    // Split the byte stream at awkward positions to exercise partial-line buffering
    let bytes = records.into_bytes();
    let parts: Vec<Result<Bytes, std::io::Error>> = bytes
        .chunks(7)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let scanner = EventScanner::new(futures::stream::iter(parts), Framing::Sse);

    let channel = Arc::new(Channel::new(1, ChannelType::OpenAI, "sk"));
    let meta = Meta::new(Mode::ChatCompletions, channel, "gpt-4o", true).with_input_tokens(4);
    let (writer, mut rx) = RelayWriter::channel(64);

    let usage = relay_records(&meta, scanner, &writer, |record| {
        let chunk: StreamChunk = serde_json::from_str(record)?;
        Ok(StreamStep::chunk(chunk))
    })
    .await
    .unwrap();

    let (chunks, done) = drain(&mut rx);
    assert!(done);
    assert_eq!(text_of(&chunks), pieces.concat());
    assert_eq!(usage.prompt_tokens, 4);
    assert!(usage.completion_tokens > 0);
    assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
}

#[tokio::test]
async fn test_ollama_ndjson_stream() {
    let server = MockServer::start_async().await;
    let body = concat!(
        "{\"model\":\"llama3.1:8b\",\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
        "{\"model\":\"llama3.1:8b\",\"message\":{\"role\":\"assistant\",\"content\":\" there\"},\"done\":false}\n",
        "{\"model\":\"llama3.1:8b\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":11,\"eval_count\":2}\n",
    );
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).header("content-type", "application/x-ndjson").body(body);
        })
        .await;

    let relay =
        relay_for(Channel::new(1, ChannelType::Ollama, "").with_base_url(server.base_url()));
    let (writer, mut rx) = RelayWriter::channel(16);

    let usage = relay
        .relay(Mode::ChatCompletions, stream_request("llama3.1:8b"), &writer)
        .await
        .unwrap();

    let (chunks, done) = drain(&mut rx);
    assert!(done);
    assert_eq!(text_of(&chunks), "Hi there");
    assert!(chunks.last().unwrap().has_finish_reason());
    assert_eq!(usage, Usage::new(11, 2));
}

#[tokio::test]
async fn test_anthropic_event_stream() {
    let server = MockServer::start_async().await;
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Bonjour\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .header("x-api-key", "sk-ant")
                .header_exists("anthropic-version");
            then.status(200).header("content-type", "text/event-stream").body(body);
        })
        .await;

    let channel =
        Channel::new(1, ChannelType::Anthropic, "sk-ant").with_base_url(server.base_url());
    let relay = relay_for(channel);
    let (writer, mut rx) = RelayWriter::channel(16);

    let usage = relay
        .relay(Mode::ChatCompletions, stream_request("claude-sonnet-4-20250514"), &writer)
        .await
        .unwrap();

    let (chunks, done) = drain(&mut rx);
    assert!(done);
    assert_eq!(text_of(&chunks), "Bonjour");
    let last = chunks.last().unwrap();
    assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
    assert_eq!(usage, Usage::new(12, 3));
    upstream.assert_async().await;
}

#[tokio::test]
async fn test_client_disconnect_ends_relay() {
    let server = MockServer::start_async().await;
    let body = format!("{}{}data: [DONE]\n\n", chunk_record("a", ""), chunk_record("b", ""));
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).header("content-type", "text/event-stream").body(body);
        })
        .await;

    let relay =
        relay_for(Channel::new(1, ChannelType::Moonshot, "sk").with_base_url(server.base_url()));
    let (writer, rx) = RelayWriter::channel(1);
    drop(rx);

    // The caller is gone; the relay stops and still reports usage
    let usage = relay
        .relay(Mode::ChatCompletions, stream_request("moonshot-v1-8k"), &writer)
        .await
        .unwrap();
    assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
}

fn text_record(text: &str) -> String {
    let chunk = StreamChunk::new("id", "m", 1).with_delta(airelay::openai::Delta::text(text), None);
    format!("data: {}\n\n", serde_json::to_string(&chunk).unwrap())
}

fn chunk_mapper(record: &str) -> anyhow::Result<StreamStep> {
    let chunk: StreamChunk = serde_json::from_str(record)?;
    let usage = chunk.usage;
    let step = StreamStep::chunk(chunk);
    Ok(match usage {
        Some(usage) => step.with_usage(usage),
        None => step,
    })
}

#[tokio::test]
async fn test_malformed_terminal_record_keeps_usage() {
    let with_usage = StreamChunk::new("id", "m", 1)
        .with_delta(airelay::openai::Delta::text("lo"), None)
        .with_usage(Usage::new(5, 2));
    let records = format!(
        "{}data: {}\n\ndata: {{\"choices\":[{{\"delta\":",
        text_record("Hel"),
        serde_json::to_string(&with_usage).unwrap(),
    );
    let parts: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from(records))];
    let scanner = EventScanner::new(futures::stream::iter(parts), Framing::Sse);

    let channel = Arc::new(Channel::new(1, ChannelType::OpenAI, "sk"));
    let meta = Meta::new(Mode::ChatCompletions, channel, "gpt-4o", true).with_input_tokens(9);
    let (writer, mut rx) = RelayWriter::channel(16);

    let usage = relay_records(&meta, scanner, &writer, chunk_mapper).await.unwrap();

    // the reported counters win over the local estimate
    assert_eq!(usage, Usage::new(5, 2));
    let (chunks, done) = drain(&mut rx);
    assert!(done);
    assert_eq!(chunks.len(), 3);
    assert_eq!(text_of(&chunks), "Hello");
    assert_eq!(chunks[2].choices[0].finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_disconnect_while_upstream_silent() {
    let first = text_record("thinking");
    // one record, then the upstream goes quiet without closing
    let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(first))])
        .chain(futures::stream::pending());
    let scanner = EventScanner::new(Box::pin(upstream), Framing::Sse);

    let channel = Arc::new(Channel::new(1, ChannelType::OpenAI, "sk"));
    let meta = Meta::new(Mode::ChatCompletions, channel, "gpt-4o", true).with_input_tokens(3);
    let (writer, mut rx) = RelayWriter::channel(4);

    let task =
        tokio::spawn(async move { relay_records(&meta, scanner, &writer, chunk_mapper).await });

    assert!(matches!(rx.recv().await, Some(RelayFrame::Event(_))));
    drop(rx);

    let usage = tokio::time::timeout(std::time::Duration::from_secs(3), task)
        .await
        .expect("relay should stop once the caller is gone")
        .unwrap()
        .unwrap();
    assert_eq!(usage.prompt_tokens, 3);
    assert!(usage.completion_tokens > 0);
}

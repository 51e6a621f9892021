//! Relay endpoint handler
//!
//! Every OpenAI-compatible route lands here. The inbound body is decoded
//! according to the path's mode, the relay runs on its own task, and the
//! first frame it writes decides whether the caller gets a buffered body or
//! an event stream.

use crate::handlers::AppState;
use crate::middleware::RequestId;
use crate::models::mode::Mode;
use crate::models::openai::{AudioTranscriptionRequest, DocumentRequest, RelayRequest};
use crate::services::{RelayFrame, RelayWriter};
use crate::utils::error::{AppError, AppResult};
use crate::utils::logging::create_request_log_summary;
use axum::{
    body::{to_bytes, Body},
    extract::{FromRequest, Multipart, Request, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use bytes::Bytes;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

/// Aborts the relay task if the handler is dropped before the first frame
struct AbortOnDrop(Option<JoinHandle<AppResult<()>>>);

impl AbortOnDrop {
    fn take(&mut self) -> Option<JoinHandle<AppResult<()>>> {
        self.0.take()
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Handle any relay route
///
/// POST /v1/chat/completions, /v1/embeddings, /v1/audio/speech, ...
pub async fn relay_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let mode = Mode::from_path(request.uri().path());
    if mode == Mode::Unknown {
        return AppError::NotFound(format!("unknown relay path {}", request.uri().path()))
            .into_response();
    }

    let request_id = request.extensions().get::<RequestId>().map(|id| id.0.clone());
    let max_size = state.settings.request.max_request_size;

    let relay_request = match read_relay_request(mode, request, max_size).await {
        Ok(relay_request) => relay_request,
        Err(e) => return e.into_response(),
    };
    debug!("Relay request: {}", create_request_log_summary(&relay_request));

    let (writer, mut rx) = RelayWriter::channel(state.settings.request.stream_buffer);
    let relay = Arc::clone(&state.relay);
    let mut guard = AbortOnDrop(Some(tokio::spawn(async move {
        relay
            .relay_with_id(request_id, mode, relay_request, &writer)
            .await
            .map(|_| ())
    })));

    match rx.recv().await {
        Some(RelayFrame::Body {
            status,
            content_type,
            body,
        }) => {
            // The task has written everything it will write; let it finish on its own
            if let Some(handle) = guard.take() {
                log_outcome(handle);
            }
            body_response(status, &content_type, body)
        }
        Some(first) => {
            if let Some(handle) = guard.take() {
                log_outcome(handle);
            }
            stream_response(first, rx)
        }
        None => match guard.take() {
            Some(handle) => match handle.await {
                Ok(Err(e)) => e.into_response(),
                Ok(Ok(())) => {
                    AppError::Internal("relay finished without writing a response".to_string())
                        .into_response()
                }
                Err(e) => {
                    error!("Relay task failed: {}", e);
                    AppError::Internal("relay task failed".to_string()).into_response()
                }
            },
            None => AppError::Internal("relay task missing".to_string()).into_response(),
        },
    }
}

/// Errors raised after the response has started can only be logged
fn log_outcome(handle: JoinHandle<AppResult<()>>) {
    tokio::spawn(await_outcome(handle));
}

/// Wait for a detached relay task and log how it ended
async fn await_outcome(handle: JoinHandle<AppResult<()>>) -> Option<AppError> {
    match handle.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            e.log();
            Some(e)
        }
        Err(e) if e.is_cancelled() => {
            debug!("Relay task cancelled");
            None
        }
        Err(e) => {
            error!("Relay task failed: {}", e);
            Some(AppError::Internal("relay task failed".to_string()))
        }
    }
}

fn body_response(status: StatusCode, content_type: &str, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

fn frame_to_event(frame: RelayFrame) -> Option<Event> {
    match frame {
        RelayFrame::Event(data) => Some(Event::default().data(data)),
        RelayFrame::Done => Some(Event::default().data("[DONE]")),
        RelayFrame::Body { .. } => None,
    }
}

fn stream_response(first: RelayFrame, rx: tokio::sync::mpsc::Receiver<RelayFrame>) -> Response {
    debug!("Starting streaming response transmission");
    let events = futures::stream::iter(std::iter::once(first))
        .chain(ReceiverStream::new(rx))
        .filter_map(|frame| async move { frame_to_event(frame).map(Ok::<_, Infallible>) });

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
        .into_response()
}

/// Decode the inbound body into the request shape of `mode`
pub async fn read_relay_request(
    mode: Mode,
    request: Request,
    max_size: usize,
) -> AppResult<RelayRequest> {
    if mode.is_multipart() {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| AppError::Validation(format!("invalid multipart body: {}", e)))?;
        return read_multipart(mode, multipart).await;
    }

    let body = to_bytes(request.into_body(), max_size)
        .await
        .map_err(|e| AppError::Validation(format!("failed to read request body: {}", e)))?;
    RelayRequest::from_json(mode, &body)
}

async fn read_multipart(mode: Mode, mut multipart: Multipart) -> AppResult<RelayRequest> {
    let mut upload = AudioTranscriptionRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            upload.file_name = field.file_name().unwrap_or("upload").to_string();
            upload.content_type = field.content_type().map(str::to_string);
            upload.file = field
                .bytes()
                .await
                .map_err(|e| AppError::Validation(format!("failed to read uploaded file: {}", e)))?;
            continue;
        }

        let value = field.text().await.map_err(|e| {
            AppError::Validation(format!("invalid multipart field '{}': {}", name, e))
        })?;
        match name.as_str() {
            "model" => upload.model = value,
            "language" => upload.language = Some(value),
            "prompt" => upload.prompt = Some(value),
            "response_format" => upload.response_format = Some(value),
            "temperature" => {
                let temperature = value.trim().parse().map_err(|_| AppError::InvalidField {
                    field: "temperature".to_string(),
                    message: format!("'{}' is not a number", value),
                })?;
                upload.temperature = Some(temperature);
            }
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    if mode == Mode::ParsePdf {
        return Ok(RelayRequest::Document(DocumentRequest {
            model: upload.model,
            file: upload.file,
            file_name: upload.file_name,
            response_format: upload.response_format,
        }));
    }
    Ok(RelayRequest::Transcription(upload))
}

//! Response writer shared by the relay task and the HTTP response
//!
//! The relay task writes frames into a bounded channel. The HTTP layer turns
//! the receiving half into either one buffered body or an event stream.

use crate::utils::error::{AppError, AppResult};
use axum::http::StatusCode;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

/// One unit written towards the caller
#[derive(Debug, Clone)]
pub enum RelayFrame {
    /// Complete non-streaming body
    Body {
        status: StatusCode,
        content_type: String,
        body: Bytes,
    },
    /// One `data:` payload of an event stream
    Event(String),
    /// Stream terminator (`data: [DONE]`)
    Done,
}

#[derive(Debug, Clone)]
pub struct RelayWriter {
    tx: mpsc::Sender<RelayFrame>,
}

impl RelayWriter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RelayFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn send(&self, frame: RelayFrame) -> AppResult<()> {
        self.tx.send(frame).await.map_err(|_| AppError::ClientClosed)
    }

    /// Write a complete JSON body
    pub async fn write_json<T: Serialize>(&self, status: StatusCode, value: &T) -> AppResult<()> {
        let body = serde_json::to_vec(value)?;
        self.write_bytes(status, "application/json", Bytes::from(body)).await
    }

    /// Write a complete body with an explicit content type
    pub async fn write_bytes(
        &self,
        status: StatusCode,
        content_type: &str,
        body: Bytes,
    ) -> AppResult<()> {
        self.send(RelayFrame::Body {
            status,
            content_type: content_type.to_string(),
            body,
        })
        .await
    }

    /// Serialize and flush one stream chunk
    pub async fn write_chunk<T: Serialize>(&self, chunk: &T) -> AppResult<()> {
        let data = serde_json::to_string(chunk)?;
        self.send(RelayFrame::Event(data)).await
    }

    pub async fn write_done(&self) -> AppResult<()> {
        self.send(RelayFrame::Done).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiving side has been dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (writer, mut rx) = RelayWriter::channel(4);
        writer.write_chunk(&serde_json::json!({"n": 1})).await.unwrap();
        writer.write_done().await.unwrap();

        match rx.recv().await {
            Some(RelayFrame::Event(data)) => assert_eq!(data, r#"{"n":1}"#),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(RelayFrame::Done)));
    }

    #[tokio::test]
    async fn test_closed_receiver_is_client_closed() {
        let (writer, rx) = RelayWriter::channel(1);
        drop(rx);
        let result = writer.write_done().await;
        assert!(matches!(result, Err(AppError::ClientClosed)));
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn test_closed_resolves_on_receiver_drop() {
        let (writer, rx) = RelayWriter::channel(1);
        let waiter = tokio::spawn(async move { writer.closed().await });
        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve")
            .unwrap();
    }
}

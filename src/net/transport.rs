//! The websocket transport wrapper (§4.7/C8). A connection's writes must be
//! serialized — the session handler, the sync task and a domain teardown can
//! all want to write or close the same socket — so sends go through a
//! mutex-guarded sink, mirroring the teacher's netio output writers.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::Mutex;

use crate::error::RelayError;

pub struct Websocket {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl Websocket {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink: Mutex::new(sink) }
    }

    pub async fn write_binary(&self, buf: Vec<u8>) -> Result<(), RelayError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(buf))
            .await
            .map_err(|e| RelayError::transport(format!("write failed: {e}")))
    }

    pub async fn write_pong(&self, buf: Vec<u8>) -> Result<(), RelayError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Pong(buf))
            .await
            .map_err(|e| RelayError::transport(format!("pong write failed: {e}")))
    }

    /// Best-effort close, used by domain teardown and by the ping
    /// version-gate ban. Errors are swallowed: the socket may already be
    /// gone, which is exactly the state the caller is trying to reach.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}

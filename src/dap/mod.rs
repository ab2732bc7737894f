//! DAP-facing front end: envelope types, Content-Length framed transport
//! and the per-client serve loop. One client connection == one debug
//! session. Requests are dispatched on their own tasks so a deferred
//! request (waiting on a prerequisite) can never block the read loop.

pub mod protocol;
pub mod transport;

use crate::session::DebugSession;
use protocol::{DapEvent, DapRequest, DapResponse};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use transport::{DapReader, DapWriter};

/// The outbound half of a client connection. Responses and events share
/// one writer and one seq counter; writes are serialized by the lock.
pub struct ClientSink {
    inner: Mutex<SinkInner>,
}

struct SinkInner {
    writer: DapWriter<Box<dyn AsyncWrite + Send + Unpin>>,
    seq: i64,
}

impl ClientSink {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        ClientSink {
            inner: Mutex::new(SinkInner {
                writer: DapWriter::new(Box::new(writer)),
                seq: 0,
            }),
        }
    }

    pub async fn respond_success(&self, request: &DapRequest, body: Option<Value>) {
        self.respond(request, true, None, body).await;
    }

    pub async fn respond_error(&self, request: &DapRequest, message: String) {
        self.respond(request, false, Some(message), None).await;
    }

    async fn respond(
        &self,
        request: &DapRequest,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.seq += 1;
        let response = DapResponse {
            seq: inner.seq,
            r#type: "response",
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        };
        if let Err(e) = inner.writer.write_message(&response).await {
            log::error!(target: "dap", "response write failed: {e:#}");
        }
    }

    pub async fn event(&self, event: &'static str, body: Option<Value>) {
        let mut inner = self.inner.lock().await;
        inner.seq += 1;
        let event = DapEvent {
            seq: inner.seq,
            r#type: "event",
            event,
            body,
        };
        if let Err(e) = inner.writer.write_message(&event).await {
            log::error!(target: "dap", "event write failed: {e:#}");
        }
    }

    pub async fn initialized(&self) {
        self.event("initialized", None).await;
    }

    pub async fn stopped(&self, reason: &str, description: Option<String>) {
        self.event(
            "stopped",
            Some(json!({
                "reason": reason,
                "description": description,
                "threadId": crate::session::THREAD_ID,
                "allThreadsStopped": true,
            })),
        )
        .await;
    }

    pub async fn terminated(&self) {
        self.event("terminated", None).await;
    }

    pub async fn exited(&self, code: i64) {
        self.event("exited", Some(json!({ "exitCode": code }))).await;
    }

    pub async fn output(&self, category: &str, text: impl Into<String>) {
        self.event(
            "output",
            Some(json!({ "category": category, "output": text.into() })),
        )
        .await;
    }
}

/// Serve one DAP client until it disconnects or the session shuts down.
pub async fn serve<R, W>(read: R, write: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let sink = Arc::new(ClientSink::new(write));
    let session = Arc::new(DebugSession::new(sink));
    let mut reader = DapReader::new(read);
    let mut closed = session.closed_signal();

    loop {
        tokio::select! {
            message = reader.read_message::<DapRequest>() => {
                match message {
                    Ok(request) => {
                        let session = session.clone();
                        tokio::spawn(async move { session.handle(request).await });
                    }
                    Err(e) => {
                        log::debug!(target: "dap", "client read ended: {e:#}");
                        break;
                    }
                }
            }
            _ = closed.wait_for(|closed| *closed) => {
                log::info!(target: "dap", "session closed");
                break;
            }
        }
    }

    // The client may vanish without a disconnect request.
    session.shutdown().await;
    Ok(())
}

//! A scripted stand-in for the script-execution server: accepts wire
//! connections, records every call, answers via a test-supplied responder
//! and pushes events on demand.

use remdap::remote::wire::{self, Frame, STATUS_OK};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;

#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Ordinal of the accepted connection; restart opens a second one.
    pub generation: u32,
    pub id: u64,
    pub func: String,
    pub data: Value,
}

pub enum Reply {
    Ok(Value),
    Fail(String),
    /// Record the call but answer nothing; the test replies manually.
    Silent,
}

pub type Responder = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

pub struct FakeServer {
    pub addr: String,
    calls: Arc<Mutex<Vec<CallRecord>>>,
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
}

impl FakeServer {
    pub async fn spawn(responder: Responder) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let calls: Arc<Mutex<Vec<CallRecord>>> = Arc::default();
        let writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>> = Arc::default();

        tokio::spawn({
            let calls = calls.clone();
            let writer = writer.clone();
            async move {
                let mut generation = 0u32;
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    generation += 1;
                    let (mut read, write) = stream.into_split();
                    *writer.lock().await = Some(write);

                    loop {
                        let frame = match wire::read_frame(&mut read).await {
                            Ok(frame) => frame,
                            Err(_) => break,
                        };
                        let (Some(id), Some(func)) = (frame.id, frame.func.clone()) else {
                            continue;
                        };
                        calls.lock().unwrap().push(CallRecord {
                            generation,
                            id,
                            func: func.clone(),
                            data: frame.data.clone(),
                        });
                        let response = match responder(&func, &frame.data) {
                            Reply::Ok(data) => Frame {
                                id: Some(id),
                                func: None,
                                event: None,
                                data,
                                message: STATUS_OK.to_string(),
                            },
                            Reply::Fail(message) => Frame {
                                id: Some(id),
                                func: None,
                                event: None,
                                data: Value::Null,
                                message,
                            },
                            Reply::Silent => continue,
                        };
                        let mut guard = writer.lock().await;
                        if let Some(w) = guard.as_mut() {
                            let _ = wire::write_frame(w, &response).await;
                        }
                    }
                }
            }
        });

        FakeServer {
            addr,
            calls,
            writer,
        }
    }

    pub async fn emit(&self, event: &str, data: Value) {
        self.emit_with_status(event, data, STATUS_OK).await;
    }

    pub async fn emit_with_status(&self, event: &str, data: Value, message: &str) {
        let frame = Frame {
            id: None,
            func: None,
            event: Some(event.to_string()),
            data,
            message: message.to_string(),
        };
        self.send_raw(frame).await;
    }

    pub async fn send_raw(&self, frame: Frame) {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().expect("no client connected");
        wire::write_frame(writer, &frame).await.unwrap();
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, func: &str) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|c| c.func == func)
            .collect()
    }

    /// Poll until `func` has been called at least `count` times.
    pub async fn wait_for_calls(&self, func: &str, count: usize) -> Vec<CallRecord> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let matching = self.calls_named(func);
            if matching.len() >= count {
                return matching;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} `{func}` call(s), saw {}",
                matching.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Unwrap one argument out of the value-object encoding produced by the
/// adapter: `{"type":"map","value":{key: {"type":..,"value": v}}}`.
pub fn unwrap_arg(data: &Value, key: &str) -> Value {
    data["value"][key]["value"].clone()
}

pub async fn wait_until(mut probe: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !probe() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

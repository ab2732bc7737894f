//! The RPC channel to the script-execution server: one TCP connection
//! multiplexing many logical calls, plus server-pushed events.
//!
//! Calls are correlated by an id allocated from a per-channel counter and
//! serialized at the send point (a send waits for the preceding send, not
//! its response). Responses resolve out of order. Transport loss is
//! reported through the injected error callback because the receive loop
//! is not awaited by any caller.

pub mod proto;
pub mod value;
pub mod wire;

use crate::error::Error;
use proto::{RemoteEvent, RemoteEventKind, RemoteFn};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, oneshot};
use wire::Frame;

pub type EventHandler = Arc<dyn Fn(RemoteEvent) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

type CallReply = Result<Value, Error>;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

pub struct RemoteClient {
    shared: Arc<Shared>,
}

struct Shared {
    next_id: AtomicU64,
    terminated: AtomicBool,
    pending: StdMutex<HashMap<u64, PendingCall>>,
    handlers: StdMutex<HashMap<RemoteEventKind, EventHandler>>,
    /// Fair mutex over the write half: acquisition order is send order.
    writer: Mutex<Option<OwnedWriteHalf>>,
    on_error: ErrorHandler,
}

struct PendingCall {
    func: String,
    reply: oneshot::Sender<CallReply>,
}

impl RemoteClient {
    pub fn new(on_error: impl Fn(Error) + Send + Sync + 'static) -> Self {
        RemoteClient {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(0),
                terminated: AtomicBool::new(false),
                pending: StdMutex::new(HashMap::new()),
                handlers: StdMutex::new(HashMap::new()),
                writer: Mutex::new(None),
                on_error: Arc::new(on_error),
            }),
        }
    }

    /// Open the connection and authenticate. Idempotent: returns
    /// immediately if the channel is already open.
    pub async fn connect(&self, addr: &str, credentials: &Credentials) -> Result<(), Error> {
        if self.shared.terminated.load(Ordering::SeqCst) {
            return Err(Error::Connection("channel is terminated".to_string()));
        }
        {
            let writer = self.shared.writer.lock().await;
            if writer.is_some() {
                return Ok(());
            }
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        *self.shared.writer.lock().await = Some(write_half);
        tokio::spawn(Shared::receive_loop(self.shared.clone(), read_half));

        // The login call is the single payload not expressed in the
        // value-object model: a bare two-element argument list.
        let login = json!([credentials.user, credentials.password]);
        if let Err(e) = self.call_raw(RemoteFn::Login, login).await {
            self.terminate().await;
            return Err(Error::Connection(format!("login rejected: {e}")));
        }
        log::info!(target: "remote", "connected to {addr}");
        Ok(())
    }

    /// Invoke a remote function. Arguments are wrapped into the server's
    /// value-object model. After termination this is a no-op resolving to
    /// `Value::Null` without touching the wire.
    pub async fn call(&self, func: RemoteFn, args: Value) -> Result<Value, Error> {
        self.call_raw(func, serde_json::to_value(value::wrap_args(args))?)
            .await
    }

    async fn call_raw(&self, func: RemoteFn, data: Value) -> Result<Value, Error> {
        if self.shared.terminated.load(Ordering::SeqCst) {
            return Ok(Value::Null);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(
            id,
            PendingCall {
                func: func.as_ref().to_string(),
                reply: tx,
            },
        );

        let frame = Frame::call(id, func.as_ref(), data);
        {
            let mut writer = self.shared.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                self.shared.pending.lock().unwrap().remove(&id);
                return Err(Error::ChannelClosed);
            };
            log::trace!(target: "remote", "-> #{id} {}", func.as_ref());
            if let Err(e) = wire::write_frame(writer, &frame).await {
                self.shared.pending.lock().unwrap().remove(&id);
                return Err(e);
            }
        }

        rx.await.unwrap_or(Err(Error::ChannelClosed))
    }

    /// Register the handler for an event name. Registering twice replaces
    /// the previous handler: sessions re-register on reconnect.
    pub fn on(&self, kind: RemoteEventKind, handler: impl Fn(RemoteEvent) + Send + Sync + 'static) {
        self.shared
            .handlers
            .lock()
            .unwrap()
            .insert(kind, Arc::new(handler));
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// Mark the channel terminated and close the transport. Every call
    /// still pending is rejected with `ChannelClosed` rather than left
    /// hanging.
    pub async fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.reject_pending();
    }
}

impl Shared {
    async fn receive_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
        loop {
            match wire::read_frame(&mut reader).await {
                Ok(frame) => shared.dispatch(frame),
                Err(e) => {
                    if !shared.terminated.swap(true, Ordering::SeqCst) {
                        shared.reject_pending();
                        (shared.on_error)(Error::Connection(format!("connection lost: {e}")));
                    }
                    break;
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        if let Some(name) = frame.event.clone() {
            self.dispatch_event(&name, frame);
        } else if let Some(id) = frame.id {
            self.dispatch_reply(id, frame);
        } else {
            log::warn!(target: "remote", "protocol violation: frame with neither id nor event");
        }
    }

    fn dispatch_event(&self, name: &str, frame: Frame) {
        let Ok(kind) = RemoteEventKind::from_str(name) else {
            log::warn!(target: "remote", "protocol violation: unknown event `{name}`");
            return;
        };
        if !frame.is_ok() && !kind.carries_failure() {
            (self.on_error)(Error::RemoteFailure(name.to_string(), frame.message));
            return;
        }
        let event = match proto::decode_event(name, frame.data) {
            Ok(event) => event,
            Err(e) => {
                log::warn!(target: "remote", "protocol violation: {e}");
                return;
            }
        };
        let handler = self.handlers.lock().unwrap().get(&kind).cloned();
        match handler {
            Some(handler) => handler(event),
            None => log::warn!(target: "remote", "no handler for event `{name}`"),
        }
    }

    fn dispatch_reply(&self, id: u64, frame: Frame) {
        // First response wins; a second response for the same id lands here.
        let Some(pending) = self.pending.lock().unwrap().remove(&id) else {
            log::warn!(target: "remote", "protocol violation: response for unknown call #{id}");
            return;
        };
        log::trace!(target: "remote", "<- #{id} {}", frame.message);
        let reply = if frame.is_ok() {
            Ok(frame.data)
        } else {
            Err(Error::RemoteFailure(pending.func, frame.message))
        };
        let _ = pending.reply.send(reply);
    }

    fn reject_pending(&self) {
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            let _ = call.reply.send(Err(Error::ChannelClosed));
        }
    }
}

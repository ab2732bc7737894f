//! The DAP-facing session state machine. Owns the session lifecycle
//! (initialize → launch → configure → run → step/stop → terminate), the
//! stack-trace cache, variable-reference handling, breakpoint
//! orchestration and restart/disconnect sequencing.
//!
//! Editor requests and remote events interleave freely; anything that
//! depends on session state not yet established blocks on the
//! prerequisite gate instead of racing.

pub mod prereq;
pub mod sources;
pub mod variable;

use crate::dap::ClientSink;
use crate::dap::protocol::{
    self, DapRequest, LaunchArguments, ScopesArguments, SetBreakpointsArguments,
    SetExceptionBreakpointsArguments, SourceRequestArguments, StackTraceArguments,
    VariablesArguments,
};
use crate::error::Error;
use crate::remote::proto::{self, RemoteEvent, RemoteEventKind, RemoteException, RemoteFn};
use crate::remote::{Credentials, RemoteClient};
use crate::{muted_error, weak_error};
use itertools::Itertools;
use prereq::{CONFIGURATION_DONE, PrereqGate, SCRIPT_RESOLVED, SOURCE_LOADED};
use serde_json::{Value, json};
use sources::{BreakpointRecord, SourceRegistry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use variable::{VarRef, render_variable};

/// The protocol reports exactly one thread.
pub const THREAD_ID: i64 = 1;

pub struct DebugSession {
    sink: Arc<ClientSink>,
    gate: PrereqGate,
    /// Replaced wholesale on restart; never mutated in place.
    remote: StdMutex<Option<Arc<RemoteClient>>>,
    state: Mutex<State>,
    stack: StackCache,
    restarting: AtomicBool,
    terminated: AtomicBool,
    closed: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    sources: SourceRegistry,
    launch: Option<LaunchContext>,
    breakpoint_seq: u64,
    break_on_exception: bool,
    exception: Option<ExceptionState>,
    /// Scope listings by frame id, kept for the name lookup a single
    /// variable fetch requires.
    scope_cache: HashMap<u32, Vec<proto::RawVariable>>,
}

#[derive(Clone)]
struct LaunchContext {
    script_path: PathBuf,
    entry_name: String,
    url: String,
    credentials: Credentials,
}

struct ExceptionState {
    description: String,
    line: Option<u64>,
    module: Option<String>,
    compile_error: bool,
}

#[derive(Default)]
struct StackCache {
    /// Coalesces concurrent rebuilds: late arrivals wait here, then find
    /// the cache clean.
    rebuild: tokio::sync::Mutex<()>,
    frames: StdMutex<Vec<CachedFrame>>,
    dirty: AtomicBool,
}

#[derive(Debug, Clone)]
struct CachedFrame {
    id: u32,
    name: String,
    line: Option<u64>,
    source: Option<FrameSource>,
}

#[derive(Debug, Clone)]
struct FrameSource {
    name: String,
    path: String,
    reference: i64,
}

impl DebugSession {
    pub fn new(sink: Arc<ClientSink>) -> Self {
        let gate = PrereqGate::new();
        gate.create(SOURCE_LOADED);
        gate.create(SCRIPT_RESOLVED);
        gate.create(CONFIGURATION_DONE);
        let (closed, _) = watch::channel(false);
        DebugSession {
            sink,
            gate,
            remote: StdMutex::new(None),
            state: Mutex::new(State::default()),
            stack: StackCache::default(),
            restarting: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            closed,
        }
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Entry point for one editor request. Requests arriving after
    /// termination are silently swallowed rather than attempted against a
    /// dead channel; only `disconnect` stays answerable.
    pub async fn handle(self: &Arc<Self>, request: DapRequest) {
        if self.terminated.load(Ordering::SeqCst) && request.command != "disconnect" {
            log::debug!(target: "session", "ignoring `{}` after termination", request.command);
            return;
        }
        log::debug!(target: "dap", "{}: {}", request.seq, request.command);

        match self.dispatch(&request).await {
            Ok(body) => self.sink.respond_success(&request, body).await,
            Err(e) => {
                log::error!(target: "session", "{}: {e}", request.command);
                self.sink.respond_error(&request, e.to_string()).await;
                if e.is_fatal() {
                    self.fail(&e).await;
                }
            }
        }

        match request.command.as_str() {
            "initialize" => self.sink.initialized().await,
            "disconnect" => {
                let _ = self.closed.send(true);
            }
            _ => {}
        }
    }

    async fn dispatch(self: &Arc<Self>, request: &DapRequest) -> Result<Option<Value>, Error> {
        let args = request.arguments.clone();
        match request.command.as_str() {
            "initialize" => Ok(Some(protocol::capabilities())),
            "launch" => self.launch(serde_json::from_value(args)?).await,
            "setBreakpoints" => self.set_breakpoints(serde_json::from_value(args)?).await,
            "setExceptionBreakpoints" => {
                self.set_exception_breakpoints(serde_json::from_value(args)?)
                    .await
            }
            "configurationDone" => {
                self.gate.resolve(CONFIGURATION_DONE);
                Ok(None)
            }
            "threads" => Ok(Some(json!({
                "threads": [{"id": THREAD_ID, "name": "main"}]
            }))),
            "stackTrace" => {
                self.stack_trace(serde_json::from_value(args).unwrap_or_default())
                    .await
            }
            "scopes" => self.scopes(serde_json::from_value(args)?),
            "variables" => self.variables(serde_json::from_value(args)?).await,
            "continue" => {
                self.remote()?
                    .call(RemoteFn::ContinueRun, json!({}))
                    .await?;
                Ok(Some(json!({"allThreadsContinued": true})))
            }
            "pause" => {
                self.remote()?.call(RemoteFn::PauseRun, json!({})).await?;
                Ok(None)
            }
            "next" => {
                self.remote()?.call(RemoteFn::StepOver, json!({})).await?;
                Ok(None)
            }
            "stepIn" => {
                self.remote()?.call(RemoteFn::StepInto, json!({})).await?;
                Ok(None)
            }
            "stepOut" => {
                self.remote()?.call(RemoteFn::StepOut, json!({})).await?;
                Ok(None)
            }
            "restart" => self.restart().await,
            "disconnect" => {
                self.shutdown().await;
                Ok(None)
            }
            "exceptionInfo" => self.exception_info().await,
            "source" => self.source(serde_json::from_value(args)?).await,
            "loadedSources" => self.loaded_sources().await,
            other => Err(Error::UnsupportedRequest(other.to_string())),
        }
    }

    // ---------------------------------- lifecycle ------------------------------------------------

    async fn launch(self: &Arc<Self>, args: LaunchArguments) -> Result<Option<Value>, Error> {
        let script = PathBuf::from(&args.script);
        // A missing entry script must degrade to a visible termination,
        // not a protocol stall further down.
        let content = tokio::fs::read_to_string(&script)
            .await
            .map_err(|_| Error::EntryScriptMissing(args.script.clone()))?;

        if !args.auto_login {
            log::debug!(target: "session", "autoLogin disabled, using launch credentials anyway");
        }
        let credentials = Credentials {
            user: args.user.clone(),
            password: args.password.clone(),
        };
        let remote = self.new_channel();
        remote.connect(&args.url, &credentials).await?;
        *self.remote.lock().unwrap() = Some(remote.clone());

        let entry_name = script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string());
        {
            let mut state = self.state.lock().await;
            let entry_ref = state.sources.add(&entry_name, &script);
            state.sources.set_content(entry_ref, content.clone())?;
            state.launch = Some(LaunchContext {
                script_path: script.clone(),
                entry_name: entry_name.clone(),
                url: args.url.clone(),
                credentials,
            });
        }
        self.gate.resolve(SOURCE_LOADED);

        self.parse_script(&remote, &script, content).await?;
        self.gate.resolve(SCRIPT_RESOLVED);

        // Breakpoint configuration races ahead of the launch request;
        // the run must not start before the editor finished configuring.
        self.gate.wait(CONFIGURATION_DONE).await;

        let break_on_exception = self.state.lock().await.break_on_exception;
        if break_on_exception {
            remote
                .call(RemoteFn::SetAllExceptionBreak, json!({"enabled": true}))
                .await?;
        }

        remote.call(RemoteFn::RunScriptWithDebug, json!({})).await?;
        log::info!(target: "session", "launched {}", script.display());
        Ok(None)
    }

    /// Parse the entry source remotely; the response names the auxiliary
    /// modules it references, each of which becomes a registered source.
    async fn parse_script(
        &self,
        remote: &RemoteClient,
        script: &Path,
        content: String,
    ) -> Result<(), Error> {
        let data = remote
            .call(
                RemoteFn::ParseScriptWithDebug,
                json!({"module": "", "source": content}),
            )
            .await?;
        let parsed = proto::parse_result_from(data)?;

        let dir = script.parent().map(PathBuf::from).unwrap_or_default();
        let mut state = self.state.lock().await;
        for module in parsed.modules {
            let path = module
                .path
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| dir.join(&module.name));
            state.sources.add(&module.name, path);
        }
        Ok(())
    }

    async fn restart(self: &Arc<Self>) -> Result<Option<Value>, Error> {
        // One restart at a time; concurrent requests are dropped.
        if self.restarting.swap(true, Ordering::SeqCst) {
            log::debug!(target: "session", "restart already in flight");
            return Ok(None);
        }
        let result = self.restart_inner().await;
        self.restarting.store(false, Ordering::SeqCst);
        result
    }

    async fn restart_inner(self: &Arc<Self>) -> Result<Option<Value>, Error> {
        let (snapshot, ctx, break_on_exception) = {
            let state = self.state.lock().await;
            let ctx = state.launch.clone().ok_or(Error::NotLaunched)?;
            (
                state.sources.breakpoint_snapshot(),
                ctx,
                state.break_on_exception,
            )
        };

        let old = self.remote.lock().unwrap().take();
        if let Some(old) = old {
            old.terminate().await;
        }

        // Latches are one-shot; a restart gets fresh ones. Configuration
        // already happened in this session, so that latch starts resolved.
        self.gate.create(SOURCE_LOADED);
        self.gate.create(SCRIPT_RESOLVED);
        self.gate.create(CONFIGURATION_DONE);
        self.gate.resolve(CONFIGURATION_DONE);

        let remote = self.new_channel();
        remote.connect(&ctx.url, &ctx.credentials).await?;
        *self.remote.lock().unwrap() = Some(remote.clone());

        let content = tokio::fs::read_to_string(&ctx.script_path)
            .await
            .map_err(|_| Error::EntryScriptMissing(ctx.script_path.display().to_string()))?;

        {
            // The registry is replaced, not repaired: fresh handle numbering.
            let mut state = self.state.lock().await;
            state.sources = SourceRegistry::new();
            let entry_ref = state.sources.add(&ctx.entry_name, &ctx.script_path);
            state.sources.set_content(entry_ref, content.clone())?;
            state.exception = None;
            state.scope_cache.clear();
        }
        self.gate.resolve(SOURCE_LOADED);

        self.parse_script(&remote, &ctx.script_path, content).await?;
        self.gate.resolve(SCRIPT_RESOLVED);

        // Replay the breakpoint snapshot against the fresh registry.
        for (name, records) in snapshot {
            let module = if name == ctx.entry_name {
                ""
            } else {
                name.as_str()
            };
            let lines: Vec<u64> = records.iter().map(|r| r.line).collect();
            let data = remote
                .call(RemoteFn::SetBreaks, json!({"module": module, "lines": lines}))
                .await?;
            let accepted = proto::breaks_result_from(data)?.lines;
            let records: Vec<BreakpointRecord> = records
                .into_iter()
                .map(|r| BreakpointRecord {
                    verified: accepted.contains(&r.line),
                    ..r
                })
                .collect();

            let mut state = self.state.lock().await;
            let reference = match state.sources.by_name(&name) {
                Ok(entry) => entry.reference,
                Err(e) => {
                    log::warn!(target: "session", "breakpoints for `{name}` not rehydrated: {e}");
                    continue;
                }
            };
            state.sources.set_breakpoints(reference, records)?;
        }

        if break_on_exception {
            remote
                .call(RemoteFn::SetAllExceptionBreak, json!({"enabled": true}))
                .await?;
        }

        self.stack.dirty.store(true, Ordering::SeqCst);
        remote.call(RemoteFn::RunScriptWithDebug, json!({})).await?;
        log::info!(target: "session", "restarted {}", ctx.script_path.display());
        Ok(None)
    }

    /// Stop the run and tear the channel down. Idempotent; safe to call
    /// both for an editor `disconnect` and for a vanished client.
    pub async fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            let _ = self.closed.send(true);
            return;
        }
        let remote = self.remote.lock().unwrap().clone();
        if let Some(remote) = remote {
            muted_error!(remote.call(RemoteFn::StopRun, json!({})).await);
            remote.terminate().await;
        }
        let _ = self.closed.send(true);
    }

    /// Unrecoverable failure: tell the user, then tear down.
    async fn fail(&self, error: &Error) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink
            .output("console", format!("debug session failed: {error}\n"))
            .await;
        self.sink.terminated().await;
        let remote = self.remote.lock().unwrap().clone();
        if let Some(remote) = remote {
            remote.terminate().await;
        }
    }

    // ---------------------------------- breakpoints ----------------------------------------------

    async fn set_breakpoints(
        self: &Arc<Self>,
        args: SetBreakpointsArguments,
    ) -> Result<Option<Value>, Error> {
        // Configuration can race ahead of script parsing.
        self.gate.wait(SOURCE_LOADED).await;
        self.gate.wait(SCRIPT_RESOLVED).await;

        let path = args
            .source
            .path
            .clone()
            .or(args.source.name.clone())
            .ok_or_else(|| Error::NoSourceForPath("<unnamed source>".to_string()))?;

        let (reference, module, source_path, needs_check) = {
            let state = self.state.lock().await;
            let reference = state.sources.resolve_path(&path)?;
            let entry = state.sources.get(reference)?;
            let entry_name = state
                .launch
                .as_ref()
                .map(|l| l.entry_name.clone())
                .unwrap_or_default();
            // The entry file has no remote module name.
            let module = if entry.name == entry_name {
                String::new()
            } else {
                entry.name.clone()
            };
            (
                reference,
                module,
                entry.path.clone(),
                !state.sources.consistency_checked(reference),
            )
        };

        if needs_check {
            self.spawn_consistency_check(reference, source_path);
        }

        let requested: Vec<u64> = args.breakpoints.iter().map(|bp| bp.line).collect();
        let data = self
            .remote()?
            .call(
                RemoteFn::SetBreaks,
                json!({"module": module, "lines": requested}),
            )
            .await?;
        let accepted = proto::breaks_result_from(data)?.lines;

        let mut state = self.state.lock().await;
        let records: Vec<BreakpointRecord> = requested
            .iter()
            .map(|&line| {
                state.breakpoint_seq += 1;
                BreakpointRecord {
                    id: state.breakpoint_seq,
                    line,
                    // Lines the server did not accept (blank lines and the
                    // like) stay in the list, unverified.
                    verified: accepted.contains(&line),
                }
            })
            .collect();
        state.sources.set_breakpoints(reference, records.clone())?;

        let body = json!({
            "breakpoints": records
                .iter()
                .map(|r| json!({"id": r.id, "line": r.line, "verified": r.verified}))
                .collect_vec()
        });
        Ok(Some(body))
    }

    /// Fire-and-forget comparison of the local file against the remote
    /// copy. A mismatch warns; it never blocks the breakpoint request.
    fn spawn_consistency_check(self: &Arc<Self>, reference: i64, path: PathBuf) {
        let session = self.clone();
        tokio::spawn(async move {
            let Ok(remote) = session.remote() else {
                return;
            };
            let verdict = {
                let mut state = session.state.lock().await;
                state
                    .sources
                    .check_consistency(reference, &path, &remote)
                    .await
            };
            if let Some(false) = weak_error!(verdict) {
                session
                    .sink
                    .output(
                        "console",
                        format!(
                            "warning: {} differs from the copy on the server; breakpoints may not bind where expected\n",
                            path.display()
                        ),
                    )
                    .await;
            }
        });
    }

    async fn set_exception_breakpoints(
        &self,
        args: SetExceptionBreakpointsArguments,
    ) -> Result<Option<Value>, Error> {
        let enabled = !args.filters.is_empty();
        self.state.lock().await.break_on_exception = enabled;
        // Before launch the channel does not exist yet; the flag is applied
        // by launch (and restart) in that case.
        let remote = self.remote.lock().unwrap().clone();
        if let Some(remote) = remote {
            remote
                .call(RemoteFn::SetAllExceptionBreak, json!({"enabled": enabled}))
                .await?;
        }
        Ok(None)
    }

    // ---------------------------------- inspection -----------------------------------------------

    async fn stack_trace(&self, args: StackTraceArguments) -> Result<Option<Value>, Error> {
        let frames = self.ensure_stack().await?;
        let start = args.start_frame.unwrap_or(0) as usize;
        let end = match args.levels {
            None | Some(0) => frames.len(),
            Some(levels) => (start + levels as usize).min(frames.len()),
        };
        let window = if start >= frames.len() {
            &[][..]
        } else {
            &frames[start..end]
        };

        Ok(Some(json!({
            "stackFrames": window.iter().map(frame_json).collect_vec(),
            "totalFrames": frames.len(),
        })))
    }

    /// Return the cached stack, rebuilding it if a stop event marked it
    /// dirty. Concurrent callers coalesce on the rebuild lock instead of
    /// issuing duplicate remote calls.
    async fn ensure_stack(&self) -> Result<Vec<CachedFrame>, Error> {
        if let Some(pinned) = self.pinned_compile_error_frame().await {
            return Ok(vec![pinned]);
        }

        if !self.stack.dirty.load(Ordering::SeqCst) {
            return Ok(self.stack.frames.lock().unwrap().clone());
        }
        let _rebuild = self.stack.rebuild.lock().await;
        if !self.stack.dirty.load(Ordering::SeqCst) {
            // Someone else rebuilt while we waited for the lock.
            return Ok(self.stack.frames.lock().unwrap().clone());
        }

        let remote = self.remote()?;
        let data = remote.call(RemoteFn::StackTrace, json!({})).await?;
        let mut remote_frames = proto::frames_from(data)?;

        // The server reports innermost-first and appends a shared-scope
        // pseudo-frame with no source line as the final entry.
        let shared = remote_frames.pop();
        remote_frames.reverse();

        let state = self.state.lock().await;
        let mut frames: Vec<CachedFrame> = remote_frames
            .into_iter()
            .map(|frame| {
                let source = self.frame_source(&state, frame.module.as_deref());
                CachedFrame {
                    id: 0,
                    name: frame.name,
                    line: frame.line,
                    source,
                }
            })
            .collect();
        if let Some(shared) = shared {
            frames.push(CachedFrame {
                id: 0,
                name: shared.name,
                line: None,
                source: None,
            });
        }
        drop(state);

        for (idx, frame) in frames.iter_mut().enumerate() {
            frame.id = idx as u32 + 1;
        }

        *self.stack.frames.lock().unwrap() = frames.clone();
        self.stack.dirty.store(false, Ordering::SeqCst);
        Ok(frames)
    }

    /// After a syntax error there is no real call stack; the trace is one
    /// frame pinned at the reported location until restart.
    async fn pinned_compile_error_frame(&self) -> Option<CachedFrame> {
        let state = self.state.lock().await;
        let exc = state.exception.as_ref().filter(|e| e.compile_error)?;
        let source = self.frame_source(&state, exc.module.as_deref());
        let name = source
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "<syntax error>".to_string());
        Some(CachedFrame {
            id: 1,
            name,
            line: exc.line,
            source,
        })
    }

    fn frame_source(&self, state: &State, module: Option<&str>) -> Option<FrameSource> {
        let name = match module.filter(|m| !m.is_empty()) {
            Some(module) => module.to_string(),
            // An empty module name designates the entry file.
            None => state.launch.as_ref()?.entry_name.clone(),
        };
        let entry = state.sources.by_name(&name).ok()?;
        Some(FrameSource {
            name: entry.name.clone(),
            path: entry.path.to_string_lossy().into_owned(),
            reference: entry.reference,
        })
    }

    fn scopes(&self, args: ScopesArguments) -> Result<Option<Value>, Error> {
        let frame_id =
            u32::try_from(args.frame_id).map_err(|_| Error::BadVariableReference(args.frame_id))?;
        Ok(Some(json!({
            "scopes": [{
                "name": "Locals",
                "presentationHint": "locals",
                "variablesReference": VarRef::Scope { frame_id }.pack(),
                "expensive": false,
            }]
        })))
    }

    async fn variables(&self, args: VariablesArguments) -> Result<Option<Value>, Error> {
        let raw = args.variables_reference;
        let Some(reference) = VarRef::unpack(raw) else {
            return Ok(Some(json!({"variables": []})));
        };
        let remote = self.remote()?;

        match reference {
            VarRef::Scope { frame_id } => {
                let data = remote
                    .call(RemoteFn::GetStackVariables, json!({"frame": frame_id}))
                    .await?;
                let vars = proto::variables_from(data)?;
                let rendered = vars
                    .iter()
                    .map(|var| variable_json(frame_id, var))
                    .collect_vec();
                // Keep the listing: expanding one of these variables later
                // needs its name, the server id alone is not enough.
                self.state.lock().await.scope_cache.insert(frame_id, vars);
                Ok(Some(json!({"variables": rendered})))
            }
            VarRef::Variable { frame_id, var_id } => {
                let name = self
                    .state
                    .lock()
                    .await
                    .scope_cache
                    .get(&frame_id)
                    .and_then(|vars| vars.iter().find(|v| v.id == Some(var_id)))
                    .map(|v| v.name.clone())
                    .ok_or(Error::BadVariableReference(raw))?;
                let data = remote
                    .call(
                        RemoteFn::GetVariable,
                        json!({"frame": frame_id, "name": name}),
                    )
                    .await?;
                let var = proto::variable_from(data)?;
                Ok(Some(json!({"variables": [variable_json(frame_id, &var)]})))
            }
        }
    }

    async fn exception_info(&self) -> Result<Option<Value>, Error> {
        let state = self.state.lock().await;
        let exc = state.exception.as_ref().ok_or(Error::NoException)?;
        Ok(Some(json!({
            "exceptionId": if exc.compile_error { "syntaxError" } else { "runtimeError" },
            "description": exc.description,
            "breakMode": "always",
        })))
    }

    async fn source(&self, args: SourceRequestArguments) -> Result<Option<Value>, Error> {
        let reference = args
            .source_reference
            .or(args.source.and_then(|s| s.source_reference))
            .ok_or_else(|| Error::SourceNotFound("<no reference>".to_string()))?;
        let remote = self.remote()?;
        let content = self
            .state
            .lock()
            .await
            .sources
            .content(reference, &remote)
            .await?;
        Ok(Some(json!({"content": content})))
    }

    async fn loaded_sources(&self) -> Result<Option<Value>, Error> {
        let state = self.state.lock().await;
        let sources = state
            .sources
            .entries()
            .map(|entry| {
                json!({
                    "name": entry.name,
                    "path": entry.path.to_string_lossy(),
                    "sourceReference": entry.reference,
                })
            })
            .collect_vec();
        Ok(Some(json!({"sources": sources})))
    }

    // ---------------------------------- remote events --------------------------------------------

    fn new_channel(self: &Arc<Self>) -> Arc<RemoteClient> {
        let weak = Arc::downgrade(self);
        let remote = Arc::new(RemoteClient::new(move |error| {
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move { session.on_channel_error(error).await });
            }
        }));
        self.register_event_handlers(&remote);
        remote
    }

    fn register_event_handlers(self: &Arc<Self>, remote: &RemoteClient) {
        let kinds = [
            RemoteEventKind::Breakpoint,
            RemoteEventKind::Step,
            RemoteEventKind::End,
            RemoteEventKind::Error,
            RemoteEventKind::Syntax,
            RemoteEventKind::Output,
        ];
        for kind in kinds {
            let weak = Arc::downgrade(self);
            remote.on(kind, move |event| {
                if let Some(session) = weak.upgrade() {
                    tokio::spawn(session.on_remote_event(event));
                }
            });
        }
    }

    async fn on_remote_event(self: Arc<Self>, event: RemoteEvent) {
        match event {
            RemoteEvent::Breakpoint(_) => {
                self.invalidate_stop_state().await;
                self.sink.stopped("breakpoint", None).await;
            }
            RemoteEvent::Step(_) => {
                self.invalidate_stop_state().await;
                self.sink.stopped("step", None).await;
            }
            RemoteEvent::End => {
                log::info!(target: "session", "remote run finished");
                self.sink.terminated().await;
                self.sink.exited(0).await;
                let remote = self.remote.lock().unwrap().clone();
                if let Some(remote) = remote {
                    remote.terminate().await;
                }
                self.terminated.store(true, Ordering::SeqCst);
            }
            RemoteEvent::Error(exc) => {
                self.record_exception(exc, false).await;
            }
            RemoteEvent::Syntax(exc) => {
                self.record_exception(exc, true).await;
            }
            RemoteEvent::Output(chunk) => {
                let category = chunk.category.as_deref().unwrap_or("stdout").to_string();
                self.sink.output(&category, chunk.data).await;
            }
        }
    }

    /// Runtime exceptions and syntax errors arrive as two distinct remote
    /// events but present as one DAP exception stop.
    async fn record_exception(&self, exc: RemoteException, compile_error: bool) {
        self.invalidate_stop_state().await;
        let description = exc.description.clone();
        self.state.lock().await.exception = Some(ExceptionState {
            description: exc.description,
            line: exc.line,
            module: exc.module,
            compile_error,
        });
        self.sink.stopped("exception", Some(description)).await;
    }

    async fn invalidate_stop_state(&self) {
        self.stack.dirty.store(true, Ordering::SeqCst);
        self.state.lock().await.scope_cache.clear();
    }

    async fn on_channel_error(self: Arc<Self>, error: Error) {
        log::error!(target: "session", "channel error: {error}");
        if !error.is_fatal() {
            return;
        }
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink
            .output("console", format!("connection to the server lost: {error}\n"))
            .await;
        self.sink.terminated().await;
    }

    fn remote(&self) -> Result<Arc<RemoteClient>, Error> {
        self.remote
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotLaunched)
    }
}

fn frame_json(frame: &CachedFrame) -> Value {
    let mut value = json!({
        "id": frame.id,
        "name": frame.name,
        "line": frame.line.unwrap_or(0),
        "column": if frame.line.is_some() { 1 } else { 0 },
    });
    match &frame.source {
        Some(source) => {
            value["source"] = json!({
                "name": source.name,
                "path": source.path,
                "sourceReference": source.reference,
            });
        }
        None => {
            value["presentationHint"] = json!("subtle");
        }
    }
    value
}

fn variable_json(frame_id: u32, var: &proto::RawVariable) -> Value {
    let (value, reference) = render_variable(frame_id, var);
    json!({
        "name": var.name,
        "value": value,
        "type": var.ty,
        "variablesReference": reference,
    })
}

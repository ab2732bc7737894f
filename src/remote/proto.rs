//! Typed view of the remote surface. The `data` field of a frame changes
//! shape with the call or event name, so every payload is decoded into a
//! concrete type here before the session sees it.

use crate::error::Error;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::str::FromStr;
use strum_macros::{AsRefStr, EnumString};

/// Remote functions consumed by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum RemoteFn {
    Login,
    ParseScriptWithDebug,
    RunScriptWithDebug,
    SetBreaks,
    SetAllExceptionBreak,
    StackTrace,
    GetStackVariables,
    GetVariable,
    ContinueRun,
    PauseRun,
    StepOver,
    StepInto,
    StepOut,
    StopRun,
    SourceRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteEventKind {
    Breakpoint,
    Step,
    End,
    Error,
    Syntax,
    Output,
}

impl RemoteEventKind {
    /// `ERROR` and `SYNTAX` intentionally carry failure payloads; for every
    /// other event a non-OK status is a protocol violation.
    pub fn carries_failure(&self) -> bool {
        matches!(self, RemoteEventKind::Error | RemoteEventKind::Syntax)
    }
}

/// A decoded server push.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    Breakpoint(StopPosition),
    Step(StopPosition),
    End,
    Error(RemoteException),
    Syntax(RemoteException),
    Output(OutputChunk),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StopPosition {
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub module: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RemoteException {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub module: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OutputChunk {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub category: Option<String>,
}

pub fn decode_event(name: &str, data: Value) -> Result<RemoteEvent, Error> {
    let kind = RemoteEventKind::from_str(name)
        .map_err(|_| Error::UnknownEvent(name.to_string()))?;
    let event = match kind {
        RemoteEventKind::Breakpoint => RemoteEvent::Breakpoint(typed("BREAKPOINT", data)?),
        RemoteEventKind::Step => RemoteEvent::Step(typed("STEP", data)?),
        RemoteEventKind::End => RemoteEvent::End,
        RemoteEventKind::Error => RemoteEvent::Error(typed("ERROR", data)?),
        RemoteEventKind::Syntax => RemoteEvent::Syntax(typed("SYNTAX", data)?),
        RemoteEventKind::Output => RemoteEvent::Output(output_chunk(data)?),
    };
    Ok(event)
}

/// `parseScriptWithDebug` returns the auxiliary modules the entry file
/// references.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ParseResult {
    #[serde(default)]
    pub modules: Vec<ModuleRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleRef {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// `setBreaks` answers with the subset of requested lines it accepted.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BreaksResult {
    #[serde(default)]
    pub lines: Vec<u64>,
}

/// One entry of the innermost-first `stackTrace` response. The last entry
/// is the shared-scope pseudo-frame and carries no line.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFrame {
    pub name: String,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub module: Option<String>,
}

/// A raw variable record as returned by `getStackVariables`/`getVariable`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawVariable {
    pub name: String,
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default, rename = "type")]
    pub ty: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

pub fn frames_from(data: Value) -> Result<Vec<RemoteFrame>, Error> {
    typed("stackTrace", data)
}

pub fn variables_from(data: Value) -> Result<Vec<RawVariable>, Error> {
    typed("getStackVariables", data)
}

pub fn variable_from(data: Value) -> Result<RawVariable, Error> {
    typed("getVariable", data)
}

pub fn parse_result_from(data: Value) -> Result<ParseResult, Error> {
    typed("parseScriptWithDebug", data)
}

pub fn breaks_result_from(data: Value) -> Result<BreaksResult, Error> {
    typed("setBreaks", data)
}

pub fn source_text_from(data: Value) -> Result<String, Error> {
    typed("sourceRequest", data)
}

fn typed<T: DeserializeOwned>(tag: &'static str, data: Value) -> Result<T, Error> {
    serde_json::from_value(data).map_err(|e| Error::UnexpectedPayload(tag, e))
}

/// Output arrives either as a bare string or as a `{data, category}` object.
fn output_chunk(data: Value) -> Result<OutputChunk, Error> {
    match data {
        Value::String(s) => Ok(OutputChunk {
            data: s,
            category: None,
        }),
        other => typed("OUTPUT", other),
    }
}

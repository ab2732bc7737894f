//! Module/content addressing. Every script module known to the session
//! gets a dense numeric handle (never reused within a session); content
//! and line splits are fetched lazily and cached. The registry is replaced
//! wholesale on restart, which is what keeps stale handles from leaking
//! across sessions.

use crate::error::Error;
use crate::remote::proto::{self, RemoteFn};
use crate::remote::RemoteClient;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BreakpointRecord {
    pub id: u64,
    pub line: u64,
    pub verified: bool,
}

#[derive(Debug)]
pub struct SourceEntry {
    pub reference: i64,
    pub name: String,
    pub path: PathBuf,
    content: Option<String>,
    lines: Option<Vec<String>>,
    pub breakpoints: Vec<BreakpointRecord>,
    consistent: Option<bool>,
}

#[derive(Default)]
pub struct SourceRegistry {
    entries: Vec<SourceEntry>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        SourceRegistry::default()
    }

    /// Register a module and assign the next handle. Handles are dense,
    /// monotonic and start at one (zero is reserved by the variable
    /// reference encoding).
    pub fn add(&mut self, name: &str, path: impl Into<PathBuf>) -> i64 {
        let reference = self.entries.len() as i64 + 1;
        self.entries.push(SourceEntry {
            reference,
            name: name.to_string(),
            path: path.into(),
            content: None,
            lines: None,
            breakpoints: vec![],
            consistent: None,
        });
        reference
    }

    pub fn entries(&self) -> impl Iterator<Item = &SourceEntry> {
        self.entries.iter()
    }

    pub fn get(&self, reference: i64) -> Result<&SourceEntry, Error> {
        self.entries
            .get(index_of(reference)?)
            .ok_or(Error::SourceNotFound(reference.to_string()))
    }

    pub fn by_name(&self, name: &str) -> Result<&SourceEntry, Error> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::SourceNotFound(name.to_string()))
    }

    /// Resolve an editor-supplied path against the registered sources.
    /// Paths are compared with normalized separators; a bare file-name
    /// match is accepted as a fallback.
    pub fn resolve_path(&self, path: &str) -> Result<i64, Error> {
        let requested = norm_path(path);
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| norm_path(&e.path.to_string_lossy()) == requested)
        {
            return Ok(entry.reference);
        }
        let file_name = Path::new(&requested).file_name();
        self.entries
            .iter()
            .find(|e| e.path.file_name() == file_name && file_name.is_some())
            .map(|e| e.reference)
            .ok_or_else(|| Error::NoSourceForPath(path.to_string()))
    }

    /// Preload content that was read locally (the entry script at launch).
    pub fn set_content(&mut self, reference: i64, text: String) -> Result<(), Error> {
        let idx = self.checked_index(reference)?;
        let entry = &mut self.entries[idx];
        entry.content = Some(text);
        entry.lines = None;
        Ok(())
    }

    /// Cached text, fetched from the server on first access.
    pub async fn content(
        &mut self,
        reference: i64,
        remote: &RemoteClient,
    ) -> Result<String, Error> {
        let idx = self.checked_index(reference)?;
        if self.entries[idx].content.is_none() {
            let name = self.entries[idx].name.clone();
            let data = remote
                .call(RemoteFn::SourceRequest, json!({ "name": name }))
                .await?;
            self.entries[idx].content = Some(proto::source_text_from(data)?);
        }
        Ok(self.entries[idx].content.clone().unwrap_or_default())
    }

    /// Cached newline split of the content.
    pub async fn lines(
        &mut self,
        reference: i64,
        remote: &RemoteClient,
    ) -> Result<Vec<String>, Error> {
        let idx = self.checked_index(reference)?;
        if self.entries[idx].lines.is_none() {
            let text = self.content(reference, remote).await?;
            self.entries[idx].lines = Some(text.lines().map(str::to_string).collect());
        }
        Ok(self.entries[idx].lines.clone().unwrap_or_default())
    }

    /// Replace the source's breakpoint list wholesale. The editor's
    /// `setBreakpoints` carries the complete set, never a delta.
    pub fn set_breakpoints(
        &mut self,
        reference: i64,
        records: Vec<BreakpointRecord>,
    ) -> Result<(), Error> {
        let idx = self.checked_index(reference)?;
        self.entries[idx].breakpoints = records;
        Ok(())
    }

    /// Snapshot of every source's breakpoint list, keyed by name. Taken
    /// before restart teardown and replayed against the fresh registry.
    pub fn breakpoint_snapshot(&self) -> Vec<(String, Vec<BreakpointRecord>)> {
        self.entries
            .iter()
            .filter(|e| !e.breakpoints.is_empty())
            .map(|e| (e.name.clone(), e.breakpoints.clone()))
            .collect()
    }

    /// Whether a consistency check already ran for this source.
    pub fn consistency_checked(&self, reference: i64) -> bool {
        index_of(reference)
            .ok()
            .and_then(|idx| self.entries.get(idx))
            .is_some_and(|e| e.consistent.is_some())
    }

    /// Compare the local file against the remote copy, once per session.
    /// The verdict is cached; a mismatch is a warning, never a failure.
    pub async fn check_consistency(
        &mut self,
        reference: i64,
        local_path: &Path,
        remote: &RemoteClient,
    ) -> Result<bool, Error> {
        let idx = self.checked_index(reference)?;
        if let Some(verdict) = self.entries[idx].consistent {
            return Ok(verdict);
        }
        let remote_text = self.content(reference, remote).await?;
        let local_text = tokio::fs::read_to_string(local_path).await?;
        let verdict = remote_text == local_text;
        self.entries[idx].consistent = Some(verdict);
        Ok(verdict)
    }

    fn checked_index(&self, reference: i64) -> Result<usize, Error> {
        let idx = index_of(reference)?;
        if idx >= self.entries.len() {
            return Err(Error::SourceNotFound(reference.to_string()));
        }
        Ok(idx)
    }
}

fn index_of(reference: i64) -> Result<usize, Error> {
    if reference < 1 {
        return Err(Error::SourceNotFound(reference.to_string()));
    }
    Ok((reference - 1) as usize)
}

fn norm_path(s: &str) -> String {
    s.replace('\\', "/")
}

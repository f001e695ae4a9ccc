//! Inline Python fragments rendered into temporary scripts.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    error::Result,
    process::python::{IMPORT_LINE, INIT_LINE, INPUT_LINE, OUTPUT_LINE},
    workspace::{Workspace, WorkspaceLease},
};

/// A source fragment plus the file it is materialized into for one call.
///
/// The rendered script binds `input` (when the call has input) and publishes
/// `output` (when the call expects output), so a fragment reads like:
///
/// ```python
/// values = sorted(input)
/// output = values
/// ```
#[derive(Debug)]
pub struct ScriptScope {
    source: String,
    lease: Option<WorkspaceLease>,
    path: Option<PathBuf>,
}

impl ScriptScope {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), lease: None, path: None }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Path of the materialized script, if initialized.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the rendered script once; later calls return the same path until
    /// [`clean`](Self::clean).
    pub fn initialize(
        &mut self,
        workspace: &Arc<Workspace>,
        has_input: bool,
        has_output: bool,
    ) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let mut lease = workspace.acquire()?;
        let path = lease.create_temp_file(&render(&self.source, has_input, has_output))?;
        self.lease = Some(lease);
        self.path = Some(path.clone());
        Ok(path)
    }

    /// Release the workspace lease, deleting this scope's file.
    pub fn clean(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release(true);
        }
        self.path = None;
    }
}

impl Drop for ScriptScope {
    fn drop(&mut self) {
        self.clean();
    }
}

/// Prologue, fragment, epilogue, in that order regardless of what the fragment contains.
pub fn render(source: &str, has_input: bool, has_output: bool) -> String {
    let mut script = String::with_capacity(source.len() + 128);
    script.push_str(IMPORT_LINE);
    script.push('\n');
    script.push_str(INIT_LINE);
    script.push('\n');
    if has_input {
        script.push_str(INPUT_LINE);
        script.push('\n');
    }
    script.push_str(source);
    if has_output {
        script.push('\n');
        script.push_str(OUTPUT_LINE);
    }
    script
}

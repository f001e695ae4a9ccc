//! Interpreter process management (startup/IO/health).

use std::{
    path::Path,
    process::Stdio,
};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::error::{BridgeError, Result};

pub mod python;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// A spawned interpreter with its three pipes taken out of the `Child`.
pub struct ProcessHandle {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Script argument as handed to the runtime.
///
/// Paths containing whitespace are wrapped in double quotes unless they are
/// already quoted. Only Windows needs this: there the argument is joined into a
/// single command line. Unix receives argv verbatim.
pub fn script_argument(script: &Path) -> String {
    let raw = script.to_string_lossy().into_owned();
    if cfg!(windows) {
        quote_if_spaced(&raw)
    } else {
        raw
    }
}

pub(crate) fn quote_if_spaced(raw: &str) -> String {
    let quoted = raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"');
    if !quoted && raw.chars().any(char::is_whitespace) {
        format!("\"{}\"", raw)
    } else {
        raw.to_string()
    }
}

/// Spawn `<runtime> <script>` with every stdio stream piped. No shell is
/// involved, and the child is killed if its handle is dropped.
pub fn start(runtime: &str, script: &Path, helper_dir: &Path) -> Result<ProcessHandle> {
    let mut cmd = Command::new(runtime);
    add_script_arg(&mut cmd, script);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);
    python::prepare_env(&mut cmd, helper_dir);

    let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
        runtime: runtime.to_string(),
        source,
    })?;
    debug!(runtime, script = %script.display(), pid = ?child.id(), "spawned interpreter");

    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    Ok(ProcessHandle { child, stdin, stdout, stderr })
}

#[cfg(windows)]
fn add_script_arg(cmd: &mut Command, script: &Path) {
    // raw_arg so an existing pair of quotes is not escaped a second time.
    cmd.raw_arg(script_argument(script));
}

#[cfg(not(windows))]
fn add_script_arg(cmd: &mut Command, script: &Path) {
    cmd.arg(script);
}

fn missing_pipe(name: &str) -> BridgeError {
    BridgeError::io(
        format!("child {} was not captured", name),
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe missing"),
    )
}

/// Run `<runtime> --version` and return what it printed, minus the trailing newline.
pub async fn version(runtime: &str) -> Result<String> {
    let mut cmd = Command::new(runtime);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let out = cmd.output().await.map_err(|e| BridgeError::RuntimeInvalid {
        runtime: runtime.to_string(),
        reason: e.to_string(),
    })?;
    if !out.status.success() {
        return Err(BridgeError::RuntimeInvalid {
            runtime: runtime.to_string(),
            reason: format!("`--version` exited with {}", out.status),
        });
    }

    // Python 2 reports its version on stderr.
    let text = if out.stdout.is_empty() { &out.stderr } else { &out.stdout };
    Ok(String::from_utf8_lossy(text)
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

/// Whether `runtime` can be started and answers `--version`.
pub async fn is_runtime_valid(runtime: &str) -> bool {
    match version(runtime).await {
        Ok(_) => true,
        Err(e) => {
            debug!(runtime, error = %e, "runtime probe failed");
            false
        }
    }
}

//! One interpreter process per call, framed over stdio.

use std::{
    fmt,
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncReadExt, BufReader},
    process::{Child, ChildStdout},
    sync::mpsc,
    task::JoinError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{frame, DiagnosticObserver, ExecutionResult};
use crate::{
    config::Config,
    error::{BridgeError, Result},
    process::{self, python, ProcessHandle},
    scope::ScriptScope,
    token::TokenGenerator,
    workspace::{Workspace, WorkspaceLease},
};

/// What the interpreter runs.
#[derive(Debug, Clone)]
pub enum Script {
    /// An existing script that drives the helper module itself.
    File(PathBuf),
    /// A fragment wrapped with the standard prologue/epilogue for each call.
    Inline(String),
}

/// Calls a Python script with one JSON input and one JSON output.
///
/// Every call spawns a fresh interpreter, sends a frame token followed by the
/// input, forwards whatever the script prints before echoing the token to the
/// registered observers, and then decodes the script's output.
pub struct ExecutionBridge {
    runtime: String,
    script: Script,
    workspace: Arc<Workspace>,
    timeout: Option<Duration>,
    tokens: TokenGenerator,
    observers: Vec<Arc<dyn DiagnosticObserver>>,
}

impl fmt::Debug for ExecutionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionBridge")
            .field("runtime", &self.runtime)
            .field("script", &self.script)
            .field("workspace", &self.workspace.root())
            .field("timeout", &self.timeout)
            .field("observers", &self.observers.len())
            .finish()
    }
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

/// The script for one call plus whatever keeps its files alive.
enum Materialized {
    File { path: PathBuf, lease: WorkspaceLease },
    Scope { path: PathBuf, scope: ScriptScope },
}

impl Materialized {
    fn script(&self) -> &Path {
        match self {
            Self::File { path, .. } | Self::Scope { path, .. } => path,
        }
    }

    fn helper_dir(&self) -> &Path {
        match self {
            Self::File { lease, .. } => lease.root(),
            Self::Scope { path, .. } => path.parent().unwrap_or(path),
        }
    }

    fn clean(self) {
        match self {
            Self::File { lease, .. } => lease.release(false),
            Self::Scope { mut scope, .. } => scope.clean(),
        }
    }
}

impl ExecutionBridge {
    pub fn new(script: Script) -> Self {
        Self {
            runtime: python::DEFAULT_RUNTIME.to_string(),
            script,
            workspace: Workspace::shared(),
            timeout: None,
            tokens: TokenGenerator::new(),
            observers: Vec::new(),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Script::File(path.into()))
    }

    pub fn from_source(source: impl Into<String>) -> Self {
        Self::new(Script::Inline(source.into()))
    }

    /// Runtime, workspace root and timeout taken from `cfg`. Fails if the
    /// shared workspace is busy under a different root.
    pub fn from_config(cfg: &Config, script: Script) -> Result<Self> {
        let workspace = Workspace::shared();
        workspace.configure(cfg.workspace_root())?;
        let mut bridge = Self::new(script).with_runtime(cfg.runtime()).with_workspace(workspace);
        bridge.timeout = cfg.timeout();
        Ok(bridge)
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_workspace(mut self, workspace: Arc<Workspace>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_observer(mut self, observer: impl DiagnosticObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Channel receiving every diagnostic line of every later call.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(Arc::new(move |line: &str| {
            let _ = tx.send(line.to_string());
        }));
        rx
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub async fn version(&self) -> Result<String> {
        process::version(&self.runtime).await
    }

    pub async fn is_runtime_valid(&self) -> bool {
        process::is_runtime_valid(&self.runtime).await
    }

    /// Send `input` and decode the script's output.
    pub async fn call_with<I, O>(&self, input: &I) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        expect_value(self.call::<I, serde_json::Value>(Some(input), true, None).await?.output)
    }

    /// Send `input`, expect nothing back.
    pub async fn send<I>(&self, input: &I) -> Result<()>
    where
        I: Serialize + ?Sized,
    {
        self.call::<I, serde_json::Value>(Some(input), false, None).await.map(|_| ())
    }

    /// Send nothing, decode the script's output.
    pub async fn fetch<O: DeserializeOwned>(&self) -> Result<O> {
        expect_value(self.call::<(), serde_json::Value>(None, true, None).await?.output)
    }

    /// Run the script without input or output.
    pub async fn run(&self) -> Result<()> {
        self.call::<(), serde_json::Value>(None, false, None).await.map(|_| ())
    }

    /// Blocking form of [`call`](Self::call). Drives the call on a private
    /// current-thread runtime, so it must not be used from async code.
    pub fn call_blocking<I, O>(
        &self,
        input: Option<&I>,
        expect_output: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExecutionResult<O>>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BridgeError::io("starting call runtime", e))?;
        rt.block_on(self.call(input, expect_output, cancel))
    }

    /// Run one call.
    ///
    /// Diagnostics reach observers before this returns, in the order the
    /// script wrote them, and are not withdrawn if the call then fails. The
    /// rendered script and workspace lease are released on every path.
    pub async fn call<I, O>(
        &self,
        input: Option<&I>,
        expect_output: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExecutionResult<O>>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(BridgeError::Cancelled);
        }
        let payload = frame::encode_input(input)?;
        let materialized = self.materialize(input.is_some(), expect_output)?;
        let outcome = self
            .execute(materialized.script(), materialized.helper_dir(), payload, expect_output, cancel)
            .await;
        materialized.clean();
        outcome
    }

    fn materialize(&self, has_input: bool, has_output: bool) -> Result<Materialized> {
        match &self.script {
            Script::File(path) => Ok(Materialized::File {
                path: path.clone(),
                lease: self.workspace.acquire()?,
            }),
            Script::Inline(source) => {
                let mut scope = ScriptScope::new(source.as_str());
                let path = scope.initialize(&self.workspace, has_input, has_output)?;
                Ok(Materialized::Scope { path, scope })
            }
        }
    }

    async fn execute<O: DeserializeOwned>(
        &self,
        script: &Path,
        helper_dir: &Path,
        payload: Vec<u8>,
        expect_output: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExecutionResult<O>> {
        let token = self.tokens.unique_string();
        let started = Instant::now();
        let ProcessHandle { mut child, stdin, stdout, mut stderr } =
            process::start(&self.runtime, script, helper_dir)?;

        // Input goes out on its own task and stderr is drained on another, so
        // neither side can stall on a full pipe while stdout is being read.
        let request_token = token.clone();
        let writer = tokio::spawn(async move {
            frame::write_request(stdin, &request_token, &payload).await
        });
        let errors = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await?;
            Ok::<_, io::Error>(String::from_utf8_lossy(&buf).into_owned())
        });

        // The pipe tasks are joined inside the race too: a grandchild holding
        // the inherited stderr open must not outlive the deadline.
        let stop_writer = writer.abort_handle();
        let stop_errors = errors.abort_handle();
        let finished = {
            let exchange = async {
                let (decoded, status) =
                    self.exchange::<O>(&mut child, stdout, &token, expect_output).await?;
                let elapsed = started.elapsed();
                let stderr = errors
                    .await
                    .map_err(join_failed)?
                    .map_err(|e| BridgeError::io("reading script stderr", e))?;
                let write_result = writer.await.map_err(join_failed)?;
                Ok::<_, BridgeError>((decoded, status, elapsed, stderr, write_result))
            };
            tokio::select! {
                biased;
                _ = cancelled(cancel) => Err(Interrupt::Cancelled),
                _ = deadline(self.timeout) => Err(Interrupt::TimedOut),
                res = exchange => Ok(res),
            }
        };

        let (decoded, status, elapsed, stderr, write_result) = match finished {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                stop_writer.abort();
                stop_errors.abort();
                terminate(&mut child).await;
                return Err(e);
            }
            Err(reason) => {
                stop_writer.abort();
                stop_errors.abort();
                terminate(&mut child).await;
                return Err(match reason {
                    Interrupt::Cancelled => {
                        info!(script = %script.display(), "call cancelled; interpreter killed");
                        BridgeError::Cancelled
                    }
                    Interrupt::TimedOut => {
                        let limit = self.timeout.unwrap_or_default();
                        info!(script = %script.display(), ?limit, "call timed out; interpreter killed");
                        BridgeError::Timeout(limit)
                    }
                });
            }
        };

        let exit_code = status.code();
        debug!(script = %script.display(), ?exit_code, ?elapsed, "interpreter exited");
        if exit_code != Some(0) {
            return Err(BridgeError::ExecutionFailure { exit_code, stderr });
        }

        match write_result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("script exited before reading all of its input");
            }
            Err(e) => return Err(BridgeError::io("writing script input", e)),
        }

        Ok(ExecutionResult { output: decoded?, elapsed, stderr, exit_code: 0 })
    }

    /// Drain diagnostics, read the payload, wait for exit. A payload decoding
    /// problem is returned inside the tuple so that the exit status still gets
    /// the final say.
    async fn exchange<O: DeserializeOwned>(
        &self,
        child: &mut Child,
        stdout: ChildStdout,
        token: &str,
        expect_output: bool,
    ) -> Result<(Result<Option<O>>, ExitStatus)> {
        let mut reader = BufReader::new(stdout);
        let echoed = frame::drain_diagnostics(&mut reader, token, |line| self.publish(line))
            .await
            .map_err(|e| BridgeError::io("reading script stdout", e))?;
        trace!(echoed, "diagnostic stream finished");

        let decoded = if expect_output {
            frame::read_payload::<_, O>(&mut reader, echoed)
                .await
                .map_err(|e| BridgeError::io("reading script output", e))?
                .map(Some)
        } else {
            let mut rest = Vec::new();
            reader
                .read_to_end(&mut rest)
                .await
                .map_err(|e| BridgeError::io("reading script stdout", e))?;
            if !rest.is_empty() {
                debug!(bytes = rest.len(), "discarding output of a call that expects none");
            }
            Ok(None)
        };

        let status = child
            .wait()
            .await
            .map_err(|e| BridgeError::io("waiting for interpreter", e))?;
        Ok((decoded, status))
    }

    fn publish(&self, line: &str) {
        trace!(target: "pybridge::diagnostics", "{}", line);
        for observer in &self.observers {
            observer.on_diagnostic(line);
        }
    }
}

/// A result-returning call needs an actual value; `null` counts as none.
fn expect_value<O: DeserializeOwned>(output: Option<serde_json::Value>) -> Result<O> {
    match output {
        None | Some(serde_json::Value::Null) => {
            Err(BridgeError::Deserialization("script published no output".to_string()))
        }
        Some(value) => {
            serde_json::from_value(value).map_err(|e| BridgeError::Deserialization(e.to_string()))
        }
    }
}

fn join_failed(e: JoinError) -> BridgeError {
    BridgeError::io("pipe task failed", io::Error::new(io::ErrorKind::Other, e))
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Kill the child and reap it so it is gone by the time the call returns.
async fn terminate(child: &mut Child) {
    // Already reaped: only a descendant was still holding a pipe.
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill interpreter: {}", e);
    }
}

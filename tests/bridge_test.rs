use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use pybridge::{BridgeError, CancellationToken, ExecutionBridge, Workspace};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;

async fn find_python() -> Option<String> {
    for candidate in ["python3", "python"] {
        if pybridge::is_runtime_valid(candidate).await {
            return Some(candidate.to_string());
        }
    }
    None
}

macro_rules! require_python {
    () => {
        match find_python().await {
            Some(runtime) => runtime,
            None => {
                println!("no python interpreter found, skipping");
                return Ok(());
            }
        }
    };
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

struct Fixture {
    _tmp: tempfile::TempDir,
    scripts: PathBuf,
    root: PathBuf,
    workspace: Arc<Workspace>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let scripts = tmp.path().join("scripts");
        fs::create_dir_all(&scripts).unwrap();
        let root = tmp.path().join("workspace");
        let workspace = Workspace::new(&root);
        Self { _tmp: tmp, scripts, root, workspace }
    }

    fn file(&self, runtime: &str, name: &str, body: &str) -> ExecutionBridge {
        ExecutionBridge::from_file(write_script(&self.scripts, name, body))
            .with_runtime(runtime)
            .with_workspace(Arc::clone(&self.workspace))
    }

    fn inline(&self, runtime: &str, source: &str) -> ExecutionBridge {
        ExecutionBridge::from_source(source)
            .with_runtime(runtime)
            .with_workspace(Arc::clone(&self.workspace))
    }

    fn assert_clean(&self) {
        assert_eq!(self.workspace.active_count(), 0);
        assert!(!self.root.exists(), "workspace left behind");
    }
}

const ECHO: &str = "import pybridge\npybridge.init_environment()\ndata = pybridge.get_input()\npybridge.set_output(data)\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Weather {
    temp: f64,
    description: String,
}

#[tokio::test]
async fn test_echo_weather_round_trip() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.file(&python, "echo.py", ECHO);

    let weather = Weather { temp: 22.5, description: "Warm".to_string() };
    let back: Weather = bridge.call_with(&weather).await?;
    assert_eq!(back, weather);

    let raw: Value = bridge.call_with(&json!({"temp": 22.5, "description": "Warm"})).await?;
    assert_eq!(raw, json!({"temp": 22.5, "description": "Warm"}));
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_echo_various_values() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.file(&python, "echo.py", ECHO);

    for value in [
        json!(null),
        json!(0),
        json!("line one\nline two"),
        json!([1, [2, [3]], {"k": "v"}]),
        json!({"unicode": "héllo ✓", "nested": {"empty": []}}),
    ] {
        let res = bridge.call::<Value, Value>(Some(&value), true, None).await?;
        assert_eq!(res.output, Some(value));
        assert_eq!(res.exit_code, 0);
    }
    Ok(())
}

#[tokio::test]
async fn test_sort_script() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.file(
        &python,
        "sort.py",
        "import pybridge\npybridge.init_environment()\nvalues = pybridge.get_input()\nvalues.sort()\npybridge.set_output(values)\n",
    );

    let sorted: Vec<f64> = bridge.call_with(&vec![3.0, 1.0, 2.0]).await?;
    assert_eq!(sorted, vec![1.0, 2.0, 3.0]);
    Ok(())
}

#[tokio::test]
async fn test_inline_sort_then_add() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.inline(
        &python,
        "values = sorted(input)\noutput = [a + b for a, b in zip(values, [10.0, 8.0, 15.0])]",
    );

    let out: Vec<f64> = bridge.call_with(&[5.0, 2.0, 3.0]).await?;
    assert_eq!(out, vec![12.0, 11.0, 20.0]);
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_diagnostics_without_io() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let mut bridge = fx.inline(&python, "print('hello')\nprint('world')");
    let mut rx = bridge.subscribe();

    let res = bridge.call::<(), Value>(None, false, None).await?;
    assert!(res.output.is_none());
    assert_eq!(rx.try_recv()?, "hello");
    assert_eq!(rx.try_recv()?, "world");
    assert!(rx.try_recv().is_err());
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_diagnostics_in_order_and_token_hidden() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let bridge = fx
        .inline(&python, "for i in range(50):\n    print('line %d' % i)\noutput = input * 2")
        .with_observer(move |line: &str| sink.lock().unwrap().push(line.to_string()));

    let doubled: i64 = bridge.call_with(&21).await?;
    assert_eq!(doubled, 42);

    let expected: Vec<String> = (0..50).map(|i| format!("line {}", i)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
    Ok(())
}

#[tokio::test]
async fn test_nonzero_exit_carries_stderr() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let mut bridge = fx.file(
        &python,
        "fail.py",
        "import sys\nprint('before failing')\nsys.stderr.write('boom: bad input\\nsecond line\\n')\nsys.exit(3)\n",
    );
    let mut rx = bridge.subscribe();

    match bridge.call::<i32, Value>(Some(&1), true, None).await {
        Err(BridgeError::ExecutionFailure { exit_code, stderr }) => {
            assert_eq!(exit_code, Some(3));
            assert_eq!(stderr, "boom: bad input\nsecond line\n");
        }
        other => panic!("unexpected: {:?}", other),
    }
    // Diagnostics delivered before the failure stay delivered.
    assert_eq!(rx.try_recv()?, "before failing");
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_failure_after_output_is_still_failure() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.file(
        &python,
        "late_exit.py",
        "import sys, pybridge\npybridge.init_environment()\npybridge.set_output(pybridge.get_input())\nsys.exit(2)\n",
    );

    let err = bridge.call_with::<_, Value>(&[1, 2]).await.unwrap_err();
    assert!(matches!(err, BridgeError::ExecutionFailure { exit_code: Some(2), .. }), "{:?}", err);
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_traceback_is_passed_through() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.inline(&python, "output = input\nraise ValueError('late')");

    let err = bridge.call_with::<_, Value>(&[1, 2]).await.unwrap_err();
    assert!(matches!(err, BridgeError::ExecutionFailure { exit_code: Some(1), .. }));
    let text = err.to_string();
    assert!(text.starts_with("Traceback (most recent call last):"), "{}", text);
    assert!(text.trim_end().ends_with("ValueError: late"), "{}", text);
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_missing_output_is_deserialization_error() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.file(&python, "silent.py", "print('nothing to see')\n");

    let err = bridge.fetch::<Value>().await.unwrap_err();
    assert!(matches!(err, BridgeError::Deserialization(_)), "{:?}", err);
    Ok(())
}

#[tokio::test]
async fn test_null_output_is_deserialization_error() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();

    let err = fx.inline(&python, "output = None").fetch::<Value>().await.unwrap_err();
    assert!(matches!(err, BridgeError::Deserialization(_)), "{:?}", err);

    let echo = fx.file(&python, "echo.py", ECHO);
    let err = echo.call_with::<_, Value>(&json!(null)).await.unwrap_err();
    assert!(matches!(err, BridgeError::Deserialization(_)), "{:?}", err);

    // The full form still reports what was published.
    let res = echo.call::<Value, Value>(Some(&json!(null)), true, None).await?;
    assert_eq!(res.output, Some(Value::Null));
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_shape_mismatch_is_deserialization_error() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.inline(&python, "output = {'not': 'a list'}");

    let err = bridge.fetch::<Vec<f64>>().await.unwrap_err();
    assert!(matches!(err, BridgeError::Deserialization(_)), "{:?}", err);
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_helper_falls_back_to_attributes() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.file(
        &python,
        "weather.py",
        "import pybridge as csc\n\
         class Weather(object):\n    def __init__(self, temp, description):\n        self.temp = temp\n        self.description = description\n\
         csc.init_environment()\n\
         w = Weather(**csc.get_input())\n\
         w.temp += 12.5\n\
         w.description = 'Too hot'\n\
         csc.set_output(w)\n",
    );

    let hot: Weather = bridge.call_with(&Weather { temp: 22.5, description: "Warm".into() }).await?;
    assert_eq!(hot, Weather { temp: 35.0, description: "Too hot".into() });
    Ok(())
}

#[tokio::test]
async fn test_helper_calls_are_once_only() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.file(
        &python,
        "twice.py",
        "import pybridge\npybridge.init_environment()\nfirst = pybridge.get_input()\nsecond = pybridge.get_input()\n\
         pybridge.set_output({'first': first, 'second': second})\npybridge.set_output('ignored')\n",
    );

    let out: Value = bridge.call_with(&"payload").await?;
    assert_eq!(out, json!({"first": "payload", "second": null}));
    Ok(())
}

#[tokio::test]
async fn test_helper_requires_init() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.file(&python, "noinit.py", "import pybridge\npybridge.set_output(1)\n");

    let err = bridge.fetch::<i32>().await.unwrap_err();
    assert!(err.to_string().contains("has not been initialized"), "{}", err);
    Ok(())
}

#[tokio::test]
async fn test_success_keeps_stderr_and_timing() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.inline(&python, "import sys\nsys.stderr.write('just a warning\\n')\noutput = 1");

    let res = bridge.call::<(), i32>(None, true, None).await?;
    assert_eq!(res.output, Some(1));
    assert_eq!(res.stderr, "just a warning\n");
    assert!(res.elapsed > Duration::ZERO);
    Ok(())
}

#[tokio::test]
async fn test_timeout_kills_script() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx
        .inline(&python, "import time\ntime.sleep(30)")
        .with_timeout(Duration::from_millis(500));

    let started = std::time::Instant::now();
    let err = bridge.run().await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(d) if d == Duration::from_millis(500)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(10));
    fx.assert_clean();
    Ok(())
}

const DETACHED_SLEEPER: &str = "import subprocess, sys\n\
subprocess.Popen([sys.executable, '-c', 'import time; time.sleep(8)'], stdin=subprocess.DEVNULL, stdout=subprocess.DEVNULL)";

#[tokio::test]
async fn test_timeout_covers_inherited_stderr() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.inline(&python, DETACHED_SLEEPER).with_timeout(Duration::from_millis(1000));

    let started = std::time::Instant::now();
    let err = bridge.run().await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_cancellation_covers_inherited_stderr() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = fx.inline(&python, DETACHED_SLEEPER);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let res = bridge.call::<(), Value>(None, false, Some(&cancel)).await;
    assert!(matches!(res, Err(BridgeError::Cancelled)), "{:?}", res);
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_cancellation_kills_script() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let mut bridge = fx.inline(&python, "import os, time\nprint(os.getpid())\ntime.sleep(30)");
    let mut rx = bridge.subscribe();
    let bridge = Arc::new(bridge);

    let cancel = CancellationToken::new();
    let task = {
        let bridge = Arc::clone(&bridge);
        let cancel = cancel.clone();
        tokio::spawn(async move { bridge.call::<(), Value>(None, false, Some(&cancel)).await })
    };

    let pid: u32 = timeout(Duration::from_secs(10), rx.recv())
        .await?
        .expect("script printed its pid")
        .trim()
        .parse()?;
    cancel.cancel();

    let res = timeout(Duration::from_secs(10), task).await??;
    assert!(matches!(res, Err(BridgeError::Cancelled)), "{:?}", res);
    #[cfg(target_os = "linux")]
    assert!(!Path::new(&format!("/proc/{}", pid)).exists(), "child {} still running", pid);
    let _ = pid;
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_already_cancelled_does_not_spawn() -> Result<()> {
    let fx = Fixture::new();
    let bridge = fx.inline("pybridge-no-such-interpreter", "output = 1");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let res = bridge.call::<(), i32>(None, true, Some(&cancel)).await;
    assert!(matches!(res, Err(BridgeError::Cancelled)));
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_spawn_failure_releases_scope() -> Result<()> {
    let fx = Fixture::new();
    let bridge = fx.inline("pybridge-no-such-interpreter", "output = 1");

    let err = bridge.fetch::<i32>().await.unwrap_err();
    assert!(matches!(err, BridgeError::Spawn { .. }), "{:?}", err);
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_large_payload_with_chatty_script() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let mut bridge = fx.file(
        &python,
        "chatty.py",
        "import pybridge\npybridge.init_environment()\n\
         for i in range(20000):\n    print('x' * 100)\n\
         data = pybridge.get_input()\n\
         pybridge.set_output(len(data))\n",
    );
    let mut rx = bridge.subscribe();

    let input: Vec<f64> = (0..300_000).map(|i| i as f64 * 0.5).collect();
    let count: usize = timeout(Duration::from_secs(60), bridge.call_with(&input)).await??;
    assert_eq!(count, input.len());

    let mut lines = 0;
    while rx.try_recv().is_ok() {
        lines += 1;
    }
    assert_eq!(lines, 20000);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_share_workspace() -> Result<()> {
    let python = require_python!();
    let fx = Fixture::new();
    let bridge = Arc::new(fx.inline(&python, "import time\ntime.sleep(0.2)\noutput = input + 1"));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.call_with::<_, i64>(&i).await })
        })
        .collect();

    for (i, h) in handles.into_iter().enumerate() {
        assert_eq!(h.await??, i as i64 + 1);
    }
    fx.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_runtime_version() -> Result<()> {
    let python = require_python!();
    let bridge = ExecutionBridge::from_source("pass").with_runtime(&python);
    let version = bridge.version().await?;
    assert!(version.starts_with("Python"), "{}", version);
    assert!(!version.ends_with('\n'));
    assert!(bridge.is_runtime_valid().await);
    Ok(())
}

#[test]
fn test_call_blocking() -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let python = match rt.block_on(find_python()) {
        Some(p) => p,
        None => {
            println!("no python interpreter found, skipping");
            return Ok(());
        }
    };
    drop(rt);

    let fx = Fixture::new();
    let bridge = fx.inline(&python, "output = [x * x for x in input]");
    let res = bridge.call_blocking::<_, Vec<i32>>(Some(&[1, 2, 3]), true, None)?;
    assert_eq!(res.output, Some(vec![1, 4, 9]));
    fx.assert_clean();
    Ok(())
}
